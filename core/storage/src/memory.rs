//! In-memory source and destination for testing.
//!
//! Both fakes count remote calls so tests can assert on round trips, and
//! accept injected failures.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

use skyferry_common::{Error, Origin, RemotePath, Result, SourceFile};

use crate::provider::{
    ByteStream, ChunkOutcome, ChunkRange, ConflictBehavior, DestinationProvider, FolderNode,
    HierarchyLookup, SourcePage, SourceProvider, UploadSession, UploadedItem,
};

/// Piece size of download streams; small so uploads see many pieces.
const STREAM_PIECE: usize = 64 * 1024;

/// In-memory source provider.
///
/// Files are listed in insertion order. Page tokens are offsets.
pub struct MemorySource {
    origin: Origin,
    files: Vec<(SourceFile, Bytes)>,
    folders: HashMap<String, FolderNode>,
    failing_downloads: HashSet<String>,
    listing_failure_at: Option<usize>,
    reject_credentials: bool,
    allow_delete: bool,
    deleted: Mutex<Vec<String>>,
    list_calls: AtomicUsize,
    folder_lookups: AtomicUsize,
    downloads: AtomicUsize,
}

impl MemorySource {
    /// Create an empty source.
    pub fn new(origin: Origin) -> Self {
        Self {
            origin,
            files: Vec::new(),
            folders: HashMap::new(),
            failing_downloads: HashSet::new(),
            listing_failure_at: None,
            reject_credentials: false,
            allow_delete: true,
            deleted: Mutex::new(Vec::new()),
            list_calls: AtomicUsize::new(0),
            folder_lookups: AtomicUsize::new(0),
            downloads: AtomicUsize::new(0),
        }
    }

    /// Add a file with its content. `file.size` is left as given, so a
    /// `None` size exercises the unknown-size path.
    pub fn with_file(mut self, file: SourceFile, content: impl Into<Bytes>) -> Self {
        self.files.push((file, content.into()));
        self
    }

    /// Add a folder to the hierarchy.
    pub fn with_folder(mut self, id: &str, name: &str, parent_id: Option<&str>) -> Self {
        self.folders.insert(
            id.to_string(),
            FolderNode {
                id: id.to_string(),
                name: name.to_string(),
                parent_id: parent_id.map(String::from),
            },
        );
        self
    }

    /// Make downloads of `file_id` fail.
    pub fn fail_download(mut self, file_id: &str) -> Self {
        self.failing_downloads.insert(file_id.to_string());
        self
    }

    /// Make the listing call for page `index` (zero-based) fail.
    pub fn fail_listing_at(mut self, index: usize) -> Self {
        self.listing_failure_at = Some(index);
        self
    }

    /// Answer every call as if the credential had been revoked.
    pub fn reject_credentials(mut self) -> Self {
        self.reject_credentials = true;
        self
    }

    /// Refuse deletions, like a read-only library.
    pub fn deny_delete(mut self) -> Self {
        self.allow_delete = false;
        self
    }

    /// IDs deleted so far, in order.
    pub async fn deleted(&self) -> Vec<String> {
        self.deleted.lock().await.clone()
    }

    /// Number of listing calls made.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Number of folder lookups made.
    pub fn folder_lookups(&self) -> usize {
        self.folder_lookups.load(Ordering::SeqCst)
    }

    /// Number of downloads opened.
    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    fn check_credentials(&self) -> Result<()> {
        if self.reject_credentials {
            return Err(Error::AuthenticationRejected(
                "Invalid or expired token".to_string(),
            ));
        }
        Ok(())
    }

    fn find(&self, file_id: &str) -> Result<&(SourceFile, Bytes)> {
        self.files
            .iter()
            .find(|(f, _)| f.id == file_id)
            .ok_or_else(|| Error::NotFound(format!("File not found: {}", file_id)))
    }
}

#[async_trait]
impl SourceProvider for MemorySource {
    fn origin(&self) -> Origin {
        self.origin
    }

    async fn list_page(&self, page_token: Option<&str>, page_size: u32) -> Result<SourcePage> {
        let call = self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.check_credentials()?;
        if self.listing_failure_at == Some(call) {
            return Err(Error::Network("Injected listing failure".to_string()));
        }

        let offset: usize = match page_token {
            Some(token) => token
                .parse()
                .map_err(|_| Error::InvalidInput(format!("Bad page token: {}", token)))?,
            None => 0,
        };
        let end = (offset + page_size.max(1) as usize).min(self.files.len());
        let files = self.files[offset.min(end)..end]
            .iter()
            .map(|(f, _)| f.clone())
            .collect();

        Ok(SourcePage {
            files,
            next_page_token: (end < self.files.len()).then(|| end.to_string()),
        })
    }

    async fn get_file(&self, file_id: &str) -> Result<SourceFile> {
        self.check_credentials()?;
        Ok(self.find(file_id)?.0.clone())
    }

    async fn content_length(&self, file: &SourceFile) -> Result<Option<u64>> {
        self.check_credentials()?;
        if file.size.is_some() {
            return Ok(file.size);
        }
        Ok(Some(self.find(&file.id)?.1.len() as u64))
    }

    async fn download_stream(&self, file: &SourceFile) -> Result<ByteStream> {
        self.check_credentials()?;
        self.downloads.fetch_add(1, Ordering::SeqCst);
        if self.failing_downloads.contains(&file.id) {
            return Err(Error::Network(format!(
                "Injected download failure for {}",
                file.id
            )));
        }

        let content = self.find(&file.id)?.1.clone();
        let pieces: Vec<Result<Bytes>> = (0..content.len())
            .step_by(STREAM_PIECE)
            .map(|start| Ok(content.slice(start..(start + STREAM_PIECE).min(content.len()))))
            .collect();
        Ok(Box::pin(stream::iter(pieces)))
    }

    async fn delete(&self, file_id: &str) -> Result<()> {
        self.check_credentials()?;
        if !self.allow_delete {
            return Err(Error::PermissionDenied("Deletion not allowed".to_string()));
        }
        self.find(file_id)?;
        self.deleted.lock().await.push(file_id.to_string());
        Ok(())
    }
}

#[async_trait]
impl HierarchyLookup for MemorySource {
    async fn folder_node(&self, folder_id: &str) -> Result<FolderNode> {
        self.folder_lookups.fetch_add(1, Ordering::SeqCst);
        self.check_credentials()?;
        self.folders
            .get(folder_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Folder not found: {}", folder_id)))
    }
}

/// Root folder ID of the in-memory destination.
const MEMORY_ROOT: &str = "root";

#[derive(Debug)]
struct SessionState {
    path: String,
    received: Vec<u8>,
}

#[derive(Debug, Default)]
struct DestinationState {
    /// Folder paths, slash joined; the root is `""`.
    folders: HashSet<String>,
    /// File contents keyed by slash joined path.
    files: BTreeMap<String, Bytes>,
    sessions: HashMap<String, SessionState>,
    ranges: Vec<ChunkRange>,
}

impl DestinationState {
    fn ensure_folders(&mut self, folder: &RemotePath) {
        let mut key = String::new();
        for component in folder.components() {
            key = join_key(&key, component);
            self.folders.insert(key.clone());
        }
    }

    fn store(&mut self, path: String, data: Bytes) -> UploadedItem {
        let name = path.rsplit('/').next().unwrap_or_default().to_string();
        let size = data.len() as u64;
        self.files.insert(path.clone(), data);
        UploadedItem {
            id: path,
            name,
            size: Some(size),
        }
    }
}

fn folder_path(id: &str) -> &str {
    if id == MEMORY_ROOT {
        ""
    } else {
        id
    }
}

fn join_key(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

/// In-memory destination provider.
///
/// Folder IDs are their slash joined paths. Upload sessions enforce
/// contiguous, non-overlapping ranges and complete when the declared total
/// has arrived.
pub struct MemoryDestination {
    state: Mutex<DestinationState>,
    failing_names: HashSet<String>,
    child_lookups: AtomicUsize,
    listings: AtomicUsize,
    simple_uploads: AtomicUsize,
    sessions_opened: AtomicUsize,
}

impl Default for MemoryDestination {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDestination {
    /// Create an empty destination.
    pub fn new() -> Self {
        let mut state = DestinationState::default();
        state.folders.insert(String::new());
        Self {
            state: Mutex::new(state),
            failing_names: HashSet::new(),
            child_lookups: AtomicUsize::new(0),
            listings: AtomicUsize::new(0),
            simple_uploads: AtomicUsize::new(0),
            sessions_opened: AtomicUsize::new(0),
        }
    }

    /// Make uploads of objects called `name` fail.
    pub fn fail_uploads_of(mut self, name: &str) -> Self {
        self.failing_names.insert(name.to_string());
        self
    }

    /// Place a file directly, creating its folders.
    pub async fn seed_file(&self, path: &str, content: impl Into<Bytes>) -> Result<()> {
        let path = RemotePath::parse(path)?;
        let mut state = self.state.lock().await;
        if let Some(parent) = path.parent() {
            state.ensure_folders(&parent);
        }
        state.store(path.as_key(), content.into());
        Ok(())
    }

    /// Content stored at `path`, if any.
    pub async fn file(&self, path: &str) -> Option<Bytes> {
        self.state.lock().await.files.get(path).cloned()
    }

    /// All stored file paths, sorted.
    pub async fn paths(&self) -> Vec<String> {
        self.state.lock().await.files.keys().cloned().collect()
    }

    /// Every chunk range received so far, in arrival order.
    pub async fn chunk_ranges(&self) -> Vec<ChunkRange> {
        self.state.lock().await.ranges.clone()
    }

    /// Number of folder lookups made.
    pub fn child_lookups(&self) -> usize {
        self.child_lookups.load(Ordering::SeqCst)
    }

    /// Number of folder listings made.
    pub fn listings(&self) -> usize {
        self.listings.load(Ordering::SeqCst)
    }

    /// Number of single-request uploads.
    pub fn simple_uploads(&self) -> usize {
        self.simple_uploads.load(Ordering::SeqCst)
    }

    /// Number of upload sessions opened.
    pub fn sessions_opened(&self) -> usize {
        self.sessions_opened.load(Ordering::SeqCst)
    }

    fn check_name(&self, name: &str) -> Result<()> {
        if self.failing_names.contains(name) {
            return Err(Error::Network(format!("Injected upload failure for {}", name)));
        }
        Ok(())
    }
}

#[async_trait]
impl DestinationProvider for MemoryDestination {
    fn root_id(&self) -> &str {
        MEMORY_ROOT
    }

    async fn child_folder(&self, parent_id: &str, name: &str) -> Result<String> {
        self.child_lookups.fetch_add(1, Ordering::SeqCst);
        let key = join_key(folder_path(parent_id), name);
        let state = self.state.lock().await;
        if state.folders.contains(&key) {
            Ok(key)
        } else {
            Err(Error::NotFound(format!("Folder not found: {}", key)))
        }
    }

    async fn list_children(&self, folder_id: &str) -> Result<Vec<String>> {
        self.listings.fetch_add(1, Ordering::SeqCst);
        let parent = folder_path(folder_id);
        let state = self.state.lock().await;

        let is_child = |path: &String| match path.rsplit_once('/') {
            Some((p, _)) => p == parent,
            None => parent.is_empty() && !path.is_empty(),
        };
        let name_of = |path: &String| path.rsplit('/').next().unwrap_or_default().to_string();

        Ok(state
            .folders
            .iter()
            .chain(state.files.keys())
            .filter(|p| is_child(p))
            .map(name_of)
            .collect())
    }

    async fn upload_simple(
        &self,
        folder: &RemotePath,
        name: &str,
        mut body: ByteStream,
        size_hint: Option<u64>,
    ) -> Result<UploadedItem> {
        self.simple_uploads.fetch_add(1, Ordering::SeqCst);
        self.check_name(name)?;

        let mut data = Vec::new();
        while let Some(piece) = body.next().await {
            data.extend_from_slice(&piece?);
        }
        if let Some(expected) = size_hint {
            if data.len() as u64 != expected {
                return Err(Error::InvalidInput(format!(
                    "Body length {} does not match declared {}",
                    data.len(),
                    expected
                )));
            }
        }

        let mut state = self.state.lock().await;
        state.ensure_folders(folder);
        let path = folder.join(name)?.as_key();
        Ok(state.store(path, Bytes::from(data)))
    }

    async fn create_upload_session(
        &self,
        folder: &RemotePath,
        name: &str,
        conflict: ConflictBehavior,
    ) -> Result<UploadSession> {
        let n = self.sessions_opened.fetch_add(1, Ordering::SeqCst);
        self.check_name(name)?;

        let path = folder.join(name)?.as_key();
        let mut state = self.state.lock().await;
        if conflict == ConflictBehavior::Fail && state.files.contains_key(&path) {
            return Err(Error::InvalidInput(format!("{} already exists", path)));
        }

        state.ensure_folders(folder);
        let upload_url = format!("memory://upload/{}", n);
        state.sessions.insert(
            upload_url.clone(),
            SessionState {
                path,
                received: Vec::new(),
            },
        );

        Ok(UploadSession {
            upload_url,
            expires_at: None,
        })
    }

    async fn upload_chunk(
        &self,
        session: &UploadSession,
        range: ChunkRange,
        data: Bytes,
    ) -> Result<ChunkOutcome> {
        let mut state = self.state.lock().await;
        state.ranges.push(range);

        let entry = state
            .sessions
            .get_mut(&session.upload_url)
            .ok_or_else(|| Error::NotFound("Upload session not found".to_string()))?;

        if range.start != entry.received.len() as u64 || range.len() != data.len() as u64 {
            return Err(Error::InvalidInput(format!(
                "Range {} does not continue at byte {} with {} bytes",
                range.header_value(),
                entry.received.len(),
                data.len()
            )));
        }
        entry.received.extend_from_slice(&data);
        let received = entry.received.len() as u64;

        match range.total {
            Some(total) if received == total => {
                let finished = state
                    .sessions
                    .remove(&session.upload_url)
                    .ok_or_else(|| Error::NotFound("Upload session not found".to_string()))?;
                let item = state.store(finished.path, Bytes::from(finished.received));
                Ok(ChunkOutcome::Complete(item))
            }
            Some(total) if received > total => Err(Error::InvalidInput(format!(
                "Received {} bytes past declared total {}",
                received, total
            ))),
            _ => Ok(ChunkOutcome::Continue),
        }
    }
}
