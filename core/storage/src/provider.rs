//! Source and destination provider traits.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

use skyferry_common::{Origin, RemotePath, Result, SourceFile};

/// Byte stream type for download/upload operations.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// One page of a source listing.
#[derive(Debug, Clone, Default)]
pub struct SourcePage {
    /// Files on this page, in listing order.
    pub files: Vec<SourceFile>,
    /// Continuation token; `None` means the listing is exhausted.
    pub next_page_token: Option<String>,
}

/// A folder in the source hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderNode {
    /// Folder ID.
    pub id: String,
    /// Folder name.
    pub name: String,
    /// Primary parent, if the folder has one.
    pub parent_id: Option<String>,
}

/// Metadata of an object created at the destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadedItem {
    /// Destination object ID.
    pub id: String,
    /// Object name.
    pub name: String,
    /// Size in bytes as reported by the destination.
    #[serde(default)]
    pub size: Option<u64>,
}

/// What the destination does when the target name already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictBehavior {
    /// Overwrite the existing object.
    Replace,
    /// Refuse the upload.
    Fail,
}

impl ConflictBehavior {
    /// Wire value.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictBehavior::Replace => "replace",
            ConflictBehavior::Fail => "fail",
        }
    }
}

/// An open resumable upload session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    /// URL that receives the byte-range chunks.
    pub upload_url: String,
    /// When the destination discards the session.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Byte range of one chunk within an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    /// First byte offset.
    pub start: u64,
    /// Last byte offset, inclusive.
    pub end: u64,
    /// Total object size, if already known.
    pub total: Option<u64>,
}

impl ChunkRange {
    /// Number of bytes in the range.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// A range always covers at least one byte.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// `Content-Range` header value, e.g. `bytes 0-327679/1048576`.
    pub fn header_value(&self) -> String {
        match self.total {
            Some(total) => format!("bytes {}-{}/{}", self.start, self.end, total),
            None => format!("bytes {}-{}/*", self.start, self.end),
        }
    }
}

/// Result of sending one chunk.
#[derive(Debug, Clone)]
pub enum ChunkOutcome {
    /// The destination accepted the chunk and expects more (202).
    Continue,
    /// The final chunk was accepted and the object was created.
    Complete(UploadedItem),
}

/// A cloud service files are migrated from.
///
/// Implementations must handle their own authentication.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Which service this provider reads.
    fn origin(&self) -> Origin;

    /// Fetch one page of the listing.
    ///
    /// # Errors
    /// - Network/authentication errors
    async fn list_page(&self, page_token: Option<&str>, page_size: u32) -> Result<SourcePage>;

    /// Fetch a single file descriptor by ID.
    async fn get_file(&self, file_id: &str) -> Result<SourceFile>;

    /// Size of the file content in bytes, asking the service when the listing
    /// did not report it.
    async fn content_length(&self, file: &SourceFile) -> Result<Option<u64>>;

    /// Open a stream over the file content.
    async fn download_stream(&self, file: &SourceFile) -> Result<ByteStream>;

    /// Delete the file at the source.
    ///
    /// # Errors
    /// - Permission denied when the service does not allow deletion
    async fn delete(&self, file_id: &str) -> Result<()>;
}

/// Access to the folder hierarchy of a source.
#[async_trait]
pub trait HierarchyLookup: Send + Sync {
    /// Fetch a folder's name and primary parent.
    async fn folder_node(&self, folder_id: &str) -> Result<FolderNode>;
}

/// The cloud service files are migrated into.
#[async_trait]
pub trait DestinationProvider: Send + Sync {
    /// ID of the destination drive root.
    fn root_id(&self) -> &str;

    /// Look up the folder called `name` directly inside `parent_id`.
    ///
    /// # Errors
    /// - `NotFound` if no such folder exists
    async fn child_folder(&self, parent_id: &str, name: &str) -> Result<String>;

    /// Names of all immediate children of a folder.
    async fn list_children(&self, folder_id: &str) -> Result<Vec<String>>;

    /// Upload a small object in a single request.
    ///
    /// `folder` is relative to the drive root; missing folders are created.
    async fn upload_simple(
        &self,
        folder: &RemotePath,
        name: &str,
        body: ByteStream,
        size_hint: Option<u64>,
    ) -> Result<UploadedItem>;

    /// Open a resumable upload session for `folder/name`.
    async fn create_upload_session(
        &self,
        folder: &RemotePath,
        name: &str,
        conflict: ConflictBehavior,
    ) -> Result<UploadSession>;

    /// Send one chunk of an upload session.
    async fn upload_chunk(
        &self,
        session: &UploadSession,
        range: ChunkRange,
        data: Bytes,
    ) -> Result<ChunkOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_range_known_total() {
        let range = ChunkRange {
            start: 0,
            end: 327_679,
            total: Some(1_048_576),
        };
        assert_eq!(range.header_value(), "bytes 0-327679/1048576");
        assert_eq!(range.len(), 327_680);
    }

    #[test]
    fn test_content_range_unknown_total() {
        let range = ChunkRange {
            start: 10,
            end: 19,
            total: None,
        };
        assert_eq!(range.header_value(), "bytes 10-19/*");
    }

    #[test]
    fn test_conflict_behavior_wire_value() {
        assert_eq!(ConflictBehavior::Replace.as_str(), "replace");
        assert_eq!(ConflictBehavior::Fail.as_str(), "fail");
        assert_eq!(
            serde_json::to_string(&ConflictBehavior::Replace).unwrap(),
            "\"replace\""
        );
    }

    #[test]
    fn test_uploaded_item_serialization() {
        let item: UploadedItem =
            serde_json::from_str(r#"{"id":"A1","name":"x.jpg","size":12}"#).unwrap();
        assert_eq!(item.id, "A1");
        assert_eq!(item.size, Some(12));
    }
}
