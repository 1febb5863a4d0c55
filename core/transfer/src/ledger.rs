//! Durable record of transfer attempts.
//!
//! The ledger keeps two sets of [`TransferRecord`], succeeded and failed,
//! keyed by destination path. Each set lives in its own JSON array file and
//! both are replaced atomically on [`TransferLedger::persist`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info};

use skyferry_common::{Origin, RemotePath, Result};

/// File holding the succeeded set.
pub const SUCCEEDED_FILE: &str = "uploaded.json";
/// File holding the failed set.
pub const FAILED_FILE: &str = "unuploaded.json";

/// Outcome of a concluded transfer attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    /// The destination has the object.
    #[default]
    Succeeded,
    /// The attempt failed; see the record's error.
    Failed,
}

/// One concluded transfer attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    /// Destination path relative to the base folder.
    #[serde(rename = "filepath")]
    pub destination_path: RemotePath,
    /// ID of the item at the source.
    #[serde(rename = "fileId")]
    pub source_file_id: String,
    /// Service the item came from.
    #[serde(rename = "from")]
    pub origin: Origin,
    /// Outcome of the attempt.
    #[serde(default)]
    pub status: TransferStatus,
    /// Error text of a failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TransferRecord {
    /// Record of a successful transfer.
    pub fn succeeded(
        destination_path: RemotePath,
        source_file_id: impl Into<String>,
        origin: Origin,
    ) -> Self {
        Self {
            destination_path,
            source_file_id: source_file_id.into(),
            origin,
            status: TransferStatus::Succeeded,
            error: None,
        }
    }

    /// Record of a failed transfer.
    pub fn failed(
        destination_path: RemotePath,
        source_file_id: impl Into<String>,
        origin: Origin,
        error: impl Into<String>,
    ) -> Self {
        Self {
            destination_path,
            source_file_id: source_file_id.into(),
            origin,
            status: TransferStatus::Failed,
            error: Some(error.into()),
        }
    }

    fn key(&self) -> String {
        self.destination_path.as_key()
    }
}

/// Read-only view of the succeeded paths, cheap to clone into tasks.
#[derive(Debug, Clone, Default)]
pub struct LedgerSnapshot {
    paths: Arc<HashSet<String>>,
}

impl LedgerSnapshot {
    /// Whether `path` has a succeeded record.
    pub fn contains(&self, path: &RemotePath) -> bool {
        self.paths.contains(&path.as_key())
    }

    /// Number of succeeded paths.
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Whether no path has succeeded yet.
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Record counts for one origin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OriginCounts {
    /// Succeeded records.
    pub succeeded: usize,
    /// Failed records.
    pub failed: usize,
}

/// Record counts of the whole ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerStats {
    /// Succeeded records.
    pub succeeded: usize,
    /// Failed records.
    pub failed: usize,
    /// Breakdown by origin.
    pub per_origin: HashMap<Origin, OriginCounts>,
}

/// The transfer ledger.
///
/// Single writer: only the owning orchestrator mutates it.
#[derive(Debug)]
pub struct TransferLedger {
    dir: PathBuf,
    succeeded: BTreeMap<String, TransferRecord>,
    failed: BTreeMap<String, TransferRecord>,
    dirty: bool,
}

impl TransferLedger {
    /// Load the ledger stored in `dir`, creating the directory if needed.
    ///
    /// Missing files mean an empty set.
    ///
    /// # Errors
    /// - I/O errors
    /// - `Serialization` if a file is not a JSON array of records
    pub async fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;

        let succeeded = read_set(&dir.join(SUCCEEDED_FILE), TransferStatus::Succeeded).await?;
        let mut failed = read_set(&dir.join(FAILED_FILE), TransferStatus::Failed).await?;

        // Repair files edited by hand so the sets stay disjoint
        failed.retain(|key, _| !succeeded.contains_key(key));

        info!(
            "Ledger loaded from {}: {} succeeded, {} failed",
            dir.display(),
            succeeded.len(),
            failed.len()
        );

        Ok(Self {
            dir,
            succeeded,
            failed,
            dirty: false,
        })
    }

    /// Directory the ledger files live in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether `path` has a succeeded record.
    pub fn is_already_uploaded(&self, path: &RemotePath) -> bool {
        self.succeeded.contains_key(&path.as_key())
    }

    /// Add a succeeded record.
    ///
    /// Removes any failed record for the same path, and the failure kept
    /// for the same item while its path was unresolved. Returns `false` if
    /// the path had already succeeded.
    pub fn record_success(&mut self, record: TransferRecord) -> bool {
        let record = TransferRecord {
            status: TransferStatus::Succeeded,
            error: None,
            ..record
        };
        let key = record.key();
        let unresolved = RemotePath::unresolved(&record.source_file_id).as_key();

        if self.failed.remove(&key).is_some() | self.failed.remove(&unresolved).is_some() {
            self.dirty = true;
        }
        if self.succeeded.contains_key(&key) {
            return false;
        }

        self.succeeded.insert(key, record);
        self.dirty = true;
        true
    }

    /// Add a failed record.
    ///
    /// Ignored if the path has already succeeded or already failed.
    pub fn record_failure(&mut self, record: TransferRecord) -> bool {
        let key = record.key();
        if self.succeeded.contains_key(&key) || self.failed.contains_key(&key) {
            return false;
        }

        let record = TransferRecord {
            status: TransferStatus::Failed,
            ..record
        };
        self.failed.insert(key, record);
        self.dirty = true;
        true
    }

    /// Add a record to the set its status names.
    pub fn apply(&mut self, record: TransferRecord) -> bool {
        match record.status {
            TransferStatus::Succeeded => self.record_success(record),
            TransferStatus::Failed => self.record_failure(record),
        }
    }

    /// Drop every record for `path`, so the next run checks it again.
    pub fn forget(&mut self, path: &RemotePath) -> bool {
        let key = path.as_key();
        let removed = self.succeeded.remove(&key).is_some() | self.failed.remove(&key).is_some();
        self.dirty |= removed;
        removed
    }

    /// Drop the failed record for `path`, if any.
    pub fn clear_failure(&mut self, path: &RemotePath) -> bool {
        let removed = self.failed.remove(&path.as_key()).is_some();
        self.dirty |= removed;
        removed
    }

    /// Snapshot of the succeeded paths.
    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            paths: Arc::new(self.succeeded.keys().cloned().collect()),
        }
    }

    /// Failed records, optionally limited to one origin, ordered by path.
    pub fn failed_records(&self, origin: Option<Origin>) -> Vec<TransferRecord> {
        self.failed
            .values()
            .filter(|r| origin.is_none_or(|o| r.origin == o))
            .cloned()
            .collect()
    }

    /// Number of succeeded records.
    pub fn succeeded_count(&self) -> usize {
        self.succeeded.len()
    }

    /// Number of failed records.
    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    /// Record counts overall and per origin.
    pub fn stats(&self) -> LedgerStats {
        let mut stats = LedgerStats {
            succeeded: self.succeeded.len(),
            failed: self.failed.len(),
            per_origin: HashMap::new(),
        };
        for record in self.succeeded.values() {
            stats.per_origin.entry(record.origin).or_default().succeeded += 1;
        }
        for record in self.failed.values() {
            stats.per_origin.entry(record.origin).or_default().failed += 1;
        }
        stats
    }

    /// Whether there are changes not yet written.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Write both sets if anything changed since the last write.
    ///
    /// Returns whether anything was written.
    pub async fn persist(&mut self) -> Result<bool> {
        if !self.dirty {
            return Ok(false);
        }

        write_set(&self.dir.join(SUCCEEDED_FILE), &self.succeeded).await?;
        write_set(&self.dir.join(FAILED_FILE), &self.failed).await?;
        self.dirty = false;

        debug!(
            "Ledger persisted: {} succeeded, {} failed",
            self.succeeded.len(),
            self.failed.len()
        );
        Ok(true)
    }
}

async fn read_set(
    path: &Path,
    status: TransferStatus,
) -> Result<BTreeMap<String, TransferRecord>> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e.into()),
    };

    let records: Vec<TransferRecord> = serde_json::from_str(&content)?;
    Ok(records
        .into_iter()
        .map(|record| {
            let record = TransferRecord { status, ..record };
            (record.key(), record)
        })
        .collect())
}

/// Write to a sibling temp file and rename it over the target.
async fn write_set(path: &Path, records: &BTreeMap<String, TransferRecord>) -> Result<()> {
    let records: Vec<&TransferRecord> = records.values().collect();
    let json = serde_json::to_string_pretty(&records)?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, json).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn path(p: &str) -> RemotePath {
        RemotePath::parse(p).unwrap()
    }

    fn ok(p: &str) -> TransferRecord {
        TransferRecord::succeeded(path(p), format!("id-{}", p), Origin::GoogleDrive)
    }

    fn bad(p: &str) -> TransferRecord {
        TransferRecord::failed(path(p), format!("id-{}", p), Origin::GoogleDrive, "boom")
    }

    #[tokio::test]
    async fn test_empty_directory_loads_empty() {
        let temp = TempDir::new().unwrap();
        let ledger = TransferLedger::load(temp.path().join("state")).await.unwrap();
        assert_eq!(ledger.succeeded_count(), 0);
        assert_eq!(ledger.failed_count(), 0);
        assert!(!ledger.is_dirty());
    }

    #[tokio::test]
    async fn test_duplicate_success_is_noop() {
        let temp = TempDir::new().unwrap();
        let mut ledger = TransferLedger::load(temp.path()).await.unwrap();

        assert!(ledger.record_success(ok("A/x.txt")));
        assert!(!ledger.record_success(ok("A/x.txt")));
        assert_eq!(ledger.succeeded_count(), 1);
    }

    #[tokio::test]
    async fn test_sets_stay_disjoint() {
        let temp = TempDir::new().unwrap();
        let mut ledger = TransferLedger::load(temp.path()).await.unwrap();

        assert!(ledger.record_failure(bad("a.txt")));
        assert!(ledger.record_success(ok("a.txt")));
        assert_eq!(ledger.failed_count(), 0);
        assert!(ledger.is_already_uploaded(&path("a.txt")));

        // A failure after success is ignored
        assert!(!ledger.record_failure(bad("a.txt")));
        assert_eq!(ledger.failed_count(), 0);
    }

    #[tokio::test]
    async fn test_persist_and_reload() {
        let temp = TempDir::new().unwrap();
        {
            let mut ledger = TransferLedger::load(temp.path()).await.unwrap();
            ledger.record_success(ok("Google Photos/IMG_1.jpg"));
            ledger.record_failure(bad("Docs/b.pdf"));
            ledger.persist().await.unwrap();
            assert!(!ledger.is_dirty());
        }

        let ledger = TransferLedger::load(temp.path()).await.unwrap();
        assert!(ledger.is_already_uploaded(&path("Google Photos/IMG_1.jpg")));
        let failed = ledger.failed_records(None);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].status, TransferStatus::Failed);
        assert_eq!(failed[0].error.as_deref(), Some("boom"));
        assert!(!temp.path().join("uploaded.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_format() {
        let temp = TempDir::new().unwrap();
        let mut ledger = TransferLedger::load(temp.path()).await.unwrap();
        ledger.record_success(TransferRecord::succeeded(
            path("Google Photos/IMG_1.jpg"),
            "m1",
            Origin::GooglePhotos,
        ));
        ledger.persist().await.unwrap();

        let json = tokio::fs::read_to_string(temp.path().join(SUCCEEDED_FILE))
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value[0]["filepath"], "Google Photos/IMG_1.jpg");
        assert_eq!(value[0]["fileId"], "m1");
        assert_eq!(value[0]["from"], "GooglePhotos");
        assert_eq!(value[0]["status"], "succeeded");
        assert!(value[0].get("error").is_none());
    }

    #[tokio::test]
    async fn test_loads_records_without_status() {
        let temp = TempDir::new().unwrap();
        tokio::fs::write(
            temp.path().join(FAILED_FILE),
            r#"[{"filepath": "x/y.txt", "fileId": "9", "from": "GoogleDrive", "error": "timeout"}]"#,
        )
        .await
        .unwrap();

        let ledger = TransferLedger::load(temp.path()).await.unwrap();
        let failed = ledger.failed_records(Some(Origin::GoogleDrive));
        assert_eq!(failed[0].status, TransferStatus::Failed);
        assert!(ledger.failed_records(Some(Origin::GooglePhotos)).is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let temp = TempDir::new().unwrap();
        tokio::fs::write(temp.path().join(SUCCEEDED_FILE), "{not json")
            .await
            .unwrap();

        assert!(TransferLedger::load(temp.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_forget_and_stats() {
        let temp = TempDir::new().unwrap();
        let mut ledger = TransferLedger::load(temp.path()).await.unwrap();
        ledger.record_success(ok("a"));
        ledger.record_success(TransferRecord::succeeded(path("p"), "p", Origin::GooglePhotos));
        ledger.record_failure(bad("b"));

        let stats = ledger.stats();
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.per_origin[&Origin::GoogleDrive].succeeded, 1);
        assert_eq!(stats.per_origin[&Origin::GoogleDrive].failed, 1);
        assert_eq!(stats.per_origin[&Origin::GooglePhotos].succeeded, 1);

        assert!(ledger.forget(&path("a")));
        assert!(!ledger.forget(&path("a")));
        assert!(!ledger.snapshot().contains(&path("a")));
    }

    #[tokio::test]
    async fn test_unresolved_failure_survives_same_named_success() {
        let temp = TempDir::new().unwrap();
        let mut ledger = TransferLedger::load(temp.path()).await.unwrap();

        let lost = TransferRecord::failed(
            RemotePath::unresolved("id-lost"),
            "id-lost",
            Origin::GoogleDrive,
            "parent folder not found",
        );
        assert!(ledger.record_failure(lost));
        assert!(ledger.record_success(ok("x.txt")));
        assert_eq!(ledger.failed_count(), 1);

        // Once the item lands at its real path the placeholder goes
        assert!(ledger.record_success(TransferRecord::succeeded(
            path("A/x.txt"),
            "id-lost",
            Origin::GoogleDrive,
        )));
        assert_eq!(ledger.failed_count(), 0);
    }

    #[tokio::test]
    async fn test_persist_writes_only_when_dirty() {
        let temp = TempDir::new().unwrap();
        let mut ledger = TransferLedger::load(temp.path()).await.unwrap();
        assert!(!ledger.persist().await.unwrap());
        assert!(!temp.path().join(SUCCEEDED_FILE).exists());

        ledger.record_success(ok("a"));
        assert!(ledger.persist().await.unwrap());
        assert!(!ledger.persist().await.unwrap());

        // A duplicate changes nothing
        ledger.record_success(ok("a"));
        assert!(!ledger.persist().await.unwrap());
    }
}
