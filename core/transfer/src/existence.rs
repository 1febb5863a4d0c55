//! Destination existence checks.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use skyferry_common::{RemotePath, Result};
use skyferry_storage::DestinationProvider;

use crate::ledger::LedgerSnapshot;

/// Decides whether an object already exists at the destination.
///
/// Folder IDs found on the way down are cached by path. Missing folders are
/// not cached because later uploads create them.
pub struct ExistenceChecker {
    destination: Arc<dyn DestinationProvider>,
    base_folder: String,
    folder_ids: RwLock<HashMap<String, String>>,
}

impl ExistenceChecker {
    /// Create a checker for objects below `base_folder`.
    pub fn new(destination: Arc<dyn DestinationProvider>, base_folder: impl Into<String>) -> Self {
        Self {
            destination,
            base_folder: base_folder.into(),
            folder_ids: RwLock::new(HashMap::new()),
        }
    }

    /// Whether `parent_path/filename` exists below the base folder.
    ///
    /// A succeeded ledger entry answers without any remote call.
    ///
    /// # Errors
    /// - Any destination error other than not-found
    pub async fn exists(
        &self,
        filename: &str,
        parent_path: &RemotePath,
        uploaded: &LedgerSnapshot,
    ) -> Result<bool> {
        let full_path = parent_path.join(filename)?;
        if uploaded.contains(&full_path) {
            debug!("{} is in the ledger", full_path);
            return Ok(true);
        }

        let folder_id = match self.folder_id(parent_path).await {
            Ok(id) => id,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };

        let children = self.destination.list_children(&folder_id).await?;
        Ok(children.iter().any(|name| name == filename))
    }

    /// ID of `base_folder/path`, walking from the drive root.
    async fn folder_id(&self, path: &RemotePath) -> Result<String> {
        let segments: Vec<&str> = std::iter::once(self.base_folder.as_str())
            .chain(path.components().iter().map(String::as_str))
            .collect();

        // Longest cached prefix
        let mut id = self.destination.root_id().to_string();
        let mut start = 0;
        {
            let cache = self.folder_ids.read().await;
            for end in (1..=segments.len()).rev() {
                if let Some(cached) = cache.get(&segments[..end].join("/")) {
                    id = cached.clone();
                    start = end;
                    break;
                }
            }
        }

        for end in start + 1..=segments.len() {
            id = self
                .destination
                .child_folder(&id, segments[end - 1])
                .await?;
            self.folder_ids
                .write()
                .await
                .insert(segments[..end].join("/"), id.clone());
        }

        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyferry_common::{Error, Origin};
    use skyferry_storage::MemoryDestination;

    use crate::ledger::{TransferLedger, TransferRecord};

    fn path(p: &str) -> RemotePath {
        RemotePath::parse(p).unwrap()
    }

    #[tokio::test]
    async fn test_ledger_hit_makes_no_remote_call() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut ledger = TransferLedger::load(temp.path()).await.unwrap();
        ledger.record_success(TransferRecord::succeeded(
            path("A/B/x.txt"),
            "1",
            Origin::GoogleDrive,
        ));

        let dest = Arc::new(MemoryDestination::new());
        let checker = ExistenceChecker::new(dest.clone(), "Base");

        assert!(checker
            .exists("x.txt", &path("A/B"), &ledger.snapshot())
            .await
            .unwrap());
        assert_eq!(dest.child_lookups(), 0);
        assert_eq!(dest.listings(), 0);
    }

    #[tokio::test]
    async fn test_existing_object_is_found() {
        let dest = Arc::new(MemoryDestination::new());
        dest.seed_file("Base/A/x.txt", "x").await.unwrap();
        let checker = ExistenceChecker::new(dest.clone(), "Base");
        let empty = LedgerSnapshot::default();

        assert!(checker.exists("x.txt", &path("A"), &empty).await.unwrap());
        assert!(!checker.exists("y.txt", &path("A"), &empty).await.unwrap());
        // Names match exactly
        assert!(!checker.exists("X.TXT", &path("A"), &empty).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_folder_means_absent() {
        let dest = Arc::new(MemoryDestination::new());
        let checker = ExistenceChecker::new(dest.clone(), "Base");

        assert!(!checker
            .exists("x.txt", &path("A/B"), &LedgerSnapshot::default())
            .await
            .unwrap());
        assert_eq!(dest.listings(), 0);
    }

    #[tokio::test]
    async fn test_folder_ids_are_cached() {
        let dest = Arc::new(MemoryDestination::new());
        dest.seed_file("Base/A/B/x.txt", "x").await.unwrap();
        let checker = ExistenceChecker::new(dest.clone(), "Base");
        let empty = LedgerSnapshot::default();

        checker.exists("x.txt", &path("A/B"), &empty).await.unwrap();
        assert_eq!(dest.child_lookups(), 3);

        checker.exists("y.txt", &path("A/B"), &empty).await.unwrap();
        checker.exists("B", &path("A"), &empty).await.unwrap();
        assert_eq!(dest.child_lookups(), 3);
    }

    #[tokio::test]
    async fn test_negative_results_are_not_cached() {
        let dest = Arc::new(MemoryDestination::new());
        let checker = ExistenceChecker::new(dest.clone(), "Base");
        let empty = LedgerSnapshot::default();

        assert!(!checker.exists("x.txt", &path("A"), &empty).await.unwrap());
        dest.seed_file("Base/A/x.txt", "x").await.unwrap();
        assert!(checker.exists("x.txt", &path("A"), &empty).await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_filename() {
        let checker = ExistenceChecker::new(Arc::new(MemoryDestination::new()), "Base");
        assert!(matches!(
            checker
                .exists("a/b", &RemotePath::root(), &LedgerSnapshot::default())
                .await,
            Err(Error::InvalidInput(_))
        ));
    }
}
