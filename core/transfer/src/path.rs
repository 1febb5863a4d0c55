//! Mapping source folder hierarchies onto destination paths.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use skyferry_common::{sanitize_component, Error, RemotePath, Result};
use skyferry_storage::{FolderNode, HierarchyLookup};

/// Resolves the destination path of a source item from its ancestor chain.
///
/// Each resolved ancestor's path is memoized for the lifetime of the
/// resolver, so siblings and cousins share the walk.
pub struct DestinationPathResolver {
    lookup: Arc<dyn HierarchyLookup>,
    root_sentinel: String,
    resolved: RwLock<HashMap<String, RemotePath>>,
}

impl DestinationPathResolver {
    /// Create a resolver that stops at folders named `root_sentinel`.
    pub fn new(lookup: Arc<dyn HierarchyLookup>, root_sentinel: impl Into<String>) -> Self {
        Self {
            lookup,
            root_sentinel: root_sentinel.into(),
            resolved: RwLock::new(HashMap::new()),
        }
    }

    /// Destination folder path of the item with `file_id`.
    ///
    /// The item itself is not part of the returned path.
    pub async fn resolve_path(&self, file_id: &str) -> Result<RemotePath> {
        let node = self.lookup.folder_node(file_id).await?;
        self.resolve_from_parent(node.parent_id.as_deref()).await
    }

    /// Destination path of the folder `parent_id`; `None` is the root.
    ///
    /// # Errors
    /// - Lookup errors from the source
    /// - `InvalidInput` if the ancestor chain loops
    pub async fn resolve_from_parent(&self, parent_id: Option<&str>) -> Result<RemotePath> {
        let mut chain: Vec<FolderNode> = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut base = RemotePath::root();
        let mut current = parent_id.map(String::from);

        while let Some(id) = current.take() {
            if let Some(path) = self.resolved.read().await.get(&id) {
                debug!("Path cache hit for folder {}", id);
                base = path.clone();
                break;
            }
            if !visited.insert(id.clone()) {
                return Err(Error::InvalidInput(format!(
                    "Folder hierarchy loops at {}",
                    id
                )));
            }

            let node = self.lookup.folder_node(&id).await?;
            if node.name == self.root_sentinel {
                self.resolved.write().await.insert(id, RemotePath::root());
                break;
            }

            current = node.parent_id.clone();
            chain.push(node);
        }

        // Chain is leaf first; build root-most first and memoize every prefix
        let mut path = base;
        let mut resolved = self.resolved.write().await;
        for node in chain.into_iter().rev() {
            path = path.join(&sanitize_component(&node.name))?;
            resolved.insert(node.id, path.clone());
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyferry_common::Origin;
    use skyferry_storage::MemorySource;

    fn tree() -> Arc<MemorySource> {
        Arc::new(
            MemorySource::new(Origin::GoogleDrive)
                .with_folder("root", "My Drive", None)
                .with_folder("a", "A", Some("root"))
                .with_folder("b", "B", Some("a"))
                .with_folder("c", "C", Some("b"))
                .with_folder("b2", "B2", Some("a"))
                .with_folder("orphan", "Shared/Stuff", None),
        )
    }

    #[tokio::test]
    async fn test_chain_resolves_root_most_first() {
        let source = tree();
        let resolver = DestinationPathResolver::new(source.clone(), "My Drive");

        let path = resolver.resolve_from_parent(Some("b")).await.unwrap();
        assert_eq!(path.as_key(), "A/B");
        // b, a and the sentinel
        assert_eq!(source.folder_lookups(), 3);
    }

    #[tokio::test]
    async fn test_root_level_items_resolve_to_empty_path() {
        let resolver = DestinationPathResolver::new(tree(), "My Drive");
        assert!(resolver.resolve_from_parent(Some("root")).await.unwrap().is_root());
        assert!(resolver.resolve_from_parent(None).await.unwrap().is_root());
    }

    #[tokio::test]
    async fn test_memo_shares_ancestor_walks() {
        let source = tree();
        let resolver = DestinationPathResolver::new(source.clone(), "My Drive");

        resolver.resolve_from_parent(Some("b")).await.unwrap();
        let before = source.folder_lookups();

        assert_eq!(
            resolver.resolve_from_parent(Some("c")).await.unwrap().as_key(),
            "A/B/C"
        );
        assert_eq!(
            resolver.resolve_from_parent(Some("b2")).await.unwrap().as_key(),
            "A/B2"
        );
        assert_eq!(resolver.resolve_from_parent(Some("b")).await.unwrap().as_key(), "A/B");
        // Only c and b2 were fetched
        assert_eq!(source.folder_lookups(), before + 2);
    }

    #[tokio::test]
    async fn test_parentless_folder_is_included() {
        let resolver = DestinationPathResolver::new(tree(), "My Drive");
        let path = resolver.resolve_from_parent(Some("orphan")).await.unwrap();
        assert_eq!(path.as_key(), "Shared_Stuff");
    }

    #[tokio::test]
    async fn test_resolve_path_by_item_id() {
        let resolver = DestinationPathResolver::new(tree(), "My Drive");
        // The item's own name is not part of the path
        assert_eq!(resolver.resolve_path("c").await.unwrap().as_key(), "A/B");
    }

    #[tokio::test]
    async fn test_missing_ancestor_propagates() {
        let source = Arc::new(
            MemorySource::new(Origin::GoogleDrive).with_folder("x", "X", Some("gone")),
        );
        let resolver = DestinationPathResolver::new(source, "My Drive");
        assert!(resolver
            .resolve_from_parent(Some("x"))
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_cycle_is_rejected() {
        let source = Arc::new(
            MemorySource::new(Origin::GoogleDrive)
                .with_folder("x", "X", Some("y"))
                .with_folder("y", "Y", Some("x")),
        );
        let resolver = DestinationPathResolver::new(source, "My Drive");
        assert!(matches!(
            resolver.resolve_from_parent(Some("x")).await,
            Err(Error::InvalidInput(_))
        ));
    }
}
