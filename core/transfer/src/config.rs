//! Transfer pipeline configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use skyferry_common::{Error, RemotePath, Result};

use crate::retry::RetryConfig;

/// Settings for one migration run.
///
/// Every field has a default, so a JSON file only needs to name what it
/// changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Destination folder every migrated object lands under.
    pub base_folder: String,
    /// Folder below the base folder that receives the photo library.
    pub photos_folder: String,
    /// Name of the source drive's root folder; it does not appear in paths.
    pub root_sentinel: String,
    /// Items per Drive listing page.
    pub drive_page_size: u32,
    /// Items per Photos listing page.
    pub photos_page_size: u32,
    /// Upload session chunk size, in 320 KiB units.
    pub chunk_units: u32,
    /// Upper bound on concurrent item tasks in concurrent mode.
    pub max_concurrency: usize,
    /// Delete the source copy once the destination has it.
    pub delete_after_transfer: bool,
    /// Retry policy for listing calls and download requests.
    pub retry: RetryConfig,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            base_folder: "Google Migration".to_string(),
            photos_folder: "Google Photos".to_string(),
            root_sentinel: "My Drive".to_string(),
            drive_page_size: 50,
            photos_page_size: 20,
            chunk_units: 50,
            max_concurrency: 20,
            delete_after_transfer: false,
            retry: RetryConfig::default(),
        }
    }
}

impl TransferConfig {
    /// Load a configuration file.
    ///
    /// # Errors
    /// - I/O errors reading the file
    /// - `Serialization` for malformed JSON
    /// - `InvalidInput` if a value is out of range
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        debug!("Loaded transfer config from {}", path.as_ref().display());
        Ok(config)
    }

    /// Check that every value is usable.
    pub fn validate(&self) -> Result<()> {
        RemotePath::root().join(&self.base_folder)?;
        RemotePath::root().join(&self.photos_folder)?;
        if self.photos_folder.contains(':') {
            return Err(Error::InvalidInput(format!(
                "photos_folder cannot contain ':': {}",
                self.photos_folder
            )));
        }

        if self.drive_page_size == 0 || self.photos_page_size == 0 {
            return Err(Error::InvalidInput("Page sizes must be positive".to_string()));
        }
        if self.chunk_units == 0 {
            return Err(Error::InvalidInput("chunk_units must be positive".to_string()));
        }
        if self.max_concurrency == 0 {
            return Err(Error::InvalidInput(
                "max_concurrency must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// The base folder as a destination path.
    pub fn base_path(&self) -> Result<RemotePath> {
        RemotePath::root().join(&self.base_folder)
    }

    /// Where photo library items go, relative to the base folder.
    pub fn photos_path(&self) -> Result<RemotePath> {
        RemotePath::root().join(&self.photos_folder)
    }
}
