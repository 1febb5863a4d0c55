//! Common types used throughout SkyFerry.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Source service a file is migrated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Origin {
    /// Document storage (Google Drive).
    GoogleDrive,
    /// Photo library (Google Photos).
    GooglePhotos,
}

impl Origin {
    /// Short identifier used on the command line and in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::GoogleDrive => "drive",
            Origin::GooglePhotos => "photos",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A destination-relative path, e.g. `Google Photos/IMG_0001.jpg`.
///
/// This is the ledger key and is always relative to the migration base
/// folder at the destination. The empty path denotes the base folder itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RemotePath {
    components: Vec<String>,
}

/// Leading component of keys for items whose destination was never resolved.
///
/// [`sanitize_component`] never emits a `:`, so no migrated item can land here.
const UNRESOLVED_MARKER: &str = ":unresolved";

impl RemotePath {
    /// The base folder itself.
    pub fn root() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    /// Create a path from string components.
    ///
    /// # Errors
    /// - Returns error if any component is empty or contains a separator
    pub fn from_components(components: Vec<String>) -> crate::Result<Self> {
        for comp in &components {
            validate_component(comp)?;
        }
        Ok(Self { components })
    }

    /// Parse a slash separated path. Leading, trailing and repeated slashes
    /// are ignored.
    pub fn parse(path: &str) -> crate::Result<Self> {
        let components: Vec<String> = path
            .split('/')
            .filter(|c| !c.is_empty())
            .map(String::from)
            .collect();
        Self::from_components(components)
    }

    /// Ledger key for a source item whose destination path is unknown.
    pub fn unresolved(source_id: &str) -> Self {
        Self {
            components: vec![
                UNRESOLVED_MARKER.to_string(),
                sanitize_component(source_id),
            ],
        }
    }

    /// Whether this key was made by [`RemotePath::unresolved`].
    pub fn is_unresolved(&self) -> bool {
        self.components.first().map(String::as_str) == Some(UNRESOLVED_MARKER)
    }

    /// Check if this is the base folder.
    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Get the parent path, if any.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            None
        } else {
            let mut components = self.components.clone();
            components.pop();
            Some(Self { components })
        }
    }

    /// Get the last component.
    pub fn name(&self) -> Option<&str> {
        self.components.last().map(|s| s.as_str())
    }

    /// Join this path with a child component.
    pub fn join(&self, child: &str) -> crate::Result<Self> {
        validate_component(child)?;
        let mut components = self.components.clone();
        components.push(child.to_string());
        Ok(Self { components })
    }

    /// Append all components of `other` to this path.
    pub fn concat(&self, other: &RemotePath) -> Self {
        let mut components = self.components.clone();
        components.extend(other.components.iter().cloned());
        Self { components }
    }

    /// Get the path components.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Slash joined form without leading slash (`""` for the root).
    pub fn as_key(&self) -> String {
        self.components.join("/")
    }
}

fn validate_component(comp: &str) -> crate::Result<()> {
    if comp.is_empty() {
        return Err(crate::Error::InvalidInput(
            "Path component cannot be empty".to_string(),
        ));
    }
    if comp.contains('/') || comp.contains('\\') {
        return Err(crate::Error::InvalidInput(format!(
            "Path component cannot contain separators: {}",
            comp
        )));
    }
    if comp == "." || comp == ".." {
        return Err(crate::Error::InvalidInput(format!(
            "Path component cannot be a dot segment: {}",
            comp
        )));
    }
    Ok(())
}

/// Make a source name usable as a single path component.
///
/// Separators and `:` become `_`. An empty name becomes `_`, and the dot
/// segments `.` and `..` become `_` and `__` so a name can never climb out
/// of its folder.
pub fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
        .collect();
    match cleaned.as_str() {
        "" | "." => "_".to_string(),
        ".." => "__".to_string(),
        _ => cleaned,
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_key())
    }
}

impl TryFrom<String> for RemotePath {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::parse(&value)
    }
}

impl From<RemotePath> for String {
    fn from(path: RemotePath) -> Self {
        path.as_key()
    }
}

/// A sharing permission attached to a source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    /// Role such as `owner`, `writer` or `reader`.
    pub role: String,
    /// Account the permission is granted to, if it is a user permission.
    #[serde(default)]
    pub email_address: Option<String>,
}

/// Immutable snapshot of a file returned by a source listing call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Provider-specific file ID.
    pub id: String,
    /// File name.
    pub name: String,
    /// Parent folder IDs; the first one is the primary parent.
    pub parent_ids: Vec<String>,
    /// Size in bytes, when the listing reports it.
    pub size: Option<u64>,
    /// URL the content can be downloaded from with a bearer token.
    pub content_url: String,
    /// Sharing permissions, when the listing reports them.
    pub permissions: Vec<Permission>,
}

impl SourceFile {
    /// Primary parent folder ID.
    pub fn primary_parent(&self) -> Option<&str> {
        self.parent_ids.first().map(|s| s.as_str())
    }

    /// Whether `email` holds the `owner` role on this file.
    pub fn is_owned_by(&self, email: &str) -> bool {
        self.permissions.iter().any(|p| {
            p.role == "owner"
                && p.email_address
                    .as_deref()
                    .is_some_and(|e| e.eq_ignore_ascii_case(email))
        })
    }
}
