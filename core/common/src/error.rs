//! Common error types for SkyFerry.

use thiserror::Error;

/// Top-level error type for SkyFerry operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No stored credential (or no refresh token); the user must consent again.
    #[error("Authentication missing: {0}")]
    AuthenticationMissing(String),

    /// The provider refused the credential (refresh denied or token revoked).
    #[error("Authentication rejected: {0}")]
    AuthenticationRejected(String),

    /// Network or remote API failure.
    #[error("Network error: {0}")]
    Network(String),

    /// Listing the source failed; the run cannot continue.
    #[error("Enumeration failed: {0}")]
    Enumeration(String),

    /// Storage backend (token store, ledger) failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The remote service denied the operation.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Whether this error means the credential for a provider is unusable.
    ///
    /// Authentication errors always escape per-item handling and stop the run.
    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            Error::AuthenticationMissing(_) | Error::AuthenticationRejected(_)
        )
    }

    /// Whether this error is the not-found class.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authentication_classification() {
        assert!(Error::AuthenticationMissing("x".into()).is_authentication());
        assert!(Error::AuthenticationRejected("x".into()).is_authentication());
        assert!(!Error::Network("x".into()).is_authentication());
        assert!(!Error::NotFound("x".into()).is_authentication());
    }

    #[test]
    fn test_not_found_classification() {
        assert!(Error::NotFound("folder".into()).is_not_found());
        assert!(!Error::PermissionDenied("folder".into()).is_not_found());
    }

    #[test]
    fn test_json_error_conversion() {
        let err: Error = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
