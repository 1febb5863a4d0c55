//! OAuth2 credentials for the source and destination accounts.
//!
//! - [`Credential`]: immutable token value with expiry tracking
//! - [`TokenStore`]: shared persistence (SQLite or in-memory)
//! - [`CredentialManager`]: single-flight refresh on top of a store
//! - [`OAuthClient`]: consent URL, code exchange and refresh per provider

pub mod credential;
pub mod manager;
pub mod oauth;
pub mod store;

pub use credential::{Credential, ProviderKind, RefreshedToken};
pub use manager::{CredentialManager, TokenRefresher};
pub use oauth::{OAuthClient, OAuthConfig};
pub use store::{MemoryTokenStore, SqliteTokenStore, TokenStore};
