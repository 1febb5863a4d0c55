//! Remote service access for SkyFerry.
//!
//! This crate provides the trait-based seams between the transfer pipeline
//! and the cloud services it talks to, plus their implementations:
//! - [`auth`]: OAuth2 credentials, persistence and single-flight refresh
//! - [`gdrive`]: Google Drive and Google Photos as sources
//! - [`onedrive`]: OneDrive (Microsoft Graph) as the destination
//! - [`memory`]: in-memory fakes for tests
//!
//! # Design Principles
//! - No ambient singletons: clients receive their credential manager
//! - Streaming: content flows as byte streams, never whole files
//! - Unified error semantics: HTTP status maps onto one error taxonomy

pub mod auth;
pub mod gdrive;
mod http;
pub mod memory;
pub mod onedrive;
pub mod provider;

pub use auth::{CredentialManager, ProviderKind, TokenStore};
pub use gdrive::{DriveClient, PhotosClient};
pub use memory::{MemoryDestination, MemorySource};
pub use onedrive::GraphClient;
pub use provider::{
    ByteStream, ChunkOutcome, ChunkRange, ConflictBehavior, DestinationProvider, FolderNode,
    HierarchyLookup, SourcePage, SourceProvider, UploadSession, UploadedItem,
};
