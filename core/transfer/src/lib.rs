//! SkyFerry transfer pipeline
//!
//! Moves files from a source cloud into the destination:
//! - Paged source enumeration with retry
//! - Destination path resolution from the source folder hierarchy
//! - Existence checks backed by a durable ledger
//! - Simple and chunked session uploads
//! - Per-item failure isolation and resumable runs

pub mod config;
pub mod enumerator;
pub mod existence;
pub mod ledger;
pub mod orchestrator;
pub mod path;
pub mod retry;
pub mod upload;

pub use config::TransferConfig;
pub use enumerator::SourceEnumerator;
pub use existence::ExistenceChecker;
pub use ledger::{
    LedgerSnapshot, LedgerStats, OriginCounts, TransferLedger, TransferRecord, TransferStatus,
};
pub use orchestrator::{ItemOutcome, ItemReport, ProcessingMode, RunReport, TransferOrchestrator};
pub use path::DestinationPathResolver;
pub use retry::{RetryConfig, RetryExecutor};
pub use upload::{UploadEngine, UploadStrategy, CHUNK_UNIT, SIMPLE_UPLOAD_LIMIT};
