//! Common utilities and types shared across SkyFerry modules.
//!
//! This module provides the error taxonomy and the small value types
//! (origins, destination paths, source file snapshots) every other crate
//! builds on.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{sanitize_component, Origin, Permission, RemotePath, SourceFile};
