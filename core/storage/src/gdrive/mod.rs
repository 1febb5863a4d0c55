//! Google sources: Drive files and the Photos library.
//!
//! Both clients share the Google credential; the Drive client also serves
//! folder lookups for path resolution.

pub mod client;
pub mod photos;

pub use client::{DriveClient, DriveFile};
pub use photos::{MediaItem, PhotosClient};
