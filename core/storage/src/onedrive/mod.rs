//! OneDrive destination through Microsoft Graph.

pub mod client;

pub use client::GraphClient;
