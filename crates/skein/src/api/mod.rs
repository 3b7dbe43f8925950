//! REST surface of the dashboard server.

mod client;

pub use client::{ApiClient, RestSnapshotFetcher};
