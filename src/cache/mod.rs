//! Snapshot cache for API responses
//!
//! This module layers a per-resource, timestamp-named file cache over the
//! authenticated client. Snapshots are append-only: each capture is written
//! to a new file and existing files are never rewritten or deleted, so a
//! query anchored at a past threshold keeps returning the same snapshot even
//! as newer captures accumulate.

mod client;
mod store;

pub use client::CachedClient;
pub use store::SnapshotStore;

use std::io;
use thiserror::Error;

use crate::api::ApiError;

/// Errors from cached retrieval operations
#[derive(Debug, Error)]
pub enum CacheError {
    /// Resource paths must begin with '/'
    #[error("invalid resource path {0:?}: must begin with '/'")]
    InvalidPath(String),

    /// Reading or writing a snapshot failed
    #[error("snapshot I/O failed: {0}")]
    Io(#[from] io::Error),

    /// A snapshot file did not contain valid JSON
    #[error("failed to parse snapshot: {0}")]
    Parse(#[from] serde_json::Error),

    /// The underlying API call failed
    #[error(transparent)]
    Api(#[from] ApiError),
}
