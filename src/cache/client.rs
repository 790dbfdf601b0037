//! Cached retrieval layered over the authenticated client
//!
//! Decides, per request, whether a previously captured snapshot satisfies
//! the freshness threshold or live data must be fetched and captured. The
//! selection rule is "oldest snapshot at or after the threshold", not
//! "newest overall": asking for data as of a past instant keeps returning
//! the same snapshot once one is captured, which makes repeated historical
//! analysis reproducible.

use std::path::PathBuf;

use chrono::{Local, NaiveDateTime};
use serde_json::{Map, Value};
use tracing::debug;

use super::{CacheError, SnapshotStore};
use crate::api::{self, ApiClient};

/// API client that serves snapshots from disk when one satisfies the
/// freshness threshold
///
/// Holds the cache root and the base datetime fixed for its lifetime. The
/// cache is consulted before any network access; on a hit the network is
/// never touched.
#[derive(Debug)]
pub struct CachedClient {
    api: ApiClient,
    store: SnapshotStore,
    base_datetime: NaiveDateTime,
}

impl CachedClient {
    /// Creates a cached client over `api`
    ///
    /// `base_datetime` is the freshness threshold: only snapshots captured
    /// at or after it are served without hitting the network.
    pub fn new(
        api: ApiClient,
        cache_root: impl Into<PathBuf>,
        base_datetime: NaiveDateTime,
    ) -> Self {
        Self {
            api,
            store: SnapshotStore::new(cache_root),
            base_datetime,
        }
    }

    /// Returns the freshness threshold this client was built with
    pub fn base_datetime(&self) -> NaiveDateTime {
        self.base_datetime
    }

    /// Gives access to the underlying API client
    pub fn api_mut(&mut self) -> &mut ApiClient {
        &mut self.api
    }

    /// Returns the data part for `resource_path`, from disk when possible
    ///
    /// Serves the oldest snapshot captured at or after the base datetime.
    /// When none qualifies, fetches live data through the authenticated
    /// client, persists it under the current capture time, and returns it.
    ///
    /// # Returns
    /// * `Err(CacheError::InvalidPath)` if the path lacks its leading `/`
    ///   (checked before any I/O)
    pub async fn get_data(&mut self, resource_path: &str) -> Result<Value, CacheError> {
        if !resource_path.starts_with('/') {
            return Err(CacheError::InvalidPath(resource_path.to_string()));
        }

        if let Some(snapshot) = self
            .store
            .find_at_or_after(resource_path, self.base_datetime)?
        {
            debug!(resource_path, snapshot = %snapshot.display(), "serving cached snapshot");
            return SnapshotStore::read(&snapshot);
        }

        debug!(resource_path, "no snapshot at or after threshold; fetching live data");
        let data = self.api.fetch_data_part(resource_path).await?;
        let written = self
            .store
            .write_capture(resource_path, Local::now().naive_local(), &data)?;
        debug!(snapshot = %written.display(), "captured new snapshot");
        Ok(data)
    }

    /// Like [`CachedClient::get_data`], converted to rows
    ///
    /// Cache hits and live fetches are tabulated identically.
    pub async fn get_records(
        &mut self,
        resource_path: &str,
    ) -> Result<Vec<Map<String, Value>>, CacheError> {
        let data = self.get_data(resource_path).await?;
        Ok(api::to_records(data)?)
    }
}
