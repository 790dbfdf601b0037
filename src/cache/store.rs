//! Timestamp-named snapshot storage on disk
//!
//! Provides a `SnapshotStore` that persists one JSON file per capture, named
//! `YYYY-MM-DD HH:MM:SS.json`, in a directory tree mirroring the resource
//! path under the store root. The name format is fixed width at second
//! resolution, so lexicographic order equals chronological order; the
//! freshness scan in the cached client relies on this.
//!
//! All paths are built explicitly and passed to the file operations; the
//! process working directory is never touched.

use chrono::NaiveDateTime;
use serde_json::Value;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::CacheError;

/// Format of the capture timestamp embedded in snapshot file names
const ENTRY_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// File extension for snapshot entries
const ENTRY_EXTENSION: &str = ".json";

/// Append-only store of timestamp-named JSON snapshots
///
/// The store creates resource directories on demand and writes new entries;
/// it never deletes or rewrites existing ones. Concurrent writers are not
/// synchronized: two captures of the same resource within the same second
/// race on one file name, and the last write wins.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    /// Directory the per-resource snapshot directories live under
    root: PathBuf,
}

impl SnapshotStore {
    /// Creates a store rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the store root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Builds the file name a capture at `at` is stored under
    pub fn entry_name(at: NaiveDateTime) -> String {
        format!("{}{}", at.format(ENTRY_TIME_FORMAT), ENTRY_EXTENSION)
    }

    /// Parses a file name back to its capture time
    ///
    /// Returns `None` for names that do not match the snapshot pattern, so
    /// foreign files in a cache directory are ignored rather than served.
    pub fn parse_entry_name(name: &str) -> Option<NaiveDateTime> {
        let stem = name.strip_suffix(ENTRY_EXTENSION)?;
        // Fixed-width stems only: the chronological ordering of the sorted
        // listing depends on it, and the parser alone accepts unpadded parts
        if stem.len() != "0000-00-00 00:00:00".len() {
            return None;
        }
        NaiveDateTime::parse_from_str(stem, ENTRY_TIME_FORMAT).ok()
    }

    /// Resolves the directory snapshots of `resource_path` live in
    ///
    /// The path's segments are mirrored under the store root, so
    /// `/listed/info` maps to `<root>/listed/info/`.
    pub fn resource_dir(&self, resource_path: &str) -> PathBuf {
        let mut dir = self.root.clone();
        for segment in resource_path.split('/').filter(|s| !s.is_empty()) {
            dir.push(segment);
        }
        dir
    }

    /// Lists snapshot names in `dir`, pattern-filtered and sorted ascending
    ///
    /// Ascending lexicographic order is ascending capture order.
    pub fn list_entries(dir: &Path) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if Self::parse_entry_name(name).is_some() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Finds the oldest snapshot of `resource_path` captured at or after
    /// `threshold`
    ///
    /// Creates the resource directory if it does not exist yet. Returns
    /// `None` when every existing entry predates the threshold.
    pub fn find_at_or_after(
        &self,
        resource_path: &str,
        threshold: NaiveDateTime,
    ) -> Result<Option<PathBuf>, CacheError> {
        let dir = self.resource_dir(resource_path);
        fs::create_dir_all(&dir)?;

        let threshold_name = Self::entry_name(threshold);
        for name in Self::list_entries(&dir)? {
            if name >= threshold_name {
                return Ok(Some(dir.join(name)));
            }
        }
        Ok(None)
    }

    /// Reads a snapshot back as JSON
    pub fn read(path: &Path) -> Result<Value, CacheError> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Writes a new snapshot of `resource_path` captured at `at`
    ///
    /// Returns the path of the written entry.
    pub fn write_capture(
        &self,
        resource_path: &str,
        at: NaiveDateTime,
        value: &Value,
    ) -> Result<PathBuf, CacheError> {
        let dir = self.resource_dir(resource_path);
        fs::create_dir_all(&dir)?;

        let path = dir.join(Self::entry_name(at));
        let json = serde_json::to_string_pretty(value)?;
        fs::write(&path, json)?;
        Ok(path)
    }
}
