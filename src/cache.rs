//! Discovery result cache.
//!
//! Maps a bookmarked page URL to the outcome of the last forward discovery
//! for it. An entry with an empty `feed_url` is a negative result ("checked,
//! no feed"), which is different from having no entry at all.
//!
//! The whole map is loaded once at start and written once at the end of a
//! run. Loading never fails: a missing or unreadable snapshot yields an empty
//! cache. Saving replaces the snapshot atomically.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::write_atomic;

/// Snapshot format version. Bump when `CacheEntry` changes incompatibly;
/// older snapshots are then discarded on load.
const SNAPSHOT_VERSION: u32 = 1;

/// One remembered discovery outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub url: String,
    /// Empty when discovery ran and found nothing.
    pub feed_url: String,
    pub feed_title: String,
    pub timestamp: DateTime<Utc>,
}

impl CacheEntry {
    /// True for a negative entry.
    pub fn is_negative(&self) -> bool {
        self.feed_url.is_empty()
    }
}

/// Result of a lookup that keeps misses apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    Fresh(CacheEntry),
    /// Present but older than the allowed age.
    Stale(CacheEntry),
    Missing,
}

/// Entry counts for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub total: usize,
    pub with_feed: usize,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to encode cache snapshot: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to write cache file '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    entries: HashMap<String, CacheEntry>,
}

/// Thread-safe cache shared by all workers of a run.
///
/// Reads take the shared lock and may run concurrently; `set` takes the
/// exclusive lock. Critical sections never span an await point.
#[derive(Debug)]
pub struct DiscoveryCache {
    path: PathBuf,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl DiscoveryCache {
    /// Creates an empty cache that will be saved to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Loads the snapshot at `path`, falling back to an empty cache.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let cache = Self::new(path);

        let bytes = match std::fs::read(&cache.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %cache.path.display(), "No cache file, starting with empty cache");
                return cache;
            }
            Err(e) => {
                tracing::warn!(path = %cache.path.display(), error = %e, "Failed to read cache file, starting with empty cache");
                return cache;
            }
        };

        match serde_json::from_slice::<Snapshot>(&bytes) {
            Ok(snapshot) if snapshot.version == SNAPSHOT_VERSION => {
                tracing::info!(
                    path = %cache.path.display(),
                    entries = snapshot.entries.len(),
                    "Loaded discovery cache"
                );
                *cache.write() = snapshot.entries;
            }
            Ok(snapshot) => {
                tracing::warn!(
                    path = %cache.path.display(),
                    version = snapshot.version,
                    "Unsupported cache version, starting with empty cache"
                );
            }
            Err(e) => {
                tracing::warn!(path = %cache.path.display(), error = %e, "Corrupt cache file, starting with empty cache");
            }
        }

        cache
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Looks up `url`, telling fresh hits from stale entries and absence.
    ///
    /// An entry is stale when it is strictly older than `max_age_hours`, so
    /// an entry written in the current second is fresh even with a max age
    /// of zero.
    pub fn lookup(&self, url: &str, max_age_hours: u64) -> CacheLookup {
        let Some(entry) = self.read().get(url).cloned() else {
            return CacheLookup::Missing;
        };

        let age_secs = (Utc::now() - entry.timestamp).num_seconds();
        let max_age_secs = i64::try_from(max_age_hours.saturating_mul(3600)).unwrap_or(i64::MAX);

        if age_secs > max_age_secs {
            CacheLookup::Stale(entry)
        } else {
            CacheLookup::Fresh(entry)
        }
    }

    /// Fresh entry for `url`, or `None` when missing or stale.
    pub fn get(&self, url: &str, max_age_hours: u64) -> Option<CacheEntry> {
        match self.lookup(url, max_age_hours) {
            CacheLookup::Fresh(entry) => Some(entry),
            CacheLookup::Stale(_) | CacheLookup::Missing => None,
        }
    }

    /// Records a discovery outcome, replacing any previous entry for `url`.
    /// Pass an empty `feed_url` to record that no feed was found.
    pub fn set(&self, url: &str, feed_url: &str, feed_title: &str) {
        let entry = CacheEntry {
            url: url.to_string(),
            feed_url: feed_url.to_string(),
            feed_title: feed_title.to_string(),
            timestamp: Utc::now(),
        };
        self.write().insert(url.to_string(), entry);
    }

    #[cfg(test)]
    fn set_with_timestamp(&self, url: &str, feed_url: &str, timestamp: DateTime<Utc>) {
        let entry = CacheEntry {
            url: url.to_string(),
            feed_url: feed_url.to_string(),
            feed_title: String::new(),
            timestamp,
        };
        self.write().insert(url.to_string(), entry);
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.read();
        CacheStats {
            total: entries.len(),
            with_feed: entries.values().filter(|e| !e.is_negative()).count(),
        }
    }

    /// Writes the snapshot atomically, creating the parent directory.
    pub fn save(&self) -> Result<(), CacheError> {
        let json = {
            let entries = self.read();
            let snapshot = SnapshotRef {
                version: SNAPSHOT_VERSION,
                entries: &entries,
            };
            serde_json::to_vec(&snapshot)?
        };

        write_atomic(&self.path, &json).map_err(|source| CacheError::Write {
            path: self.path.clone(),
            source,
        })?;

        tracing::debug!(path = %self.path.display(), bytes = json.len(), "Saved discovery cache");
        Ok(())
    }

    // A panicking writer cannot leave a half-inserted entry, so a poisoned
    // lock still guards a consistent map.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    entries: &'a HashMap<String, CacheEntry>,
}
