use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Disables cache-size based garbage collection.
pub const CACHE_SIZE_UNLIMITED: i64 = -1;

const DEFAULT_CACHE_SIZE_BYTES: i64 = 100 * 1024 * 1024;

/// Tunables for the sync engine and its local store.
///
/// Every field has a default, so a partial JSON document deserializes:
///
/// ```
/// use firestore_sync_core::firestore::config::SyncEngineSettings;
///
/// let settings: SyncEngineSettings =
///     serde_json::from_str(r#"{ "max_pending_writes": 3 }"#).unwrap();
/// assert_eq!(settings.max_pending_writes, 3);
/// assert_eq!(settings.max_concurrent_limbo_resolutions, 100);
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncEngineSettings {
    /// Limbo documents beyond this many wait in a queue for a free slot.
    pub max_concurrent_limbo_resolutions: usize,
    /// Garbage collection only runs once the remote document cache is larger
    /// than this. [`CACHE_SIZE_UNLIMITED`] turns collection off.
    pub cache_size_bytes: i64,
    /// Share of orphaned documents, oldest first, removed by one pass.
    pub gc_percentile_to_collect: u32,
    pub gc_maximum_sequence_numbers_to_collect: usize,
    /// A resume token that is only refreshed (no document changes) is written
    /// back to the target cache once the cached one is older than this.
    pub resume_token_max_age: Duration,
    /// Number of write batches in flight to the backend at once.
    pub max_pending_writes: usize,
    /// Consecutive watch stream failures before the client reports offline.
    pub max_watch_stream_failures: u32,
}

impl Default for SyncEngineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_limbo_resolutions: 100,
            cache_size_bytes: DEFAULT_CACHE_SIZE_BYTES,
            gc_percentile_to_collect: 10,
            gc_maximum_sequence_numbers_to_collect: 1000,
            resume_token_max_age: Duration::from_secs(5 * 60),
            max_pending_writes: 10,
            max_watch_stream_failures: 1,
        }
    }
}

impl SyncEngineSettings {
    pub fn with_cache_size_bytes(mut self, cache_size_bytes: i64) -> Self {
        self.cache_size_bytes = cache_size_bytes;
        self
    }

    pub fn with_max_concurrent_limbo_resolutions(mut self, limit: usize) -> Self {
        self.max_concurrent_limbo_resolutions = limit;
        self
    }

    pub fn gc_enabled(&self) -> bool {
        self.cache_size_bytes != CACHE_SIZE_UNLIMITED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_fields() {
        let settings: SyncEngineSettings =
            serde_json::from_str(r#"{ "cache_size_bytes": -1 }"#).unwrap();
        assert!(!settings.gc_enabled());
        assert_eq!(settings.max_pending_writes, 10);
        assert_eq!(settings.resume_token_max_age, Duration::from_secs(300));
    }
}
