//! Cache Statistics Module
//!
//! Tracks store-level counters: hits, misses, and lazily purged entries.
//! Expired entries are surfaced to callers exactly like absent ones, so the
//! expired counter is the only place the distinction is kept.

use serde::Serialize;

// == Cache Stats ==
/// Cache performance counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Successful reads
    pub hits: u64,
    /// Reads of absent keys
    pub misses: u64,
    /// Entries purged lazily because their absolute expiry had passed
    pub expired_purges: u64,
    /// Current number of entries held by the in-process fallback
    pub fallback_entries: usize,
    /// Whether the durable backend is still in use
    pub backend_active: bool,
}

impl CacheStats {
    /// Calculates the cache hit rate.
    ///
    /// Returns hits / (hits + misses), or 0.0 if no reads have been made.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
