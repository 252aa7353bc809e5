//! Cache Statistics Module
//!
//! Tracks cache performance metrics including hits, misses, and evictions.

use serde::Serialize;

// == Cache Stats ==
/// Tracks cache performance metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Number of successful cache retrievals
    pub hits: u64,
    /// Number of failed cache retrievals (key not found or expired)
    pub misses: u64,
    /// Number of entries removed to stay within capacity
    pub evictions: u64,
    /// Number of entries removed because their TTL elapsed
    pub expirations: u64,
    /// Number of aggressive cleanup passes
    pub memory_cleanups: u64,
    /// Number of janitor wakeups that detected memory pressure
    pub memory_pressure_triggers: u64,
    /// Unix milliseconds of the last aggressive cleanup
    pub last_memory_cleanup: Option<u64>,
    /// Current number of entries in the cache
    pub total_entries: usize,
    /// Configured capacity
    pub max_size: usize,
}

impl CacheStats {
    // == Constructor ==
    /// Creates a new CacheStats with all counters at zero.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            ..Self::default()
        }
    }

    // == Hit Rate ==
    /// Calculates the cache hit rate.
    ///
    /// Returns hits / (hits + misses), or 0.0 if no requests have been made.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Complement of [`CacheStats::hit_rate`].
    pub fn miss_rate(&self) -> f64 {
        1.0 - self.hit_rate()
    }

    pub(crate) fn record_hit(&mut self) {
        self.hits += 1;
    }

    pub(crate) fn record_miss(&mut self) {
        self.misses += 1;
    }

    pub(crate) fn record_evictions(&mut self, count: usize) {
        self.evictions += count as u64;
    }

    pub(crate) fn record_expirations(&mut self, count: usize) {
        self.expirations += count as u64;
    }

    pub(crate) fn record_memory_cleanup(&mut self, now_ms: u64) {
        self.memory_cleanups += 1;
        self.last_memory_cleanup = Some(now_ms);
    }

    pub(crate) fn record_pressure_trigger(&mut self) {
        self.memory_pressure_triggers += 1;
    }

    pub(crate) fn set_total_entries(&mut self, count: usize) {
        self.total_entries = count;
    }
}
