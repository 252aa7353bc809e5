//! Cache Store Module
//!
//! Bounded key table combining HashMap storage with TTL expiration and a
//! pluggable eviction strategy. The store is single-owner; the
//! [`CacheManager`](crate::cache::CacheManager) serializes access to it.

use std::collections::HashMap;
use std::time::Duration;

use tracing::debug;

use crate::cache::{CacheEntry, CacheStats, EvictionStrategy, MAX_KEY_LENGTH};
use crate::clock::{system_clock, SharedClock};

// == Cleanup Report ==
/// Outcome of a janitor pass over the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Entries dropped because their TTL elapsed
    pub expired: usize,
    /// Entries dropped by the eviction strategy
    pub evicted: usize,
}

// == Cache Store ==
/// Main cache storage with strategy-driven eviction and TTL support.
#[derive(Debug)]
pub struct CacheStore<V> {
    /// Key-value storage
    entries: HashMap<String, CacheEntry<V>>,
    /// Performance statistics
    stats: CacheStats,
    /// Maximum number of entries allowed
    max_size: usize,
    /// TTL for entries stored without an explicit one
    default_ttl: Option<Duration>,
    /// Ranking used when over capacity
    strategy: EvictionStrategy,
    /// Logical clock for deterministic tie breaking
    seq: u64,
    clock: SharedClock,
}

impl<V: Clone> CacheStore<V> {
    // == Constructor ==
    /// Creates a new CacheStore.
    ///
    /// # Arguments
    /// * `max_size` - Maximum number of entries the cache can hold
    /// * `default_ttl` - TTL applied when `set` is called without one
    /// * `strategy` - Eviction ranking
    pub fn new(max_size: usize, default_ttl: Option<Duration>, strategy: EvictionStrategy) -> Self {
        Self {
            entries: HashMap::new(),
            stats: CacheStats::new(max_size),
            max_size,
            default_ttl,
            strategy,
            seq: 0,
            clock: system_clock(),
        }
    }

    /// Replaces the time source.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    // == Set ==
    /// Stores a value, overwriting any previous entry for `key`.
    ///
    /// Expired entries are purged before the strategy is consulted, so live
    /// entries are only evicted when expiry alone cannot make room. Returns
    /// `false` if the value was not cached (oversized key).
    pub fn set(&mut self, key: String, value: V, ttl: Option<Duration>) -> bool {
        if key.len() > MAX_KEY_LENGTH {
            debug!(key_len = key.len(), "cache set skipped: key too long");
            return false;
        }

        let now = self.clock.now_ms();
        let effective_ttl = ttl.or(self.default_ttl);
        let seq = self.next_seq();
        let entry = CacheEntry::new(value, effective_ttl, now).with_sequence(seq);
        self.entries.insert(key.clone(), entry);

        if self.entries.len() > self.max_size {
            self.purge_expired(now);
            self.evict_to(self.max_size, Some(&key));
        }

        self.stats.set_total_entries(self.entries.len());
        true
    }

    // == Get ==
    /// Retrieves a value by key.
    ///
    /// Returns None for absent and expired keys, both counted as misses.
    /// Expired entries are removed on discovery.
    pub fn get(&mut self, key: &str) -> Option<V> {
        let now = self.clock.now_ms();
        let expired = match self.entries.get(key) {
            Some(entry) => entry.is_expired(now),
            None => {
                self.stats.record_miss();
                return None;
            }
        };

        if expired {
            self.entries.remove(key);
            self.stats.record_expirations(1);
            self.stats.record_miss();
            self.stats.set_total_entries(self.entries.len());
            return None;
        }

        let seq = self.next_seq();
        let entry = self.entries.get_mut(key)?;
        entry.touch_with_sequence(now, seq);
        self.stats.record_hit();
        Some(entry.value.clone())
    }

    /// Reads a live entry without touching it or the statistics.
    pub fn peek(&self, key: &str) -> Option<&CacheEntry<V>> {
        let now = self.clock.now_ms();
        self.entries.get(key).filter(|entry| !entry.is_expired(now))
    }

    // == Delete ==
    /// Removes an entry by key. Returns true if it existed.
    pub fn delete(&mut self, key: &str) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.stats.set_total_entries(self.entries.len());
        }
        removed
    }

    // == Clear ==
    /// Removes every entry, or only those whose key contains `pattern`.
    pub fn clear(&mut self, pattern: Option<&str>) -> usize {
        let count = match pattern {
            None => {
                let count = self.entries.len();
                self.entries.clear();
                count
            }
            Some(pattern) => {
                let before = self.entries.len();
                self.entries.retain(|key, _| !key.contains(pattern));
                before - self.entries.len()
            }
        };
        self.stats.set_total_entries(self.entries.len());
        count
    }

    /// Lists keys, optionally filtered by substring.
    pub fn keys(&self, pattern: Option<&str>) -> Vec<String> {
        self.entries
            .keys()
            .filter(|key| pattern.map_or(true, |p| key.contains(p)))
            .cloned()
            .collect()
    }

    // == Stats ==
    /// Returns current cache statistics.
    pub fn stats(&self) -> CacheStats {
        let mut stats = self.stats.clone();
        stats.set_total_entries(self.entries.len());
        stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut CacheStats {
        &mut self.stats
    }

    // == Cleanup Expired ==
    /// Removes all expired entries from the cache.
    ///
    /// Returns the number of entries removed.
    pub fn cleanup_expired(&mut self) -> usize {
        let now = self.clock.now_ms();
        let count = self.purge_expired(now);
        self.stats.set_total_entries(self.entries.len());
        count
    }

    fn purge_expired(&mut self, now: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let count = before - self.entries.len();
        self.stats.record_expirations(count);
        count
    }

    // == Evict ==
    /// Asks the strategy for enough victims to bring the store down to
    /// `target` entries and removes them.
    pub fn evict_to(&mut self, target: usize, protected: Option<&str>) -> usize {
        let victims = self
            .strategy
            .select_eviction_candidates(&self.entries, target, protected);
        for key in &victims {
            self.entries.remove(key);
        }
        if !victims.is_empty() {
            debug!(count = victims.len(), strategy = %self.strategy, "evicted cache entries");
            self.stats.record_evictions(victims.len());
            self.stats.set_total_entries(self.entries.len());
        }
        victims.len()
    }

    // == Aggressive Cleanup ==
    /// Purges expired entries, then evicts until at most `target` entries
    /// remain or the strategy has nothing left to offer.
    pub fn aggressive_cleanup(&mut self, target: usize) -> CleanupReport {
        let expired = self.cleanup_expired();
        let mut evicted = 0;
        while self.entries.len() > target {
            let removed = self.evict_to(target, None);
            if removed == 0 {
                break;
            }
            evicted += removed;
        }
        CleanupReport { expired, evicted }
    }

    // == Length ==
    /// Returns the current number of entries in the cache.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Configured capacity.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Configured eviction strategy.
    pub fn strategy(&self) -> EvictionStrategy {
        self.strategy
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }
}
