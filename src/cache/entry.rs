//! Cache Entry Module
//!
//! Defines the structure for individual cache entries with TTL and access
//! metadata used by the eviction strategies.

use std::time::Duration;

// == Cache Entry ==
/// Represents a single cache entry with value and metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// The stored value
    pub value: V,
    /// Creation timestamp (Unix milliseconds)
    pub created_at: u64,
    /// Time to live, None = no expiration
    pub ttl: Option<Duration>,
    /// Number of times the entry was written or read, starts at 1
    pub access_count: u64,
    /// Last access timestamp (Unix milliseconds)
    pub last_accessed: u64,
    /// Store-local sequence number at insertion, breaks `created_at` ties
    pub(crate) created_seq: u64,
    /// Store-local sequence number at last access, breaks `last_accessed` ties
    pub(crate) accessed_seq: u64,
}

impl<V> CacheEntry<V> {
    // == Constructor ==
    /// Creates a new cache entry stamped at `now_ms`.
    ///
    /// # Arguments
    /// * `value` - The value to store
    /// * `ttl` - Optional time to live
    /// * `now_ms` - Current Unix timestamp in milliseconds
    pub fn new(value: V, ttl: Option<Duration>, now_ms: u64) -> Self {
        Self {
            value,
            created_at: now_ms,
            ttl,
            access_count: 1,
            last_accessed: now_ms,
            created_seq: 0,
            accessed_seq: 0,
        }
    }

    pub(crate) fn with_sequence(mut self, seq: u64) -> Self {
        self.created_seq = seq;
        self.accessed_seq = seq;
        self
    }

    // == Expires At ==
    /// Expiration timestamp in milliseconds, or None if the entry never expires.
    pub fn expires_at(&self) -> Option<u64> {
        self.ttl
            .map(|ttl| self.created_at.saturating_add(ttl.as_millis() as u64))
    }

    // == Is Expired ==
    /// Checks if the entry has expired at `now_ms`.
    ///
    /// An entry is expired once the current time is greater than or equal to
    /// `created_at + ttl`. Entries without a TTL never expire.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        match self.expires_at() {
            Some(expires) => now_ms >= expires,
            None => false,
        }
    }

    // == Touch ==
    /// Records an access. Never changes `created_at` or `ttl`.
    pub fn touch(&mut self, now_ms: u64) {
        self.last_accessed = now_ms;
        self.access_count = self.access_count.saturating_add(1);
    }

    pub(crate) fn touch_with_sequence(&mut self, now_ms: u64, seq: u64) {
        self.touch(now_ms);
        self.accessed_seq = seq;
    }

    // == Time To Live ==
    /// Returns remaining TTL in milliseconds, or None if no expiration is set.
    ///
    /// Returns `Some(0)` once the entry has expired.
    pub fn ttl_remaining_ms(&self, now_ms: u64) -> Option<u64> {
        self.expires_at()
            .map(|expires| expires.saturating_sub(now_ms))
    }
}
