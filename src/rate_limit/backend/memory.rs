//! In-memory rate limit storage.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{BackendError, BackendSnapshot, RateLimitBackend};
use crate::config::Algorithm;
use crate::rate_limit::algorithm::{
    Decision, FixedWindowState, LimitPolicy, SlidingWindowState, TokenBucketState,
};

#[derive(Debug, Clone)]
enum KeyState {
    Bucket(TokenBucketState),
    Sliding(SlidingWindowState),
    Fixed(FixedWindowState),
}

impl KeyState {
    fn fresh(policy: &LimitPolicy, now_ms: u64) -> Self {
        match policy.algorithm {
            Algorithm::TokenBucket => Self::Bucket(TokenBucketState::new(policy, now_ms)),
            Algorithm::SlidingWindow => Self::Sliding(SlidingWindowState::default()),
            Algorithm::FixedWindow => Self::Fixed(FixedWindowState::default()),
        }
    }

    fn matches(&self, algorithm: Algorithm) -> bool {
        matches!(
            (self, algorithm),
            (Self::Bucket(_), Algorithm::TokenBucket)
                | (Self::Sliding(_), Algorithm::SlidingWindow)
                | (Self::Fixed(_), Algorithm::FixedWindow)
        )
    }

    fn acquire(&mut self, policy: &LimitPolicy, now_ms: u64) -> Decision {
        match self {
            Self::Bucket(state) => state.acquire(policy, now_ms),
            Self::Sliding(state) => state.acquire(policy, now_ms),
            Self::Fixed(state) => state.acquire(policy, now_ms),
        }
    }
}

#[derive(Debug)]
struct Slot {
    state: KeyState,
    last_seen_ms: u64,
}

#[derive(Debug, Default)]
struct Table {
    slots: HashMap<String, Slot>,
    last_cleanup_ms: Option<u64>,
}

impl Table {
    fn purge_stale(&mut self, policy: &LimitPolicy, now_ms: u64) -> usize {
        let horizon = policy.stale_after_ms();
        let before = self.slots.len();
        self.slots
            .retain(|_, slot| now_ms.saturating_sub(slot.last_seen_ms) <= horizon);
        self.last_cleanup_ms = Some(now_ms);
        before - self.slots.len()
    }

    /// Drops the least recently seen keys until at most `bound` remain.
    fn enforce_bound(&mut self, bound: usize) -> usize {
        if self.slots.len() <= bound {
            return 0;
        }
        let mut by_age: Vec<(u64, String)> = self
            .slots
            .iter()
            .map(|(key, slot)| (slot.last_seen_ms, key.clone()))
            .collect();
        by_age.sort_unstable();

        let excess = self.slots.len() - bound;
        for (_, key) in by_age.into_iter().take(excess) {
            self.slots.remove(&key);
        }
        excess
    }
}

/// Process-local backend. Every key's state sits behind one mutex that is
/// only held for the synchronous algorithm step.
#[derive(Debug)]
pub struct MemoryBackend {
    table: Mutex<Table>,
    max_keys: usize,
    cleanup_interval_ms: u64,
}

impl MemoryBackend {
    /// # Arguments
    /// * `max_keys` - Upper bound on tracked keys
    /// * `cleanup_interval` - Minimum time between inline stale-key sweeps
    pub fn new(max_keys: usize, cleanup_interval: Duration) -> Self {
        Self {
            table: Mutex::new(Table::default()),
            max_keys: max_keys.max(1),
            cleanup_interval_ms: cleanup_interval.as_millis() as u64,
        }
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of keys with live state.
    pub fn len(&self) -> usize {
        self.table().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().slots.is_empty()
    }
}

#[async_trait]
impl RateLimitBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn acquire(
        &self,
        key: &str,
        policy: &LimitPolicy,
        now_ms: u64,
    ) -> Result<Decision, BackendError> {
        let mut table = self.table();

        let sweep_due = table
            .last_cleanup_ms
            .map_or(true, |last| now_ms.saturating_sub(last) >= self.cleanup_interval_ms);
        let is_new = !table.slots.contains_key(key);
        if sweep_due || (is_new && table.slots.len() >= self.max_keys) {
            let stale = table.purge_stale(policy, now_ms);
            if stale > 0 {
                debug!(removed = stale, "dropped stale rate limit keys");
            }
        }
        if is_new {
            let dropped = table.enforce_bound(self.max_keys - 1);
            if dropped > 0 {
                debug!(dropped, max_keys = self.max_keys, "rate limit key table full");
            }
        }

        let slot = table.slots.entry(key.to_string()).or_insert_with(|| Slot {
            state: KeyState::fresh(policy, now_ms),
            last_seen_ms: now_ms,
        });
        if !slot.state.matches(policy.algorithm) {
            slot.state = KeyState::fresh(policy, now_ms);
        }
        slot.last_seen_ms = now_ms;
        Ok(slot.state.acquire(policy, now_ms))
    }

    async fn reset(&self, key: &str) -> Result<bool, BackendError> {
        Ok(self.table().slots.remove(key).is_some())
    }

    async fn cleanup(&self, policy: &LimitPolicy, now_ms: u64) -> Result<usize, BackendError> {
        let mut table = self.table();
        let removed = table.purge_stale(policy, now_ms) + table.enforce_bound(self.max_keys);
        Ok(removed)
    }

    fn snapshot(&self) -> BackendSnapshot {
        let table = self.table();
        let active_buckets = table
            .slots
            .values()
            .filter(|slot| matches!(slot.state, KeyState::Bucket(_)))
            .count();
        BackendSnapshot {
            active_buckets,
            active_windows: table.slots.len() - active_buckets,
            last_cleanup: table.last_cleanup_ms,
        }
    }
}
