//! Storage backends for rate limiting.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::rate_limit::algorithm::{Decision, LimitPolicy};

pub mod memory;
pub mod redis;

pub use self::memory::MemoryBackend;
pub use self::redis::RedisBackend;

/// Backend-side view reported in limiter stats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackendSnapshot {
    /// Keys holding token bucket state
    pub active_buckets: usize,
    /// Keys holding sliding or fixed window state
    pub active_windows: usize,
    /// Unix ms of the last stale-key sweep
    pub last_cleanup: Option<u64>,
}

/// Stores per-key limiter state and applies an algorithm to it atomically.
#[async_trait]
pub trait RateLimitBackend: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Runs one admission attempt for `key` at `now_ms`.
    async fn acquire(
        &self,
        key: &str,
        policy: &LimitPolicy,
        now_ms: u64,
    ) -> Result<Decision, BackendError>;

    /// Forgets all state for `key`. Returns true if anything was removed.
    async fn reset(&self, key: &str) -> Result<bool, BackendError>;

    /// Drops state that has gone stale. Returns the number of keys removed.
    async fn cleanup(&self, policy: &LimitPolicy, now_ms: u64) -> Result<usize, BackendError>;

    /// Whether the limiter should run a periodic sweep for this backend.
    fn needs_sweep(&self) -> bool {
        true
    }

    fn snapshot(&self) -> BackendSnapshot {
        BackendSnapshot::default()
    }
}

/// Errors that can occur in storage backends.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The store could not be reached.
    #[error("connection error: {0}")]
    Connection(String),

    /// The store answered with an error.
    #[error("query error: {0}")]
    Query(String),

    /// The store did not answer within the deadline.
    #[error("backend did not answer within {0:?}")]
    Timeout(Duration),
}
