//! Admission algorithms
//!
//! Pure per-key state machines. Backends own the state and call these under
//! their own synchronization; nothing here touches a clock or a lock.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;

use crate::config::{Algorithm, RateLimitConfig};

/// Lower bound on a sliding window retry hint, in milliseconds.
pub const MIN_SLIDING_RETRY_MS: u64 = 100;

// == Allow Info ==
/// Admission metadata returned with every decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AllowInfo {
    /// Requests admitted per bucket or window
    pub limit: u64,
    /// Requests still available right now
    pub remaining: u64,
    /// Unix timestamp (seconds) at which the allowance is fully restored
    pub reset: f64,
    /// Seconds to wait before retrying, 0 when allowed
    pub retry_after: f64,
}

impl AllowInfo {
    pub fn retry_after_duration(&self) -> Duration {
        Duration::from_secs_f64(self.retry_after.max(0.0))
    }
}

/// Result of one admission attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    pub info: AllowInfo,
}

impl Decision {
    fn allow(limit: u64, remaining: u64, reset_ms: u64) -> Self {
        Self {
            allowed: true,
            info: AllowInfo {
                limit,
                remaining,
                reset: ms_to_secs(reset_ms),
                retry_after: 0.0,
            },
        }
    }

    fn deny(limit: u64, now_ms: u64, retry_after_ms: u64) -> Self {
        Self {
            allowed: false,
            info: AllowInfo {
                limit,
                remaining: 0,
                reset: ms_to_secs(now_ms.saturating_add(retry_after_ms)),
                retry_after: ms_to_secs(retry_after_ms),
            },
        }
    }
}

pub(crate) fn ms_to_secs(ms: u64) -> f64 {
    ms as f64 / 1000.0
}

// == Policy ==
/// Algorithm parameters resolved from a validated [`RateLimitConfig`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimitPolicy {
    pub algorithm: Algorithm,
    pub requests_per_second: f64,
    pub burst_size: u32,
    /// Window length in ms, 0 for the token bucket
    pub window_ms: u64,
    /// Bucket capacity or per-window allowance
    pub limit: u64,
}

impl LimitPolicy {
    pub fn from_config(config: &RateLimitConfig) -> Self {
        let limit = match config.algorithm {
            Algorithm::TokenBucket => u64::from(config.burst_size),
            Algorithm::SlidingWindow | Algorithm::FixedWindow => config.window_limit(),
        };
        Self {
            algorithm: config.algorithm,
            requests_per_second: config.requests_per_second,
            burst_size: config.burst_size,
            window_ms: config.window_size.map_or(0, |w| w.as_millis() as u64),
            limit,
        }
    }

    /// Time after which untouched state carries no information: a window
    /// has fully slid past, or a bucket has fully refilled.
    pub fn stale_after_ms(&self) -> u64 {
        match self.algorithm {
            Algorithm::TokenBucket => {
                let refill_ms =
                    (f64::from(self.burst_size) / self.requests_per_second * 1000.0).ceil() as u64;
                refill_ms.max(self.window_ms)
            }
            Algorithm::SlidingWindow | Algorithm::FixedWindow => self.window_ms,
        }
    }

    /// Start of the aligned window containing `now_ms`.
    pub fn window_start(&self, now_ms: u64) -> u64 {
        if self.window_ms == 0 {
            return now_ms;
        }
        now_ms / self.window_ms * self.window_ms
    }
}

// == Token Bucket ==
/// `(tokens, last_refill)` for one key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketState {
    pub tokens: f64,
    pub last_refill_ms: u64,
}

impl TokenBucketState {
    /// A full bucket.
    pub fn new(policy: &LimitPolicy, now_ms: u64) -> Self {
        Self {
            tokens: f64::from(policy.burst_size),
            last_refill_ms: now_ms,
        }
    }

    pub fn acquire(&mut self, policy: &LimitPolicy, now_ms: u64) -> Decision {
        let burst = f64::from(policy.burst_size);
        let rate = policy.requests_per_second;

        let elapsed = ms_to_secs(now_ms.saturating_sub(self.last_refill_ms));
        self.tokens = (self.tokens + elapsed * rate).min(burst);
        self.last_refill_ms = self.last_refill_ms.max(now_ms);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            let refill_ms = ((burst - self.tokens) / rate * 1000.0).ceil() as u64;
            Decision::allow(
                policy.limit,
                self.tokens.floor() as u64,
                now_ms.saturating_add(refill_ms),
            )
        } else {
            let retry_ms = ((1.0 - self.tokens) / rate * 1000.0).ceil() as u64;
            Decision::deny(policy.limit, now_ms, retry_ms)
        }
    }
}

// == Sliding Window ==
/// Admission timestamps inside the current window, oldest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlidingWindowState {
    pub hits: VecDeque<u64>,
}

impl SlidingWindowState {
    pub fn acquire(&mut self, policy: &LimitPolicy, now_ms: u64) -> Decision {
        self.purge(policy, now_ms);

        let count = self.hits.len() as u64;
        if count < policy.limit {
            self.hits.push_back(now_ms);
            let oldest = self.hits.front().copied().unwrap_or(now_ms);
            return Decision::allow(
                policy.limit,
                policy.limit - count - 1,
                oldest.saturating_add(policy.window_ms),
            );
        }

        let oldest = self.hits.front().copied().unwrap_or(now_ms);
        let retry_ms = oldest
            .saturating_add(policy.window_ms)
            .saturating_sub(now_ms)
            .max(MIN_SLIDING_RETRY_MS);
        Decision::deny(policy.limit, now_ms, retry_ms)
    }

    /// Drops timestamps at or before `now - window`.
    pub fn purge(&mut self, policy: &LimitPolicy, now_ms: u64) {
        let cutoff = now_ms.saturating_sub(policy.window_ms);
        while self.hits.front().is_some_and(|&ts| ts <= cutoff) {
            self.hits.pop_front();
        }
    }
}

// == Fixed Window ==
/// Counter for the aligned window that was last seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixedWindowState {
    pub window_start_ms: u64,
    pub count: u64,
}

impl FixedWindowState {
    pub fn acquire(&mut self, policy: &LimitPolicy, now_ms: u64) -> Decision {
        let window_start = policy.window_start(now_ms);
        if window_start != self.window_start_ms {
            self.window_start_ms = window_start;
            self.count = 0;
        }

        let window_end = window_start.saturating_add(policy.window_ms);
        if self.count < policy.limit {
            self.count += 1;
            Decision::allow(policy.limit, policy.limit - self.count, window_end)
        } else {
            Decision::deny(policy.limit, now_ms, window_end.saturating_sub(now_ms))
        }
    }
}
