//! Rate Limit Module
//!
//! Admission control with token bucket, sliding window and fixed window
//! algorithms over an in-memory or Redis backend.

pub mod algorithm;
pub mod backend;
mod key;
mod limiter;
pub mod middleware;

pub use algorithm::{AllowInfo, Decision, LimitPolicy};
pub use backend::{BackendError, BackendSnapshot, MemoryBackend, RateLimitBackend, RedisBackend};
pub use key::{RateLimitKey, DEFAULT_KEY};
pub use limiter::{RateLimitStats, RateLimited, RateLimiter, RateLimiterBuilder};
pub use middleware::rate_limit_middleware;
