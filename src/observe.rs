//! Metrics hooks
//!
//! Narrow interface through which the cache and the rate limiter report
//! counters. Exporters live outside this crate.

use std::fmt;
use std::sync::Arc;

use tracing::trace;

/// Receives counters and timings from the governance layer.
pub trait MetricsSink: Send + Sync + fmt::Debug {
    /// Adds `value` to the counter `name`.
    fn increment_counter(&self, name: &'static str, value: u64);

    /// Records one observation for the histogram `name`.
    fn observe_histogram(&self, name: &'static str, value: f64);
}

pub type SharedMetrics = Arc<dyn MetricsSink>;

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment_counter(&self, _name: &'static str, _value: u64) {}

    fn observe_histogram(&self, _name: &'static str, _value: f64) {}
}

/// Emits every metric as a `trace` event, useful while debugging locally.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn increment_counter(&self, name: &'static str, value: u64) {
        trace!(metric = name, value, "counter");
    }

    fn observe_histogram(&self, name: &'static str, value: f64) {
        trace!(metric = name, value, "histogram");
    }
}

pub fn noop_metrics() -> SharedMetrics {
    Arc::new(NoopMetrics)
}

// Metric names
pub const CACHE_HITS: &str = "cache_hits_total";
pub const CACHE_MISSES: &str = "cache_misses_total";
pub const CACHE_EVICTIONS: &str = "cache_evictions_total";
pub const CACHE_MEMORY_CLEANUPS: &str = "cache_memory_cleanups_total";
pub const RATE_LIMIT_ALLOWED: &str = "rate_limit_allowed_total";
pub const RATE_LIMIT_DENIED: &str = "rate_limit_denied_total";
pub const RATE_LIMIT_BACKEND_FAILURES: &str = "rate_limit_backend_failures_total";
pub const RATE_LIMIT_CHECK_SECONDS: &str = "rate_limit_check_duration_seconds";
