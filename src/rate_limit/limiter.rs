//! Rate Limiter
//!
//! Façade that resolves keys, runs the configured algorithm against a
//! backend, and turns backend trouble into the configured allow/deny policy.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::algorithm::{ms_to_secs, AllowInfo, Decision, LimitPolicy};
use super::backend::{BackendError, MemoryBackend, RateLimitBackend, RedisBackend};
use super::key::RateLimitKey;
use crate::clock::{system_clock, SharedClock};
use crate::config::{Algorithm, BackendConfig, RateLimitConfig, UnavailablePolicy};
use crate::error::{ConfigError, RateLimitError};
use crate::observe::{self, SharedMetrics};
use crate::tasks::{spawn_periodic_task, BackgroundTask};

const SWEEP_ERROR_BACKOFF: Duration = Duration::from_secs(5);
const SWEEP_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

// == Stats ==
/// Configuration and counters reported by [`RateLimiter::get_stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitStats {
    pub algorithm: Algorithm,
    pub backend: &'static str,
    pub requests_per_second: f64,
    pub burst_size: u32,
    pub window_size: Option<f64>,
    pub limit: u64,
    pub max_keys: usize,
    pub allowed: u64,
    pub denied: u64,
    pub backend_failures: u64,
    pub active_buckets: usize,
    pub active_windows: usize,
    pub last_cleanup: Option<u64>,
}

/// A handler's value together with the admission that let it run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimited<T> {
    pub value: T,
    pub rate_limit: AllowInfo,
}

#[derive(Debug, Default)]
struct Counters {
    allowed: AtomicU64,
    denied: AtomicU64,
    backend_failures: AtomicU64,
}

// == Builder ==
pub struct RateLimiterBuilder {
    config: RateLimitConfig,
    backend: Option<Arc<dyn RateLimitBackend>>,
    clock: SharedClock,
    metrics: SharedMetrics,
}

impl RateLimiterBuilder {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            backend: None,
            clock: system_clock(),
            metrics: observe::noop_metrics(),
        }
    }

    /// Uses `backend` instead of the one named in the configuration.
    pub fn backend(mut self, backend: Arc<dyn RateLimitBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Validates the configuration and creates the limiter.
    pub fn build(self) -> Result<RateLimiter, ConfigError> {
        self.config.validate()?;

        let backend = match self.backend {
            Some(backend) => backend,
            None => backend_from_config(&self.config)?,
        };
        let policy = LimitPolicy::from_config(&self.config);

        info!(
            algorithm = %self.config.algorithm,
            backend = backend.name(),
            requests_per_second = self.config.requests_per_second,
            limit = policy.limit,
            "rate limiter initialized"
        );

        Ok(RateLimiter {
            config: self.config,
            policy,
            backend,
            clock: self.clock,
            metrics: self.metrics,
            counters: Counters::default(),
            sweeper: Mutex::new(None),
        })
    }
}

fn backend_from_config(config: &RateLimitConfig) -> Result<Arc<dyn RateLimitBackend>, ConfigError> {
    match &config.backend {
        BackendConfig::Memory => Ok(Arc::new(MemoryBackend::new(
            config.max_keys,
            config.cleanup_interval,
        ))),
        BackendConfig::Redis { url, key_prefix } => {
            let backend = RedisBackend::new(url, key_prefix.clone())
                .map_err(|e| ConfigError::invalid("redis url", e.to_string()))?;
            Ok(Arc::new(backend))
        }
    }
}

// == Rate Limiter ==
/// Admission control shared by every handler of a server process.
pub struct RateLimiter {
    config: RateLimitConfig,
    policy: LimitPolicy,
    backend: Arc<dyn RateLimitBackend>,
    clock: SharedClock,
    metrics: SharedMetrics,
    counters: Counters,
    sweeper: Mutex<Option<BackgroundTask>>,
}

impl RateLimiter {
    /// Creates a limiter with the backend named in `config`.
    pub fn new(config: RateLimitConfig) -> Result<Self, ConfigError> {
        RateLimiterBuilder::new(config).build()
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn policy(&self) -> &LimitPolicy {
        &self.policy
    }

    // == Check ==
    /// Consumes one unit of allowance for `key`.
    ///
    /// Denial is [`RateLimitError::Exceeded`] carrying the retry hint.
    /// [`RateLimitError::BackendUnavailable`] is only returned when the
    /// backend fails and the policy is to deny.
    pub async fn check(&self, key: &RateLimitKey) -> Result<AllowInfo, RateLimitError> {
        self.check_resolved(&key.resolve()).await
    }

    /// Like [`check`](Self::check) for an already resolved key.
    pub async fn check_resolved(&self, key: &str) -> Result<AllowInfo, RateLimitError> {
        let now = self.clock.now_ms();
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            self.config.backend_timeout,
            self.backend.acquire(key, &self.policy, now),
        )
        .await;
        self.metrics.observe_histogram(
            observe::RATE_LIMIT_CHECK_SECONDS,
            started.elapsed().as_secs_f64(),
        );

        let decision = match outcome {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => return self.backend_unavailable(key, e, now),
            Err(_) => {
                let e = BackendError::Timeout(self.config.backend_timeout);
                return self.backend_unavailable(key, e, now);
            }
        };
        self.admit(key, decision)
    }

    fn admit(&self, key: &str, decision: Decision) -> Result<AllowInfo, RateLimitError> {
        let info = decision.info;
        if decision.allowed {
            self.counters.allowed.fetch_add(1, Ordering::Relaxed);
            self.metrics.increment_counter(observe::RATE_LIMIT_ALLOWED, 1);
            debug!(key, remaining = info.remaining, "rate limit check passed");
            return Ok(info);
        }

        self.counters.denied.fetch_add(1, Ordering::Relaxed);
        self.metrics.increment_counter(observe::RATE_LIMIT_DENIED, 1);
        let retry_after = info.retry_after_duration();
        debug!(key, retry_after = info.retry_after, "rate limit exceeded");
        Err(RateLimitError::Exceeded {
            message: self.config.render_message(retry_after),
            retry_after,
            limit: info.limit,
            remaining: info.remaining,
        })
    }

    fn backend_unavailable(
        &self,
        key: &str,
        error: BackendError,
        now_ms: u64,
    ) -> Result<AllowInfo, RateLimitError> {
        self.counters.backend_failures.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .increment_counter(observe::RATE_LIMIT_BACKEND_FAILURES, 1);

        match self.config.on_unavailable {
            UnavailablePolicy::Allow => {
                warn!(key, backend = self.backend.name(), error = %error, "rate limit backend unavailable, allowing request");
                self.counters.allowed.fetch_add(1, Ordering::Relaxed);
                self.metrics.increment_counter(observe::RATE_LIMIT_ALLOWED, 1);
                Ok(AllowInfo {
                    limit: self.policy.limit,
                    remaining: self.policy.limit,
                    reset: ms_to_secs(now_ms),
                    retry_after: 0.0,
                })
            }
            UnavailablePolicy::Deny => {
                warn!(key, backend = self.backend.name(), error = %error, "rate limit backend unavailable, denying request");
                Err(RateLimitError::BackendUnavailable(error.to_string()))
            }
        }
    }

    /// Non-failing form of [`check`](Self::check).
    pub async fn is_allowed(&self, key: &RateLimitKey) -> (bool, AllowInfo) {
        match self.check(key).await {
            Ok(info) => (true, info),
            Err(RateLimitError::Exceeded {
                retry_after,
                limit,
                remaining,
                ..
            }) => {
                let now = self.clock.now_secs();
                let retry = retry_after.as_secs_f64();
                (
                    false,
                    AllowInfo {
                        limit,
                        remaining,
                        reset: now + retry,
                        retry_after: retry,
                    },
                )
            }
            Err(RateLimitError::BackendUnavailable(_)) => (
                false,
                AllowInfo {
                    limit: self.policy.limit,
                    remaining: 0,
                    reset: self.clock.now_secs(),
                    retry_after: 0.0,
                },
            ),
        }
    }

    /// Checks `key`, then runs `handler` and returns its value with the
    /// admission metadata attached. The handler does not run on denial.
    pub async fn run<T, F, Fut>(
        &self,
        key: &RateLimitKey,
        handler: F,
    ) -> Result<RateLimited<T>, RateLimitError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let rate_limit = self.check(key).await?;
        let value = handler().await;
        Ok(RateLimited { value, rate_limit })
    }

    // == Reset ==
    /// Clears all state for a resolved key. Returns true if state existed.
    pub async fn reset_key(&self, key: &str) -> bool {
        match tokio::time::timeout(self.config.backend_timeout, self.backend.reset(key)).await {
            Ok(Ok(removed)) => {
                info!(key, removed, "rate limit key reset");
                removed
            }
            Ok(Err(e)) => {
                warn!(key, error = %e, "failed to reset rate limit key");
                false
            }
            Err(_) => {
                warn!(key, "timed out resetting rate limit key");
                false
            }
        }
    }

    // == Stats ==
    pub fn get_stats(&self) -> RateLimitStats {
        let snapshot = self.backend.snapshot();
        RateLimitStats {
            algorithm: self.config.algorithm,
            backend: self.backend.name(),
            requests_per_second: self.config.requests_per_second,
            burst_size: self.config.burst_size,
            window_size: self.config.window_size.map(|w| w.as_secs_f64()),
            limit: self.policy.limit,
            max_keys: self.config.max_keys,
            allowed: self.counters.allowed.load(Ordering::Relaxed),
            denied: self.counters.denied.load(Ordering::Relaxed),
            backend_failures: self.counters.backend_failures.load(Ordering::Relaxed),
            active_buckets: snapshot.active_buckets,
            active_windows: snapshot.active_windows,
            last_cleanup: snapshot.last_cleanup,
        }
    }

    // == Lifecycle ==
    /// Starts the periodic stale-key sweep. Returns false when the backend
    /// expires state itself or no Tokio runtime is available.
    pub fn start(&self) -> bool {
        if !self.backend.needs_sweep() {
            return false;
        }
        let mut slot = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return true;
        }

        let backend = Arc::clone(&self.backend);
        let clock = Arc::clone(&self.clock);
        let policy = self.policy;
        let task = spawn_periodic_task(
            "rate_limit_sweep",
            self.config.cleanup_interval,
            SWEEP_ERROR_BACKOFF,
            move || {
                let backend = Arc::clone(&backend);
                let now = clock.now_ms();
                async move {
                    let removed = backend.cleanup(&policy, now).await?;
                    if removed > 0 {
                        debug!(removed, "rate limit sweep completed");
                    }
                    Ok::<_, BackendError>(())
                }
            },
        );

        match task {
            Some(task) => {
                *slot = Some(task);
                true
            }
            None => false,
        }
    }

    /// Stops the sweep, waiting briefly for an in-flight iteration.
    pub async fn shutdown(&self) {
        let task = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.shutdown(SWEEP_SHUTDOWN_TIMEOUT).await;
        }
        info!(
            allowed = self.counters.allowed.load(Ordering::Relaxed),
            denied = self.counters.denied.load(Ordering::Relaxed),
            "rate limiter shut down"
        );
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        let slot = self.sweeper.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = slot.as_ref() {
            task.cancel();
        }
    }
}
