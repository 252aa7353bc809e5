//! Configuration Module
//!
//! Handles loading, defaulting and validating configuration for the cache
//! manager, the rate limiter and the HTTP server. Values come from
//! environment variables; anything present but unparsable is a
//! [`ConfigError`], never a silent default.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::EvictionStrategy;
use crate::error::ConfigError;

/// Fill level that counts as memory pressure when no system reading exists.
pub const DEFAULT_PRESSURE_FILL_RATIO: f64 = 0.9;

// == Cache Config ==
/// Options for [`CacheManager`](crate::cache::CacheManager).
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Capacity bound triggering eviction
    pub max_size: usize,
    /// TTL applied when `set` omits one; None = entries never expire
    pub default_ttl: Option<Duration>,
    /// Ranking used for eviction
    pub eviction_strategy: EvictionStrategy,
    /// Fraction of system memory that triggers aggressive cleanup
    pub memory_threshold: f64,
    /// Time between janitor wakeups
    pub background_cleanup_interval: Duration,
    /// Whether `start()` launches the janitor at all
    pub enable_background_cleanup: bool,
    /// Aggressive cleanup shrinks the table to this fraction of `max_size`
    pub aggressive_target_ratio: f64,
    /// Fill ratio treated as pressure when the monitor has no reading
    pub pressure_fill_ratio: f64,
    /// Pause after a failed janitor iteration
    pub error_backoff: Duration,
    /// How long shutdown waits for the janitor before aborting it
    pub shutdown_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            default_ttl: Some(Duration::from_secs(300)),
            eviction_strategy: EvictionStrategy::Lru,
            memory_threshold: 0.8,
            background_cleanup_interval: Duration::from_secs(60),
            enable_background_cleanup: true,
            aggressive_target_ratio: 0.5,
            pressure_fill_ratio: DEFAULT_PRESSURE_FILL_RATIO,
            error_backoff: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(2),
        }
    }
}

impl CacheConfig {
    /// Checks every option. Called by the manager constructor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(ConfigError::invalid("max_size", "must be at least 1"));
        }
        check_ratio("memory_threshold", self.memory_threshold)?;
        check_ratio("aggressive_target_ratio", self.aggressive_target_ratio)?;
        check_ratio("pressure_fill_ratio", self.pressure_fill_ratio)?;
        if self.enable_background_cleanup && self.background_cleanup_interval.is_zero() {
            return Err(ConfigError::invalid(
                "background_cleanup_interval",
                "must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Number of entries aggressive cleanup shrinks the table to.
    pub fn aggressive_target(&self) -> usize {
        (self.max_size as f64 * self.aggressive_target_ratio).floor() as usize
    }
}

// == Rate Limit Options ==
/// Admission algorithm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    TokenBucket,
    SlidingWindow,
    FixedWindow,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TokenBucket => "token_bucket",
            Self::SlidingWindow => "sliding_window",
            Self::FixedWindow => "fixed_window",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "token_bucket" => Ok(Self::TokenBucket),
            "sliding_window" => Ok(Self::SlidingWindow),
            "fixed_window" => Ok(Self::FixedWindow),
            other => Err(format!("unknown algorithm '{other}'")),
        }
    }
}

/// Where per-key limiter state lives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum BackendConfig {
    /// In-process table guarded by one mutex
    #[default]
    Memory,
    /// Shared Redis instance
    Redis {
        /// Connection URL, e.g. `redis://127.0.0.1:6379/0`
        url: String,
        /// Prefix prepended to every key
        key_prefix: String,
    },
}

impl BackendConfig {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Redis { .. } => "redis",
        }
    }
}

/// What to do when the backend cannot answer in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnavailablePolicy {
    /// Allow-open: admit the request and log a warning
    Allow,
    /// Deny-open: reject with `BackendUnavailable`
    #[default]
    Deny,
}

impl FromStr for UnavailablePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" => Ok(Self::Allow),
            "deny" => Ok(Self::Deny),
            other => Err(format!("unknown policy '{other}'")),
        }
    }
}

// == Rate Limit Config ==
/// Options for [`RateLimiter`](crate::rate_limit::RateLimiter).
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    pub algorithm: Algorithm,
    pub requests_per_second: f64,
    /// Bucket capacity, token bucket only
    pub burst_size: u32,
    /// Window length, required by the window algorithms
    pub window_size: Option<Duration>,
    pub backend: BackendConfig,
    /// Period of the stale-key sweep for the memory backend
    pub cleanup_interval: Duration,
    /// Upper bound on tracked keys for the memory backend
    pub max_keys: usize,
    /// Deadline for a single backend call
    pub backend_timeout: Duration,
    pub on_unavailable: UnavailablePolicy,
    /// Whether allowed responses carry rate limit headers
    pub include_headers: bool,
    /// Denial message, `{retry_after}` is replaced with seconds (one decimal)
    pub error_message_template: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::TokenBucket,
            requests_per_second: 10.0,
            burst_size: 20,
            window_size: None,
            backend: BackendConfig::Memory,
            cleanup_interval: Duration::from_secs(300),
            max_keys: 10_000,
            backend_timeout: Duration::from_millis(500),
            on_unavailable: UnavailablePolicy::Deny,
            include_headers: true,
            error_message_template: "Rate limit exceeded. Try again in {retry_after} seconds"
                .to_string(),
        }
    }
}

impl RateLimitConfig {
    /// Token bucket refilled at `requests_per_second` holding up to `burst_size`.
    pub fn token_bucket(requests_per_second: f64, burst_size: u32) -> Self {
        Self {
            algorithm: Algorithm::TokenBucket,
            requests_per_second,
            burst_size,
            ..Self::default()
        }
    }

    /// Sliding window admitting `requests_per_second * window` per window.
    pub fn sliding_window(requests_per_second: f64, window: Duration) -> Self {
        Self {
            algorithm: Algorithm::SlidingWindow,
            requests_per_second,
            window_size: Some(window),
            ..Self::default()
        }
    }

    /// Fixed window admitting `requests_per_second * window` per aligned window.
    pub fn fixed_window(requests_per_second: f64, window: Duration) -> Self {
        Self {
            algorithm: Algorithm::FixedWindow,
            requests_per_second,
            window_size: Some(window),
            ..Self::default()
        }
    }

    /// Checks every option. Called by the limiter constructor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.requests_per_second.is_finite() || self.requests_per_second <= 0.0 {
            return Err(ConfigError::invalid(
                "requests_per_second",
                "must be a positive number",
            ));
        }

        match self.algorithm {
            Algorithm::TokenBucket => {
                if self.burst_size == 0 {
                    return Err(ConfigError::invalid("burst_size", "must be at least 1"));
                }
            }
            Algorithm::SlidingWindow | Algorithm::FixedWindow => {
                let required_by = match self.algorithm {
                    Algorithm::SlidingWindow => "algorithm is sliding_window",
                    _ => "algorithm is fixed_window",
                };
                let window = self.window_size.ok_or(ConfigError::Missing {
                    option: "window_size",
                    required_by,
                })?;
                if window.is_zero() {
                    return Err(ConfigError::invalid("window_size", "must be greater than zero"));
                }
                if self.window_limit() == 0 {
                    return Err(ConfigError::invalid(
                        "window_size",
                        "requests_per_second * window_size must admit at least one request",
                    ));
                }
            }
        }

        if self.max_keys == 0 {
            return Err(ConfigError::invalid("max_keys", "must be at least 1"));
        }
        if self.cleanup_interval.is_zero() {
            return Err(ConfigError::invalid("cleanup_interval", "must be greater than zero"));
        }
        if self.backend_timeout.is_zero() {
            return Err(ConfigError::invalid("backend_timeout", "must be greater than zero"));
        }
        if let BackendConfig::Redis { url, .. } = &self.backend {
            if url.trim().is_empty() {
                return Err(ConfigError::Missing {
                    option: "redis url",
                    required_by: "backend is redis",
                });
            }
        }
        Ok(())
    }

    /// Requests admitted per window, `floor(requests_per_second * window_size)`.
    pub fn window_limit(&self) -> u64 {
        let window = self.window_size.map_or(0.0, |w| w.as_secs_f64());
        (self.requests_per_second * window).floor() as u64
    }

    /// Renders the denial message for `retry_after`.
    pub fn render_message(&self, retry_after: Duration) -> String {
        self.error_message_template
            .replace("{retry_after}", &format!("{:.1}", retry_after.as_secs_f64()))
    }
}

// == Server Config ==
/// Server configuration parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// HTTP server port
    pub server_port: u16,
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_port: 3000,
            cache: CacheConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `SERVER_PORT` - HTTP server port (default: 3000)
    /// - `CACHE_MAX_SIZE` - Maximum cache entries (default: 1000)
    /// - `CACHE_DEFAULT_TTL` - Default TTL in seconds, 0 disables expiry (default: 300)
    /// - `CACHE_EVICTION_STRATEGY` - lru, lfu or fifo (default: lru)
    /// - `CACHE_MEMORY_THRESHOLD` - Memory usage ratio triggering cleanup (default: 0.8)
    /// - `CACHE_CLEANUP_INTERVAL` - Janitor period in seconds (default: 60)
    /// - `CACHE_BACKGROUND_CLEANUP` - Enable the janitor (default: true)
    /// - `CACHE_AGGRESSIVE_TARGET` - Aggressive cleanup target ratio (default: 0.5)
    /// - `RATE_LIMIT_ALGORITHM` - token_bucket, sliding_window or fixed_window
    /// - `RATE_LIMIT_RPS` - Requests per second (default: 10)
    /// - `RATE_LIMIT_BURST` - Bucket size (default: 20)
    /// - `RATE_LIMIT_WINDOW` - Window size in seconds (no default)
    /// - `RATE_LIMIT_BACKEND` - memory or redis (default: memory)
    /// - `RATE_LIMIT_REDIS_URL` / `RATE_LIMIT_KEY_PREFIX` - Redis settings
    /// - `RATE_LIMIT_CLEANUP_INTERVAL` - Stale key sweep period in seconds (default: 300)
    /// - `RATE_LIMIT_MAX_KEYS` - Tracked key bound (default: 10000)
    /// - `RATE_LIMIT_BACKEND_TIMEOUT_MS` - Backend deadline (default: 500)
    /// - `RATE_LIMIT_ON_UNAVAILABLE` - allow or deny (default: deny)
    pub fn from_env() -> Result<Self, ConfigError> {
        let cache_defaults = CacheConfig::default();
        let default_ttl_secs: u64 = env_parse("CACHE_DEFAULT_TTL", 300)?;
        let cache = CacheConfig {
            max_size: env_parse("CACHE_MAX_SIZE", cache_defaults.max_size)?,
            default_ttl: (default_ttl_secs > 0).then(|| Duration::from_secs(default_ttl_secs)),
            eviction_strategy: env_parse("CACHE_EVICTION_STRATEGY", cache_defaults.eviction_strategy)?,
            memory_threshold: env_parse("CACHE_MEMORY_THRESHOLD", cache_defaults.memory_threshold)?,
            background_cleanup_interval: Duration::from_secs(env_parse("CACHE_CLEANUP_INTERVAL", 60)?),
            enable_background_cleanup: env_parse("CACHE_BACKGROUND_CLEANUP", true)?,
            aggressive_target_ratio: env_parse(
                "CACHE_AGGRESSIVE_TARGET",
                cache_defaults.aggressive_target_ratio,
            )?,
            ..cache_defaults
        };

        let limit_defaults = RateLimitConfig::default();
        let backend = match env_parse("RATE_LIMIT_BACKEND", "memory".to_string())?.as_str() {
            "memory" => BackendConfig::Memory,
            "redis" => BackendConfig::Redis {
                url: env::var("RATE_LIMIT_REDIS_URL").unwrap_or_default(),
                key_prefix: env::var("RATE_LIMIT_KEY_PREFIX")
                    .unwrap_or_else(|_| "rate_limit:".to_string()),
            },
            other => {
                return Err(ConfigError::invalid(
                    "RATE_LIMIT_BACKEND",
                    format!("unknown backend '{other}'"),
                ))
            }
        };
        let window_size = match env::var("RATE_LIMIT_WINDOW") {
            Ok(raw) => Some(Duration::from_secs(parse_value("RATE_LIMIT_WINDOW", &raw)?)),
            Err(_) => None,
        };
        let rate_limit = RateLimitConfig {
            algorithm: env_parse("RATE_LIMIT_ALGORITHM", limit_defaults.algorithm)?,
            requests_per_second: env_parse("RATE_LIMIT_RPS", limit_defaults.requests_per_second)?,
            burst_size: env_parse("RATE_LIMIT_BURST", limit_defaults.burst_size)?,
            window_size,
            backend,
            cleanup_interval: Duration::from_secs(env_parse("RATE_LIMIT_CLEANUP_INTERVAL", 300)?),
            max_keys: env_parse("RATE_LIMIT_MAX_KEYS", limit_defaults.max_keys)?,
            backend_timeout: Duration::from_millis(env_parse("RATE_LIMIT_BACKEND_TIMEOUT_MS", 500)?),
            on_unavailable: env_parse("RATE_LIMIT_ON_UNAVAILABLE", limit_defaults.on_unavailable)?,
            ..limit_defaults
        };

        let config = Self {
            server_port: env_parse("SERVER_PORT", 3000)?,
            cache,
            rate_limit,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates both component configurations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cache.validate()?;
        self.rate_limit.validate()
    }
}

fn env_parse<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(name) {
        Ok(raw) => parse_value(name, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_value<T>(name: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::invalid(name, format!("'{raw}': {e}")))
}

fn check_ratio(option: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(option, format!("{value} is outside (0, 1]")))
    }
}
