//! Redis-based rate limit storage.
//!
//! Each algorithm is a single Lua script so the read-modify-write of a key's
//! state is atomic on the server. No client-side locking is done. Keys carry
//! a Redis TTL of two windows (or two full refills for the token bucket) so
//! abandoned state expires on its own.

use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Client, RedisError, Script};
use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::info;

use super::{BackendError, RateLimitBackend};
use crate::config::Algorithm;
use crate::rate_limit::algorithm::{ms_to_secs, AllowInfo, Decision, LimitPolicy};

/// KEYS[1] bucket hash. ARGV: now_ms, rate, burst, ttl_ms.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local burst = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local state = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil or ts == nil then
  tokens = burst
  ts = now
end

local elapsed = math.max(0, now - ts) / 1000.0
tokens = math.min(burst, tokens + elapsed * rate)

local allowed = 0
local retry = 0
if tokens >= 1 then
  tokens = tokens - 1
  allowed = 1
else
  retry = math.ceil((1 - tokens) / rate * 1000)
end

redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'ts', math.max(now, ts))
redis.call('PEXPIRE', KEYS[1], ttl)

local reset = now + math.ceil((burst - tokens) / rate * 1000)
if allowed == 0 then
  reset = now + retry
end
return {allowed, math.floor(tokens), reset, retry}
"#;

/// KEYS[1] sorted set of hits, KEYS[2] member sequence. ARGV: now_ms,
/// window_ms, limit, ttl_ms, min_retry_ms.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])
local min_retry = tonumber(ARGV[5])

redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - window)
local count = redis.call('ZCARD', KEYS[1])

if count < limit then
  local seq = redis.call('INCR', KEYS[2])
  redis.call('ZADD', KEYS[1], now, now .. '-' .. seq)
  redis.call('PEXPIRE', KEYS[1], ttl)
  redis.call('PEXPIRE', KEYS[2], ttl)
  local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
  return {1, limit - count - 1, tonumber(oldest[2]) + window, 0}
end

local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
local retry = math.max(min_retry, tonumber(oldest[2]) + window - now)
return {0, 0, now + retry, retry}
"#;

/// KEYS[1] window hash. ARGV: now_ms, window_start_ms, window_ms, limit,
/// ttl_ms.
const FIXED_WINDOW_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local start = tonumber(ARGV[2])
local window = tonumber(ARGV[3])
local limit = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])

local state = redis.call('HMGET', KEYS[1], 'start', 'count')
local count = 0
if tonumber(state[1]) == start then
  count = tonumber(state[2]) or 0
end

local window_end = start + window
if count < limit then
  count = count + 1
  redis.call('HSET', KEYS[1], 'start', start, 'count', count)
  redis.call('PEXPIRE', KEYS[1], ttl)
  return {1, limit - count, window_end, 0}
end
return {0, 0, window_end, window_end - now}
"#;

/// Redis-backed limiter state shared by every process pointed at the same
/// server and prefix.
pub struct RedisBackend {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    key_prefix: String,
    token_bucket: Script,
    sliding_window: Script,
    fixed_window: Script,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("key_prefix", &self.key_prefix)
            .field("connected", &self.connection.initialized())
            .finish()
    }
}

impl RedisBackend {
    /// Parses `url` without connecting. The connection is opened on first
    /// use and re-established by the connection manager afterwards.
    pub fn new(url: &str, key_prefix: impl Into<String>) -> Result<Self, BackendError> {
        let client = Client::open(url).map_err(|e| BackendError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
            key_prefix: key_prefix.into(),
            token_bucket: Script::new(TOKEN_BUCKET_SCRIPT),
            sliding_window: Script::new(SLIDING_WINDOW_SCRIPT),
            fixed_window: Script::new(FIXED_WINDOW_SCRIPT),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, BackendError> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                let manager = ConnectionManager::new(self.client.clone())
                    .await
                    .map_err(map_redis_error)?;
                info!(prefix = %self.key_prefix, "connected to redis rate limit backend");
                Ok::<_, BackendError>(manager)
            })
            .await?;
        Ok(manager.clone())
    }

    fn storage_key(&self, key: &str, kind: &str) -> String {
        format!("{}{}:{}", self.key_prefix, key, kind)
    }

    fn all_keys(&self, key: &str) -> Vec<String> {
        ["bucket", "sliding", "sliding:seq", "fixed"]
            .iter()
            .map(|kind| self.storage_key(key, kind))
            .collect()
    }
}

/// Longest TTL handed to `PEXPIRE`; Redis rejects expiry times past `i64`.
const MAX_STATE_TTL_MS: u64 = 365 * 24 * 60 * 60 * 1000;

/// Redis TTL for a key's state, between one second and a year.
fn state_ttl_ms(policy: &LimitPolicy) -> u64 {
    policy
        .stale_after_ms()
        .saturating_mul(2)
        .clamp(1_000, MAX_STATE_TTL_MS)
}

fn map_redis_error(e: RedisError) -> BackendError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() {
        BackendError::Connection(e.to_string())
    } else {
        BackendError::Query(e.to_string())
    }
}

/// Converts a script reply `{allowed, remaining, reset_ms, retry_ms}`.
fn decode_reply(reply: &[i64], limit: u64) -> Result<Decision, BackendError> {
    match reply {
        [allowed, remaining, reset_ms, retry_ms] => Ok(Decision {
            allowed: *allowed == 1,
            info: AllowInfo {
                limit,
                remaining: (*remaining).max(0) as u64,
                reset: ms_to_secs((*reset_ms).max(0) as u64),
                retry_after: ms_to_secs((*retry_ms).max(0) as u64),
            },
        }),
        other => Err(BackendError::Query(format!(
            "unexpected script reply of length {}",
            other.len()
        ))),
    }
}

#[async_trait]
impl RateLimitBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn acquire(
        &self,
        key: &str,
        policy: &LimitPolicy,
        now_ms: u64,
    ) -> Result<Decision, BackendError> {
        let mut conn = self.connection().await?;
        let ttl = state_ttl_ms(policy);

        let reply: Vec<i64> = match policy.algorithm {
            Algorithm::TokenBucket => {
                self.token_bucket
                    .key(self.storage_key(key, "bucket"))
                    .arg(now_ms)
                    .arg(policy.requests_per_second)
                    .arg(policy.burst_size)
                    .arg(ttl)
                    .invoke_async(&mut conn)
                    .await
            }
            Algorithm::SlidingWindow => {
                self.sliding_window
                    .key(self.storage_key(key, "sliding"))
                    .key(self.storage_key(key, "sliding:seq"))
                    .arg(now_ms)
                    .arg(policy.window_ms)
                    .arg(policy.limit)
                    .arg(ttl)
                    .arg(crate::rate_limit::algorithm::MIN_SLIDING_RETRY_MS)
                    .invoke_async(&mut conn)
                    .await
            }
            Algorithm::FixedWindow => {
                self.fixed_window
                    .key(self.storage_key(key, "fixed"))
                    .arg(now_ms)
                    .arg(policy.window_start(now_ms))
                    .arg(policy.window_ms)
                    .arg(policy.limit)
                    .arg(ttl)
                    .invoke_async(&mut conn)
                    .await
            }
        }
        .map_err(map_redis_error)?;

        decode_reply(&reply, policy.limit)
    }

    async fn reset(&self, key: &str) -> Result<bool, BackendError> {
        let mut conn = self.connection().await?;
        let removed: i64 = conn
            .del(self.all_keys(key))
            .await
            .map_err(map_redis_error)?;
        Ok(removed > 0)
    }

    async fn cleanup(&self, _policy: &LimitPolicy, _now_ms: u64) -> Result<usize, BackendError> {
        // Redis expires state on its own
        Ok(0)
    }

    fn needs_sweep(&self) -> bool {
        false
    }
}
