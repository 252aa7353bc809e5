//! Tool Gateway
//!
//! Glue a tool server puts in front of every tool body: admission through the
//! [`RateLimiter`], then optional memoization of read-only calls in the shared
//! [`CacheManager`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::cache::{CacheManager, WrapOptions};
use crate::error::RateLimitError;
use crate::rate_limit::{AllowInfo, RateLimitKey, RateLimiter};

/// Field injected into object results.
pub const RATE_LIMIT_FIELD: &str = "_rate_limit";

/// Whether a tool's result may be served from cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CachePolicy {
    /// Always run the tool
    #[default]
    Bypass,
    /// Memoize by `(tool, args)`; None uses the cache's default TTL
    Memoize { ttl: Option<Duration> },
}

/// Failure of a gated tool call.
#[derive(Debug, Error)]
pub enum ToolError<E> {
    #[error(transparent)]
    RateLimited(#[from] RateLimitError),

    #[error("tool failed: {0}")]
    Tool(E),
}

/// Result of a gated tool call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResponse {
    pub result: Value,
    pub rate_limit: AllowInfo,
    /// Whether [`into_annotated`](Self::into_annotated) injects the allowance
    #[serde(skip)]
    pub annotate: bool,
}

impl ToolResponse {
    /// Result with the allowance merged in under `_rate_limit` when
    /// `annotate` is set and the result is a JSON object. Other results are
    /// returned unchanged.
    pub fn into_annotated(self) -> Value {
        match self.result {
            Value::Object(mut map) if self.annotate => {
                let info = serde_json::to_value(self.rate_limit).unwrap_or(Value::Null);
                map.insert(RATE_LIMIT_FIELD.to_string(), info);
                Value::Object(map)
            }
            other => other,
        }
    }
}

/// Admission plus memoization for tool calls.
#[derive(Clone)]
pub struct ToolGateway {
    limiter: Arc<RateLimiter>,
    cache: Arc<CacheManager<Value>>,
}

impl ToolGateway {
    pub fn new(limiter: Arc<RateLimiter>, cache: Arc<CacheManager<Value>>) -> Self {
        Self { limiter, cache }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn cache(&self) -> &Arc<CacheManager<Value>> {
        &self.cache
    }

    /// Runs `tool` for `caller`.
    ///
    /// The limiter is consulted per `(caller, tool)`; a denial is returned
    /// before the tool runs. With [`CachePolicy::Memoize`] a previous result
    /// for the same arguments is returned instead of running the tool again.
    pub async fn invoke<F, Fut, E>(
        &self,
        caller: &str,
        tool: &str,
        args: Value,
        cache_policy: CachePolicy,
        operation: F,
    ) -> Result<ToolResponse, ToolError<E>>
    where
        F: Fn(Value) -> Fut,
        Fut: Future<Output = Result<Value, E>>,
    {
        let key = RateLimitKey::for_method(tool, Some(caller));
        let rate_limit = self.limiter.check(&key).await?;

        let result = match cache_policy {
            CachePolicy::Bypass => operation(args).await.map_err(ToolError::Tool)?,
            CachePolicy::Memoize { ttl } => {
                let options = match ttl {
                    Some(ttl) => WrapOptions::new().ttl(ttl),
                    None => WrapOptions::new(),
                };
                let memoized = self.cache.wrap(tool, operation, options);
                memoized.call(args).await.map_err(ToolError::Tool)?
            }
        };

        debug!(caller, tool, remaining = rate_limit.remaining, "tool call completed");
        Ok(ToolResponse {
            result,
            rate_limit,
            annotate: self.limiter.config().include_headers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, RateLimitConfig};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn gateway(limit: RateLimitConfig) -> ToolGateway {
        let cache = CacheManager::new(CacheConfig {
            enable_background_cleanup: false,
            ..CacheConfig::default()
        })
        .unwrap();
        ToolGateway::new(
            Arc::new(RateLimiter::new(limit).unwrap()),
            Arc::new(cache),
        )
    }

    #[tokio::test]
    async fn test_memoized_tool_runs_once() {
        let gateway = gateway(RateLimitConfig::token_bucket(100.0, 100));
        let calls = AtomicUsize::new(0);
        let fetch = |args: Value| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, String>(json!({ "symbol": args["symbol"], "pe": 28.1 })) }
        };
        let policy = CachePolicy::Memoize {
            ttl: Some(Duration::from_secs(60)),
        };

        let first = gateway
            .invoke("agent-1", "get_ratios", json!({"symbol": "AAPL"}), policy, fetch)
            .await
            .unwrap();
        let second = gateway
            .invoke("agent-1", "get_ratios", json!({"symbol": "AAPL"}), policy, fetch)
            .await
            .unwrap();

        assert_eq!(first.result, second.result);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(gateway.cache().len(), 1);
    }

    #[tokio::test]
    async fn test_denied_call_does_not_run_tool() {
        let gateway = gateway(RateLimitConfig::token_bucket(1.0, 1));
        let calls = AtomicUsize::new(0);
        let tool = |_: Value| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, String>(json!("ok")) }
        };

        gateway
            .invoke("agent-1", "news", Value::Null, CachePolicy::Bypass, tool)
            .await
            .unwrap();
        let denied = gateway
            .invoke("agent-1", "news", Value::Null, CachePolicy::Bypass, tool)
            .await;
        assert!(matches!(denied, Err(ToolError::RateLimited(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Separate allowance per caller
        assert!(gateway
            .invoke("agent-2", "news", Value::Null, CachePolicy::Bypass, tool)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_tool_errors_pass_through() {
        let gateway = gateway(RateLimitConfig::default());
        let result = gateway
            .invoke(
                "agent-1",
                "macro",
                json!({}),
                CachePolicy::Memoize { ttl: None },
                |_| async { Err::<Value, _>("upstream 502") },
            )
            .await;

        assert!(matches!(result, Err(ToolError::Tool("upstream 502"))));
        assert!(gateway.cache().is_empty());
    }

    #[test]
    fn test_annotated_result() {
        let response = ToolResponse {
            result: json!({ "price": 10 }),
            rate_limit: AllowInfo {
                limit: 5,
                remaining: 4,
                reset: 1.0,
                retry_after: 0.0,
            },
            annotate: true,
        };
        let annotated = response.clone().into_annotated();
        assert_eq!(annotated[RATE_LIMIT_FIELD]["remaining"], 4);

        let scalar = ToolResponse {
            result: json!(3),
            ..response
        };
        assert_eq!(scalar.into_annotated(), json!(3));
    }

    #[tokio::test]
    async fn test_annotation_follows_include_headers() {
        let tool = |_: Value| async { Ok::<_, String>(json!({ "price": 10 })) };

        let quiet = gateway(RateLimitConfig {
            include_headers: false,
            ..RateLimitConfig::default()
        });
        let response = quiet
            .invoke("agent-1", "quote", json!({}), CachePolicy::Bypass, tool)
            .await
            .unwrap();
        assert_eq!(response.rate_limit.remaining, response.rate_limit.limit - 1);
        assert_eq!(response.into_annotated(), json!({ "price": 10 }));

        let loud = gateway(RateLimitConfig::default());
        let annotated = loud
            .invoke("agent-1", "quote", json!({}), CachePolicy::Bypass, tool)
            .await
            .unwrap()
            .into_annotated();
        assert_eq!(annotated["price"], 10);
        assert!(annotated.get(RATE_LIMIT_FIELD).is_some());
    }
}
