//! API Handlers
//!
//! HTTP request handlers for the cache and rate limiter endpoints.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::Value;
use tracing::info;

use crate::cache::{CacheManager, CacheManagerBuilder, MemoryStats};
use crate::config::Config;
use crate::error::{ApiError, ConfigError, Result};
use crate::models::{
    ClearRequest, ClearResponse, DeleteResponse, GetResponse, HealthResponse, InvalidateRequest,
    InvalidateResponse, ResetKeyResponse, SetRequest, SetResponse, StatsResponse,
};
use crate::observe::{SharedMetrics, TracingMetrics};
use crate::rate_limit::{RateLimitStats, RateLimiter, RateLimiterBuilder};

/// Application state shared across all handlers.
///
/// Both managers synchronize internally, so the state is just two `Arc`s.
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<CacheManager<Value>>,
    pub limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(cache: CacheManager<Value>, limiter: RateLimiter) -> Self {
        Self {
            cache: Arc::new(cache),
            limiter: Arc::new(limiter),
        }
    }

    /// Builds both managers from configuration, reporting metrics as trace
    /// events. Background tasks are not started here.
    pub fn from_config(config: &Config) -> std::result::Result<Self, ConfigError> {
        let metrics: SharedMetrics = Arc::new(TracingMetrics);
        let cache = CacheManagerBuilder::new(config.cache.clone())
            .metrics(metrics.clone())
            .build()?;
        let limiter = RateLimiterBuilder::new(config.rate_limit.clone())
            .metrics(metrics)
            .build()?;
        Ok(Self::new(cache, limiter))
    }
}

/// Handler for PUT /cache/set
///
/// Stores a JSON value in the cache with optional TTL.
pub async fn set_handler(
    State(state): State<AppState>,
    Json(req): Json<SetRequest>,
) -> Result<Json<SetResponse>> {
    if let Some(error_msg) = req.validate() {
        return Err(ApiError::InvalidRequest(error_msg));
    }

    let ttl = req.ttl.map(Duration::from_secs);
    if !state.cache.set(req.key.clone(), req.value, ttl) {
        return Err(ApiError::InvalidRequest(format!(
            "Key '{}' could not be cached",
            req.key
        )));
    }

    Ok(Json(SetResponse::new(req.key)))
}

/// Handler for GET /cache/get/:key
pub async fn get_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<GetResponse>> {
    match state.cache.get(&key) {
        Some(value) => Ok(Json(GetResponse::new(key, value))),
        None => Err(ApiError::NotFound(key)),
    }
}

/// Handler for DELETE /cache/del/:key
pub async fn delete_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<DeleteResponse>> {
    if !state.cache.delete(&key) {
        return Err(ApiError::NotFound(key));
    }
    Ok(Json(DeleteResponse::new(key)))
}

/// Handler for POST /cache/clear
pub async fn clear_handler(
    State(state): State<AppState>,
    Json(req): Json<ClearRequest>,
) -> Json<ClearResponse> {
    let removed = state.cache.clear(req.pattern.as_deref());
    Json(ClearResponse {
        removed,
        pattern: req.pattern,
    })
}

/// Handler for POST /cache/invalidate
pub async fn invalidate_handler(
    State(state): State<AppState>,
    Json(req): Json<InvalidateRequest>,
) -> Json<InvalidateResponse> {
    let invalidated = state.cache.invalidate(&req.keys);
    Json(InvalidateResponse {
        requested: req.keys.len(),
        invalidated,
    })
}

/// Handler for GET /cache/stats
pub async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse::from(state.cache.get_stats()))
}

/// Handler for GET /cache/memory
pub async fn memory_handler(State(state): State<AppState>) -> Json<MemoryStats> {
    Json(state.cache.get_memory_stats())
}

/// Handler for GET /ratelimit/stats
pub async fn rate_limit_stats_handler(State(state): State<AppState>) -> Json<RateLimitStats> {
    Json(state.limiter.get_stats())
}

/// Handler for DELETE /ratelimit/keys/:key
///
/// Administrative override clearing one resolved key's allowance.
pub async fn reset_key_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Json<ResetKeyResponse> {
    let reset = state.limiter.reset_key(&key).await;
    info!(key = %key, reset, "rate limit key reset requested");
    Json(ResetKeyResponse { key, reset })
}

/// Handler for GET /health
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse::healthy())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::HeuristicMonitor;
    use crate::config::{CacheConfig, RateLimitConfig};
    use serde_json::json;

    fn state() -> AppState {
        let cache = CacheManagerBuilder::new(CacheConfig {
            max_size: 100,
            enable_background_cleanup: false,
            ..CacheConfig::default()
        })
        .memory_monitor(Arc::new(HeuristicMonitor))
        .build()
        .unwrap();
        AppState::new(cache, RateLimiter::new(RateLimitConfig::default()).unwrap())
    }

    fn set_request(key: &str, value: Value) -> SetRequest {
        SetRequest {
            key: key.to_string(),
            value,
            ttl: None,
        }
    }

    #[tokio::test]
    async fn test_set_and_get_handler() {
        let state = state();

        let result = set_handler(
            State(state.clone()),
            Json(set_request("test_key", json!({"v": 1}))),
        )
        .await;
        assert!(result.is_ok());

        let response = get_handler(State(state), Path("test_key".to_string()))
            .await
            .unwrap();
        assert_eq!(response.value, json!({"v": 1}));
    }

    #[tokio::test]
    async fn test_get_nonexistent_key() {
        let result = get_handler(State(state()), Path("nonexistent".to_string())).await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_handler() {
        let state = state();
        set_handler(State(state.clone()), Json(set_request("to_delete", json!(1))))
            .await
            .unwrap();

        assert!(delete_handler(State(state.clone()), Path("to_delete".to_string()))
            .await
            .is_ok());
        assert!(delete_handler(State(state), Path("to_delete".to_string()))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_clear_and_invalidate_handlers() {
        let state = state();
        for key in ["quote:AAPL", "quote:MSFT", "news:rates"] {
            state.cache.set(key, json!(true), None);
        }

        let cleared = clear_handler(
            State(state.clone()),
            Json(ClearRequest {
                pattern: Some("quote:".to_string()),
            }),
        )
        .await;
        assert_eq!(cleared.removed, 2);

        let invalidated = invalidate_handler(
            State(state),
            Json(InvalidateRequest {
                keys: vec!["news:rates".to_string(), "missing".to_string()],
            }),
        )
        .await;
        assert_eq!(invalidated.requested, 2);
        assert_eq!(invalidated.invalidated, 1);
    }

    #[tokio::test]
    async fn test_stats_handlers() {
        let state = state();
        let response = stats_handler(State(state.clone())).await;
        assert_eq!(response.stats.hits, 0);
        assert_eq!(response.stats.max_size, 100);

        let limits = rate_limit_stats_handler(State(state)).await;
        assert_eq!(limits.backend, "memory");
    }

    #[tokio::test]
    async fn test_reset_key_handler() {
        let state = state();
        let response = reset_key_handler(State(state), Path("default".to_string())).await;
        assert!(!response.reset);
    }

    #[test]
    fn test_state_from_default_config() {
        let state = AppState::from_config(&Config::default()).unwrap();
        assert_eq!(state.cache.config().max_size, 1000);
        assert_eq!(state.limiter.get_stats().limit, 20);
    }

    #[tokio::test]
    async fn test_health_handler() {
        let response = health_handler().await;
        assert_eq!(response.status, "healthy");
    }

    #[tokio::test]
    async fn test_set_invalid_request() {
        let result = set_handler(State(state()), Json(set_request("", json!("value")))).await;
        assert!(matches!(result, Err(ApiError::InvalidRequest(_))));
    }
}
