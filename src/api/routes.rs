//! API Routes
//!
//! Configures the Axum router with the cache and rate limiter endpoints.

use axum::{
    middleware,
    routing::{delete, get, post, put},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers::{
    clear_handler, delete_handler, get_handler, health_handler, invalidate_handler,
    memory_handler, rate_limit_stats_handler, reset_key_handler, set_handler, stats_handler,
    AppState,
};
use crate::rate_limit::rate_limit_middleware;

/// Creates the main router with all endpoints configured.
///
/// # Endpoints
/// - `PUT /cache/set` - Store a JSON value
/// - `GET /cache/get/:key` - Retrieve a value by key
/// - `DELETE /cache/del/:key` - Delete a key
/// - `POST /cache/clear` - Remove all keys or keys containing a pattern
/// - `POST /cache/invalidate` - Remove a list of keys
/// - `GET /cache/stats` - Cache statistics
/// - `GET /cache/memory` - Memory pressure statistics
/// - `GET /ratelimit/stats` - Rate limiter statistics
/// - `DELETE /ratelimit/keys/:key` - Reset one resolved key
/// - `GET /health` - Health check, never rate limited
///
/// # Middleware
/// - Rate limiting on every route except `/health`
/// - CORS: Allows any origin
/// - Tracing: Logs all requests
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let limiter = middleware::from_fn_with_state(state.limiter.clone(), rate_limit_middleware);

    Router::new()
        .route("/cache/set", put(set_handler))
        .route("/cache/get/:key", get(get_handler))
        .route("/cache/del/:key", delete(delete_handler))
        .route("/cache/clear", post(clear_handler))
        .route("/cache/invalidate", post(invalidate_handler))
        .route("/cache/stats", get(stats_handler))
        .route("/cache/memory", get(memory_handler))
        .route("/ratelimit/stats", get(rate_limit_stats_handler))
        .route("/ratelimit/keys/:key", delete(reset_key_handler))
        .route_layer(limiter)
        // Added after route_layer so probes are never throttled
        .route("/health", get(health_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
