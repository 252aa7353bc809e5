//! API Module
//!
//! HTTP handlers and routing for the administrative REST API.
//!
//! # Endpoints
//! - `/cache/*` - Read, write and invalidate cached values, inspect statistics
//! - `/ratelimit/*` - Limiter statistics and per-key reset
//! - `GET /health` - Health check endpoint

pub mod handlers;
pub mod routes;

pub use handlers::*;
pub use routes::create_router;
