//! toolguard - caching and rate limiting for MCP tool servers
//!
//! Two independent managers share a process: a [`CacheManager`] holding tool
//! results with TTL and bounded eviction, and a [`RateLimiter`] admitting
//! calls per key against an in-memory or Redis backend. [`ToolGateway`]
//! combines both in front of a tool body; [`api::create_router`] exposes them
//! over HTTP.

pub mod api;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod hashing;
pub mod models;
pub mod observe;
pub mod rate_limit;
pub mod tasks;

pub use api::AppState;
pub use cache::{CacheManager, CacheManagerBuilder, EvictionStrategy, WrapOptions};
pub use config::{Algorithm, BackendConfig, CacheConfig, Config, RateLimitConfig, UnavailablePolicy};
pub use error::{ConfigError, RateLimitError};
pub use gateway::{CachePolicy, ToolGateway, ToolResponse};
pub use rate_limit::{AllowInfo, RateLimitKey, RateLimiter, RateLimiterBuilder};
