//! Axum middleware enforcing a [`RateLimiter`] in front of handlers.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::{AllowInfo, RateLimitKey, RateLimiter};
use crate::error::ApiError;

/// Header carrying the caller's user id, when authenticated upstream.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Rate limit middleware
///
/// Derives a key from the client address and user id, checks it and either
/// rejects with 429 (503 if the backend is down under a deny policy) or runs
/// the handler and annotates the response with the allowance.
///
/// ```ignore
/// Router::new()
///     .route("/tools/:name", post(call_tool))
///     .layer(middleware::from_fn_with_state(limiter.clone(), rate_limit_middleware));
/// ```
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let key = request_key(&request);

    match limiter.check(&key).await {
        Ok(info) => {
            let mut response = next.run(request).await;
            if limiter.config().include_headers {
                apply_headers(response.headers_mut(), &info);
            }
            response
        }
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// Builds the limiter key for an HTTP request.
pub fn request_key(request: &Request) -> RateLimitKey {
    let mut key = RateLimitKey::new();
    if let Some(ip) = client_ip(request) {
        key = key.address(ip.to_string());
    }
    if let Some(user) = request
        .headers()
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|user| !user.is_empty())
    {
        key = key.user(user);
    }
    key
}

/// Client address, preferring the first `X-Forwarded-For` hop.
fn client_ip(request: &Request) -> Option<IpAddr> {
    let forwarded = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|first| first.trim().parse::<IpAddr>().ok());

    forwarded.or_else(|| {
        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.ip())
    })
}

/// Writes `x-ratelimit-*` headers for an admitted request.
pub fn apply_headers(headers: &mut HeaderMap, info: &AllowInfo) {
    headers.insert("x-ratelimit-limit", HeaderValue::from(info.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(info.remaining));
    headers.insert("x-ratelimit-reset", HeaderValue::from(info.reset.ceil() as u64));
}
