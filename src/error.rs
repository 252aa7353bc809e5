//! Error types for the governance layer
//!
//! Provides unified error handling using thiserror. Cache misses are not
//! errors (they are `None`); everything that can actually fail lives here.

use std::time::Duration;

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

// == Configuration Error ==
/// Invalid parameter combination. Raised at construction, never per request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// A single option holds an unusable value
    #[error("invalid value for {option}: {reason}")]
    InvalidValue {
        /// Option or environment variable name
        option: &'static str,
        /// What is wrong with it
        reason: String,
    },

    /// An option required by another option is missing
    #[error("{option} is required when {required_by}")]
    Missing {
        /// Missing option
        option: &'static str,
        /// The setting that requires it
        required_by: &'static str,
    },
}

impl ConfigError {
    pub(crate) fn invalid(option: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            option,
            reason: reason.into(),
        }
    }
}

// == Rate Limit Error ==
/// Outcome of a rejected admission check.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RateLimitError {
    /// The caller is over its limit. Expected and retryable.
    #[error("{message}")]
    Exceeded {
        /// Human readable message rendered from the configured template
        message: String,
        /// Time to wait before retrying
        retry_after: Duration,
        /// Limit that applied to this key
        limit: u64,
        /// Remaining allowance, always 0 on denial
        remaining: u64,
    },

    /// The backend could not answer and the policy is to deny.
    #[error("Rate limit backend unavailable: {0}")]
    BackendUnavailable(String),
}

impl RateLimitError {
    /// Get the retry-after duration if available.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Exceeded { retry_after, .. } => Some(*retry_after),
            Self::BackendUnavailable(_) => None,
        }
    }
}

// == API Error Enum ==
/// Error type for the HTTP surface.
#[derive(Error, Debug)]
pub enum ApiError {
    /// Key not found in cache
    #[error("Key not found: {0}")]
    NotFound(String),

    /// Invalid request data
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Admission denied by the rate limiter
    #[error(transparent)]
    RateLimited(#[from] RateLimitError),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

// == IntoResponse Implementation ==
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        match self {
            ApiError::NotFound(_) => {
                (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response()
            }
            ApiError::InvalidRequest(_) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
            }
            ApiError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": message })),
            )
                .into_response(),
            ApiError::RateLimited(RateLimitError::BackendUnavailable(_)) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": message })),
            )
                .into_response(),
            ApiError::RateLimited(RateLimitError::Exceeded {
                retry_after,
                limit,
                remaining,
                ..
            }) => {
                let body = Json(json!({
                    "error": message,
                    "retry_after": retry_after.as_secs_f64(),
                    "limit": limit,
                    "remaining": remaining,
                }));
                let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
                let headers = response.headers_mut();
                // Retry-After only carries whole seconds
                let retry_secs = retry_after.as_secs_f64().ceil() as u64;
                headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_secs));
                headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
                headers.insert("x-ratelimit-remaining", HeaderValue::from(remaining));
                response
            }
        }
    }
}

// == Result Type Alias ==
/// Convenience Result type for HTTP handlers.
pub type Result<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_response_has_retry_after() {
        let err = ApiError::from(RateLimitError::Exceeded {
            message: "slow down".to_string(),
            retry_after: Duration::from_millis(1_200),
            limit: 5,
            remaining: 0,
        });

        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "2");
        assert_eq!(response.headers()["x-ratelimit-limit"], "5");
    }

    #[test]
    fn test_backend_unavailable_maps_to_503() {
        let err = ApiError::from(RateLimitError::BackendUnavailable("timeout".to_string()));
        assert_eq!(err.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_not_found_maps_to_404() {
        let response = ApiError::NotFound("k".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::Missing {
            option: "window_size",
            required_by: "algorithm is sliding_window",
        };
        assert_eq!(
            err.to_string(),
            "window_size is required when algorithm is sliding_window"
        );
    }
}
