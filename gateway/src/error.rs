//! Error taxonomy (`spec.md` §7) and its conversion to HTTP responses at the
//! filter-chain edge. No panic is allowed to escape a worker; every variant
//! here is the terminal representation of a gated rejection or upstream
//! failure.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::json;
use thiserror::Error;

use crate::fallback;
use crate::rate_limit::RateLimitOutcome;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no route matches this request")]
    RouteNotFound,

    #[error("missing authentication token")]
    AuthMissing,

    #[error("invalid authentication token: {0}")]
    AuthInvalid(String),

    #[error("rate limit exceeded")]
    RateLimited(RateLimitOutcome),

    #[error("breaker open for upstream {upstream}")]
    BreakerOpen { upstream: String, retry_after_secs: u64 },

    #[error("upstream {upstream} timed out")]
    UpstreamTimeout { upstream: String, retry_after_secs: u64 },

    #[error("upstream {upstream} unreachable: {reason}")]
    UpstreamError {
        upstream: String,
        reason: String,
        retry_after_secs: u64,
    },
}

impl GatewayError {
    /// `warn` for client-caused rejections, `error` for server/upstream
    /// faults, per the propagation policy in `spec.md` §7.
    pub fn log(&self, correlation_id: &str) {
        match self {
            GatewayError::RouteNotFound
            | GatewayError::AuthMissing
            | GatewayError::AuthInvalid(_)
            | GatewayError::RateLimited(_) => {
                tracing::warn!(correlation_id, error = %self, "request rejected");
            }
            GatewayError::BreakerOpen { .. }
            | GatewayError::UpstreamTimeout { .. }
            | GatewayError::UpstreamError { .. } => {
                tracing::error!(correlation_id, error = %self, "upstream failure");
            }
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        match self {
            GatewayError::RouteNotFound => (
                StatusCode::NOT_FOUND,
                Json(json!({
                    "error": "Not Found",
                    "message": "no route matches this request",
                    "timestamp": Utc::now().to_rfc3339(),
                    "status": 404,
                })),
            )
                .into_response(),
            GatewayError::AuthMissing => (
                StatusCode::UNAUTHORIZED,
                Json(json!({
                    "error": "Unauthorized",
                    "reason": "missing_token",
                    "timestamp": Utc::now().to_rfc3339(),
                    "status": 401,
                })),
            )
                .into_response(),
            GatewayError::AuthInvalid(reason) => (
                StatusCode::UNAUTHORIZED,
                Json(json!({
                    "error": "Unauthorized",
                    "reason": reason,
                    "timestamp": Utc::now().to_rfc3339(),
                    "status": 401,
                })),
            )
                .into_response(),
            GatewayError::RateLimited(outcome) => {
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(json!({
                        "error": "Too Many Requests",
                        "message": "rate limit exceeded",
                        "timestamp": Utc::now().to_rfc3339(),
                        "status": 429,
                        "fallback": true,
                        "retryAfter": outcome.retry_after_ms.div_ceil(1000).to_string(),
                    })),
                )
                    .into_response();
                outcome.apply_headers(response.headers_mut());
                fallback::apply_retry_after(&mut response, outcome.retry_after_ms.div_ceil(1000));
                response
            }
            GatewayError::BreakerOpen {
                upstream,
                retry_after_secs,
            } => fallback::response(
                StatusCode::SERVICE_UNAVAILABLE,
                &upstream,
                "the upstream service is temporarily unavailable",
                retry_after_secs,
            ),
            GatewayError::UpstreamTimeout {
                upstream,
                retry_after_secs,
            } => fallback::response(
                StatusCode::GATEWAY_TIMEOUT,
                &upstream,
                "the upstream service did not respond in time",
                retry_after_secs,
            ),
            GatewayError::UpstreamError {
                upstream,
                reason,
                retry_after_secs,
            } => fallback::response(StatusCode::BAD_GATEWAY, &upstream, &reason, retry_after_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_open_emits_503_with_retry_after() {
        let err = GatewayError::BreakerOpen {
            upstream: "chat-service".into(),
            retry_after_secs: 5,
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get("Retry-After").unwrap(),
            &HeaderValue::from_static("5")
        );
    }

    #[test]
    fn auth_missing_emits_401() {
        let response = GatewayError::AuthMissing.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
