//! C7 — Fallback Responder: the canonical "upstream unavailable" envelope
//! returned for breaker-open, timeout, and upstream-error outcomes
//! (`spec.md` §4.6).
//!
//! Split out from [`crate::error`] so the envelope shape has one definition
//! shared by the breaker-open, timeout, and upstream-error paths, mirroring
//! the teacher's dedicated `FallbackResponse` builder in `server/gateway`
//! rather than inlining `json!` calls at each call site.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::json;

/// Build the standard fallback body: `{error, service, message, timestamp,
/// status, fallback: true, retryAfter}`.
pub fn envelope(service: &str, message: &str, status: u16, retry_after_secs: u64) -> serde_json::Value {
    json!({
        "error": "Service Unavailable",
        "service": service,
        "message": message,
        "timestamp": Utc::now().to_rfc3339(),
        "status": status,
        "fallback": true,
        "retryAfter": retry_after_secs.to_string(),
    })
}

/// Render a fallback response with the `Retry-After` header set alongside
/// the JSON envelope's own `retryAfter` field, so both HTTP-level and
/// body-level clients can react to it.
pub fn response(status: StatusCode, service: &str, message: &str, retry_after_secs: u64) -> Response {
    let mut response = (
        status,
        Json(envelope(service, message, status.as_u16(), retry_after_secs)),
    )
        .into_response();
    apply_retry_after(&mut response, retry_after_secs);
    response
}

pub fn apply_retry_after(response: &mut Response, retry_after_secs: u64) {
    if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
        response.headers_mut().insert("Retry-After", value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_retry_after_as_string() {
        let body = envelope("chat-service", "unavailable", 503, 7);
        assert_eq!(body["retryAfter"], "7");
        assert_eq!(body["fallback"], true);
    }

    #[test]
    fn response_sets_retry_after_header() {
        let resp = response(StatusCode::SERVICE_UNAVAILABLE, "chat-service", "down", 3);
        assert_eq!(
            resp.headers().get("Retry-After").unwrap(),
            &HeaderValue::from_static("3")
        );
    }
}
