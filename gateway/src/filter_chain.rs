//! C8 — Filter Chain: the ordered pipeline every request passes through
//! (`spec.md` §4.7): correlation → CORS → route match → public-path bypass
//! → auth → rate limit → breaker gate → forward → response rewrite →
//! observe.
//!
//! Routes are data, not `axum::Router` entries, so the whole pipeline is
//! one `axum` fallback handler, the same shape as the teacher's
//! `ProgrammableRouter::dispatch` rather than per-route handler functions.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderValue, Request};
use axum::response::{IntoResponse, Response};
use gateway_config::SecurityHeadersConfig;
use metrics::{counter, gauge, histogram};

use crate::auth::JwtVerifier;
use crate::breaker::{BreakerRegistry, CallPermit};
use crate::clock::{mint_id, Clock};
use crate::cors::CorsPolicy;
use crate::error::GatewayError;
use crate::forwarder::{ForwardError, Forwarder, StampedIdentity};
use crate::rate_limit::{RateLimiter, RequestIdentity};
use crate::route_table::RouteTable;

#[derive(Clone)]
pub struct AppState {
    pub route_table: Arc<RouteTable>,
    pub verifier: Arc<JwtVerifier>,
    pub rate_limiter: Arc<RateLimiter>,
    pub breakers: Arc<BreakerRegistry>,
    pub forwarder: Arc<Forwarder>,
    pub cors: Arc<CorsPolicy>,
    pub security_headers: Arc<SecurityHeadersConfig>,
    pub clock: Arc<dyn Clock>,
}

/// The single entry point mounted as the router's fallback. Implements
/// every filter-chain stage from `spec.md` §4.7 in order.
pub async fn dispatch(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let start = Instant::now();
    let correlation_id = correlation_id(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| path.clone());

    // Stage: CORS preflight short-circuits before route matching.
    if state.cors.is_preflight(&method, request.headers()) {
        return state.cors.preflight_response(request.headers());
    }
    let request_headers = request.headers().clone();

    let (mut response, route_label) =
        route_and_serve(&state, &method, &path, &path_and_query, peer, request).await;

    // Stage: response rewrite — CORS echo + security headers, applied to
    // every response including error paths.
    state.cors.apply(&request_headers, response.headers_mut());
    apply_security_headers(&state.security_headers, response.headers_mut());

    // Stage: observe.
    let elapsed = start.elapsed();
    let status = response.status().as_u16();
    histogram!("gateway_request_duration_seconds", "route" => route_label.clone())
        .record(elapsed.as_secs_f64());
    counter!("gateway_requests_total", "route" => route_label, "method" => method.to_string(), "status" => status.to_string())
        .increment(1);
    tracing::info!(
        correlation_id,
        method = %method,
        path,
        status,
        elapsed_ms = elapsed.as_millis() as u64,
        "request handled"
    );

    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        response.headers_mut().insert("X-Correlation-Id", value);
    }
    response
}

async fn route_and_serve(
    state: &AppState,
    method: &axum::http::Method,
    path: &str,
    path_and_query: &str,
    peer: SocketAddr,
    request: Request<Body>,
) -> (Response, String) {
    // Stage: route match.
    let route_match = match state.route_table.match_request(method.as_str(), path) {
        Some(m) => m,
        None => return (GatewayError::RouteNotFound.into_response(), "unmatched".to_string()),
    };
    let route = route_match.route;
    let route_label = route.id.clone();

    let (parts, body) = request.into_parts();
    let headers = parts.headers.clone();
    let path_segments: Vec<&str> = path.trim_start_matches('/').split('/').filter(|s| !s.is_empty()).collect();

    // Stage: public-path bypass.
    let needs_auth = route.auth_required && !route.is_public_path(&path_segments);

    let mut identity = RequestIdentity {
        user_id: None,
        client_ip: client_ip(&headers, peer),
    };
    let mut stamped_identity = None;

    // Stage: auth.
    if needs_auth {
        let auth_header = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        match state.verifier.verify(auth_header).await {
            Ok(claims) => {
                identity.user_id = Some(claims.sub.clone());
                stamped_identity = Some(StampedIdentity {
                    user_id: Some(claims.sub),
                    username: claims.username,
                    roles: claims.roles,
                });
            }
            Err(err) => {
                let gateway_err = match err {
                    crate::auth::AuthError::Missing => GatewayError::AuthMissing,
                    other => GatewayError::AuthInvalid(other.reason().to_string()),
                };
                gateway_err.log(&mint_id());
                return (gateway_err.into_response(), route_label);
            }
        }
    }

    // Stage: rate limit. The admitted outcome is kept so its headers land on
    // whatever response this request ultimately produces, not only the 429
    // rejection path.
    let mut rate_limit_outcome = None;
    if let Some(policy_ref) = &route.rate_limit_policy_ref {
        match state.rate_limiter.check(policy_ref, &identity).await {
            Ok(outcome) if outcome.allowed => {
                rate_limit_outcome = Some(outcome);
            }
            Ok(outcome) => {
                counter!("gateway_ratelimit_rejections_total", "policy" => policy_ref.clone()).increment(1);
                let err = GatewayError::RateLimited(outcome);
                err.log(&mint_id());
                return (err.into_response(), route_label);
            }
            Err(_) => {
                // Unknown policy reference would have failed config
                // validation at boot; treat as admit rather than crash.
            }
        }
    }

    // Stage: breaker gate.
    let breaker_id = route.breaker_ref.clone();
    if let Some(breaker_id) = &breaker_id {
        if state.breakers.acquire(breaker_id) == CallPermit::Rejected {
            let err = GatewayError::BreakerOpen {
                upstream: route.upstream_base_url.clone(),
                retry_after_secs: 1,
            };
            err.log(&mint_id());
            gauge!("gateway_breaker_state", "upstream" => breaker_id.clone())
                .set(crate::breaker::BreakerState::Open.as_gauge_value());
            return (err.into_response(), route_label);
        }
    }

    // Stage: forward.
    let forward_start = Instant::now();
    let result = state
        .forwarder
        .forward(&route, method, path_and_query, headers, body, stamped_identity.as_ref())
        .await;
    let elapsed = forward_start.elapsed();

    // A passthrough HTTP >= 500 counts as a breaker failure exactly like a
    // transport error or timeout — an upstream returning 500 is not a
    // successful call.
    let breaker_success = match &result {
        Ok(forwarded) => forwarded.status.as_u16() < 500,
        Err(_) => false,
    };
    if let Ok(forwarded) = &result {
        if forwarded.status.as_u16() >= 500 {
            counter!("gateway_upstream_failures_total", "upstream" => route.upstream_base_url.clone(), "reason" => "5xx")
                .increment(1);
        }
    }

    if let Some(breaker_id) = &breaker_id {
        let was_slow = state.breakers.is_slow(breaker_id, elapsed.as_millis() as u64);
        state.breakers.record_outcome(breaker_id, breaker_success, was_slow);
        if let Some(breaker_state) = state.breakers.state_of(breaker_id) {
            gauge!("gateway_breaker_state", "upstream" => breaker_id.clone()).set(breaker_state.as_gauge_value());
        }
    }

    let mut response = match result {
        Ok(forwarded) => {
            let mut builder = Response::builder().status(forwarded.status);
            for (name, value) in forwarded.headers.iter() {
                builder = builder.header(name, value);
            }
            builder.body(forwarded.body).unwrap_or_else(|_| {
                GatewayError::UpstreamError {
                    upstream: route.upstream_base_url.clone(),
                    reason: "malformed upstream response".into(),
                    retry_after_secs: 1,
                }
                .into_response()
            })
        }
        Err(ForwardError::Timeout { upstream }) => {
            counter!("gateway_upstream_failures_total", "upstream" => upstream.clone(), "reason" => "timeout").increment(1);
            let err = GatewayError::UpstreamTimeout {
                upstream,
                retry_after_secs: 2,
            };
            err.log(&mint_id());
            err.into_response()
        }
        Err(ForwardError::Transport { upstream, reason }) => {
            counter!("gateway_upstream_failures_total", "upstream" => upstream.clone(), "reason" => "transport").increment(1);
            let err = GatewayError::UpstreamError {
                upstream,
                reason,
                retry_after_secs: 2,
            };
            err.log(&mint_id());
            err.into_response()
        }
    };

    if let Some(outcome) = &rate_limit_outcome {
        outcome.apply_headers(response.headers_mut());
    }

    (response, route_label)
}

fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get("x-correlation-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(mint_id)
}

fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| peer.ip().to_string())
}

fn apply_security_headers(config: &SecurityHeadersConfig, headers: &mut HeaderMap) {
    if let Ok(value) = HeaderValue::from_str(&config.content_security_policy) {
        headers.insert("content-security-policy", value);
    }
    if let Ok(value) = HeaderValue::from_str(&config.strict_transport_security) {
        headers.insert("strict-transport-security", value);
    }
    if let Ok(value) = HeaderValue::from_str(&config.referrer_policy) {
        headers.insert("referrer-policy", value);
    }
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert("x-xss-protection", HeaderValue::from_static("1; mode=block"));
}
