//! C6 — Upstream Forwarder: URL rewriting, header hygiene, retries and
//! streaming response relay (`spec.md` §4.5).
//!
//! Grounded on the teacher's `UpstreamClient` in `server/gateway`: one
//! `reqwest::Client` per upstream base URL (connection pooling keyed by
//! host), hop-by-hop header stripping before the request leaves the
//! process, and exponential backoff with jitter on retry.

use std::collections::HashMap;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use parking_lot::RwLock;
use rand::Rng;
use thiserror::Error;

use crate::route_table::Route;

/// Headers meaningful only for the hop between a client and its immediate
/// peer; never relayed onward (RFC 7230 §6.1 plus the `Authorization`
/// stripping controlled by `strip_authorization`).
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

const IDEMPOTENT_METHODS: &[&str] = &["GET", "HEAD", "OPTIONS", "PUT", "DELETE"];

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("request to {upstream} timed out")]
    Timeout { upstream: String },
    #[error("request to {upstream} failed: {reason}")]
    Transport { upstream: String, reason: String },
}

pub struct ForwardedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
    pub elapsed: Duration,
}

/// Identity claims to stamp onto the outbound request when a route has
/// `stamp_identity = true` (`spec.md` §4.5).
#[derive(Debug, Clone, Default)]
pub struct StampedIdentity {
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub roles: Vec<String>,
}

/// One pooled client per upstream base URL, built lazily on first use so
/// boot never blocks on DNS for an upstream nobody has called yet.
pub struct Forwarder {
    clients: RwLock<HashMap<String, reqwest::Client>>,
}

impl Default for Forwarder {
    fn default() -> Self {
        Self::new()
    }
}

impl Forwarder {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
        }
    }

    fn client_for(&self, base_url: &str) -> reqwest::Client {
        if let Some(client) = self.clients.read().get(base_url) {
            return client.clone();
        }
        let mut clients = self.clients.write();
        clients
            .entry(base_url.to_string())
            .or_insert_with(|| {
                reqwest::Client::builder()
                    .pool_idle_timeout(Duration::from_secs(90))
                    .build()
                    .expect("reqwest client builder never fails with these options")
            })
            .clone()
    }

    /// `forward(route, method, target_path, headers, body) -> Response` per
    /// `spec.md` §4.5. Applies `strip_prefix`/`rewrite_to`, strips
    /// hop-by-hop headers and (conditionally) `Authorization`, stamps
    /// identity headers, and retries idempotent methods on connect-level
    /// failures only.
    pub async fn forward(
        &self,
        route: &Route,
        method: &Method,
        path_and_query: &str,
        mut headers: HeaderMap,
        body: Body,
        identity: Option<&StampedIdentity>,
    ) -> Result<ForwardedResponse, ForwardError> {
        let upstream_path = rewrite_path(route, path_and_query);
        let url = format!(
            "{}{}",
            route.upstream_base_url.trim_end_matches('/'),
            upstream_path
        );

        strip_hop_by_hop(&mut headers);
        if route.strip_authorization {
            headers.remove(axum::http::header::AUTHORIZATION);
        }
        if route.stamp_identity {
            if let Some(identity) = identity {
                stamp_identity_headers(&mut headers, identity);
            }
        }

        let client = self.client_for(&route.upstream_base_url);
        let body_bytes = axum::body::to_bytes(body, usize::MAX)
            .await
            .map(|b| b.to_vec())
            .unwrap_or_default();

        let max_attempts = if is_idempotent(method) {
            route.max_retries + 1
        } else {
            1
        };

        let mut last_err = None;
        for attempt in 0..max_attempts {
            if attempt > 0 {
                tokio::time::sleep(backoff_with_jitter(attempt)).await;
            }
            let start = tokio::time::Instant::now();
            let request = client
                .request(method.clone(), &url)
                .headers(headers.clone())
                .timeout(Duration::from_millis(route.timeout_ms))
                .body(body_bytes.clone());

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    let response_headers = response.headers().clone();
                    let stream = response.bytes_stream();
                    let body = Body::from_stream(stream);
                    return Ok(ForwardedResponse {
                        status,
                        headers: response_headers,
                        body,
                        elapsed: start.elapsed(),
                    });
                }
                Err(err) => {
                    let retryable = err.is_connect();
                    last_err = Some(err);
                    if !retryable || attempt + 1 >= max_attempts {
                        break;
                    }
                }
            }
        }

        let err = last_err.expect("loop always runs at least once");
        if err.is_timeout() {
            Err(ForwardError::Timeout {
                upstream: route.upstream_base_url.clone(),
            })
        } else {
            Err(ForwardError::Transport {
                upstream: route.upstream_base_url.clone(),
                reason: err.to_string(),
            })
        }
    }
}

fn is_idempotent(method: &Method) -> bool {
    IDEMPOTENT_METHODS.contains(&method.as_str())
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let base_ms = 50u64.saturating_mul(1u64 << attempt.min(5));
    let jitter_ms = rand::thread_rng().gen_range(0..=base_ms / 2 + 1);
    Duration::from_millis(base_ms + jitter_ms)
}

fn rewrite_path(route: &Route, path_and_query: &str) -> String {
    let (path, query) = match path_and_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_and_query, None),
    };

    let rewritten = if let Some(rewrite_to) = &route.rewrite_to {
        rewrite_to.clone()
    } else if let Some(prefix) = &route.strip_prefix {
        path.strip_prefix(prefix.as_str()).unwrap_or(path).to_string()
    } else {
        path.to_string()
    };

    let rewritten = if rewritten.starts_with('/') {
        rewritten
    } else {
        format!("/{rewritten}")
    };

    match query {
        Some(q) if !q.is_empty() => format!("{rewritten}?{q}"),
        _ => rewritten,
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

fn stamp_identity_headers(headers: &mut HeaderMap, identity: &StampedIdentity) {
    if let Some(user_id) = &identity.user_id {
        insert_header(headers, HeaderName::from_static("x-gateway-user-id"), user_id);
    }
    if let Some(username) = &identity.username {
        insert_header(headers, HeaderName::from_static("x-gateway-username"), username);
    }
    if !identity.roles.is_empty() {
        insert_header(
            headers,
            HeaderName::from_static("x-gateway-roles"),
            &identity.roles.join(","),
        );
    }
}

fn insert_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_config::RouteConfig;

    fn route(strip_prefix: Option<&str>, rewrite_to: Option<&str>) -> Route {
        let config = RouteConfig {
            id: "r".into(),
            path_patterns: vec!["/api/**".into()],
            methods: vec![],
            upstream_base_url: "http://upstream.internal".into(),
            strip_prefix: strip_prefix.map(|s| s.to_string()),
            rewrite_to: rewrite_to.map(|s| s.to_string()),
            auth_required: false,
            public_paths: vec![],
            rate_limit_policy_ref: None,
            breaker_ref: None,
            stamp_identity: false,
            strip_authorization: false,
            timeout_ms: 5000,
            max_retries: 1,
        };
        crate::route_table::RouteTable::new(vec![config])
            .unwrap()
            .match_request("GET", "/api/users/1")
            .unwrap()
            .route
            .as_ref()
            .clone()
    }

    #[test]
    fn strip_prefix_removes_leading_segment() {
        let route = route(Some("/api"), None);
        assert_eq!(rewrite_path(&route, "/api/users/1"), "/users/1");
    }

    #[test]
    fn rewrite_to_takes_precedence_over_strip_prefix() {
        let route = route(Some("/api"), Some("/internal/users"));
        assert_eq!(rewrite_path(&route, "/api/users/1"), "/internal/users");
    }

    #[test]
    fn query_string_is_preserved_through_rewrite() {
        let route = route(Some("/api"), None);
        assert_eq!(
            rewrite_path(&route, "/api/users?active=true"),
            "/users?active=true"
        );
    }

    #[test]
    fn hop_by_hop_headers_are_removed() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("x-request-id", HeaderValue::from_static("abc"));
        strip_hop_by_hop(&mut headers);
        assert!(!headers.contains_key("connection"));
        assert!(headers.contains_key("x-request-id"));
    }

    #[test]
    fn idempotent_methods_are_recognized() {
        assert!(is_idempotent(&Method::GET));
        assert!(is_idempotent(&Method::PUT));
        assert!(!is_idempotent(&Method::POST));
    }
}
