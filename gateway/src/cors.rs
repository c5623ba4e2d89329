//! Cross-origin handling: preflight short-circuit and response header
//! application (`spec.md` §4.7, filter chain step 2).
//!
//! Grounded on `tower_http::cors::CorsLayer`'s configuration model (origin
//! list, method list, header list, credentials, max-age) but applied by
//! hand inside the filter chain rather than layered as `tower` middleware,
//! since preflight here has to short-circuit before route matching runs.

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::Response;
use gateway_config::CorsConfig;

pub struct CorsPolicy {
    config: CorsConfig,
}

impl CorsPolicy {
    pub fn new(config: CorsConfig) -> Self {
        Self { config }
    }

    fn origin_allowed(&self, origin: &str) -> bool {
        self.config.allow_origins.iter().any(|o| o == "*" || o == origin)
    }

    /// `true` when this request is a CORS preflight (`OPTIONS` with an
    /// `Access-Control-Request-Method` header) that should be answered
    /// directly instead of reaching route matching.
    pub fn is_preflight(&self, method: &Method, headers: &HeaderMap) -> bool {
        method == Method::OPTIONS && headers.contains_key("access-control-request-method")
    }

    /// Build the `204 No Content` preflight reply.
    pub fn preflight_response(&self, headers: &HeaderMap) -> Response {
        let mut response = Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(axum::body::Body::empty())
            .expect("static preflight response always builds");
        self.apply(headers, response.headers_mut());
        response
    }

    /// Apply `Access-Control-*` response headers for both preflight and
    /// actual responses, given the request's `Origin` header.
    pub fn apply(&self, request_headers: &HeaderMap, response_headers: &mut HeaderMap) {
        let origin = match request_headers
            .get("origin")
            .and_then(|v| v.to_str().ok())
        {
            Some(origin) if self.origin_allowed(origin) => origin.to_string(),
            _ => return,
        };

        if let Ok(value) = HeaderValue::from_str(&origin) {
            response_headers.insert("access-control-allow-origin", value);
        }
        if self.config.allow_credentials {
            response_headers.insert(
                "access-control-allow-credentials",
                HeaderValue::from_static("true"),
            );
        }
        if !self.config.allow_methods.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&self.config.allow_methods.join(", ")) {
                response_headers.insert("access-control-allow-methods", value);
            }
        }
        if !self.config.allow_headers.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&self.config.allow_headers.join(", ")) {
                response_headers.insert("access-control-allow-headers", value);
            }
        }
        if !self.config.expose_headers.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&self.config.expose_headers.join(", ")) {
                response_headers.insert("access-control-expose-headers", value);
            }
        }
        response_headers.insert(
            "access-control-max-age",
            HeaderValue::from_str(&self.config.max_age_secs.to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("3600")),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(origins: &[&str]) -> CorsConfig {
        CorsConfig {
            allow_origins: origins.iter().map(|s| s.to_string()).collect(),
            allow_methods: vec!["GET".into(), "POST".into()],
            allow_headers: vec!["content-type".into()],
            expose_headers: vec![],
            allow_credentials: true,
            max_age_secs: 600,
        }
    }

    fn header_map(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (k, v) in pairs {
            headers.insert(
                HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        headers
    }

    #[test]
    fn detects_preflight_requests() {
        let policy = CorsPolicy::new(config(&["https://app.example.com"]));
        let headers = header_map(&[("access-control-request-method", "POST")]);
        assert!(policy.is_preflight(&Method::OPTIONS, &headers));
        assert!(!policy.is_preflight(&Method::GET, &headers));
    }

    #[test]
    fn allowed_origin_gets_echoed_back() {
        let policy = CorsPolicy::new(config(&["https://app.example.com"]));
        let request_headers = header_map(&[("origin", "https://app.example.com")]);
        let mut response_headers = HeaderMap::new();
        policy.apply(&request_headers, &mut response_headers);
        assert_eq!(
            response_headers.get("access-control-allow-origin").unwrap(),
            "https://app.example.com"
        );
        assert_eq!(
            response_headers.get("access-control-allow-credentials").unwrap(),
            "true"
        );
    }

    #[test]
    fn disallowed_origin_gets_no_headers() {
        let policy = CorsPolicy::new(config(&["https://app.example.com"]));
        let request_headers = header_map(&[("origin", "https://evil.example.com")]);
        let mut response_headers = HeaderMap::new();
        policy.apply(&request_headers, &mut response_headers);
        assert!(response_headers.get("access-control-allow-origin").is_none());
    }

    #[test]
    fn wildcard_origin_allows_any() {
        let policy = CorsPolicy::new(config(&["*"]));
        let request_headers = header_map(&[("origin", "https://anywhere.example.com")]);
        let mut response_headers = HeaderMap::new();
        policy.apply(&request_headers, &mut response_headers);
        assert_eq!(
            response_headers.get("access-control-allow-origin").unwrap(),
            "https://anywhere.example.com"
        );
    }
}
