//! C3 — Route Table: path-pattern matching and per-route policy lookup.
//!
//! `spec.md` §4.1. Routes are compiled once at boot (pattern strings split
//! into segments) so request-time matching never re-parses a pattern, the
//! same "compile once, match many" shape as the teacher's
//! `ProgrammableRouter` service tables (`router.rs`).

use std::collections::HashSet;
use std::sync::Arc;

use gateway_config::RouteConfig;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouteTableError {
    #[error("route {0} declares an empty path pattern")]
    EmptyPattern(String),
}

/// Immutable route record, compiled from `gateway_config::RouteConfig`.
#[derive(Debug, Clone)]
pub struct Route {
    pub id: String,
    pub methods: HashSet<String>,
    pub upstream_base_url: String,
    pub strip_prefix: Option<String>,
    pub rewrite_to: Option<String>,
    pub auth_required: bool,
    pub public_path_patterns: Vec<Vec<Segment>>,
    pub rate_limit_policy_ref: Option<String>,
    pub breaker_ref: Option<String>,
    pub stamp_identity: bool,
    pub strip_authorization: bool,
    pub timeout_ms: u64,
    pub max_retries: u32,
    patterns: Vec<Vec<Segment>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Single,
    /// `**` — matches one or more trailing segments.
    Suffix,
}

fn compile_pattern(pattern: &str) -> Vec<Segment> {
    pattern
        .trim_start_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|segment| match segment {
            "*" => Segment::Single,
            "**" => Segment::Suffix,
            literal => Segment::Literal(literal.to_string()),
        })
        .collect()
}

fn segments_match(pattern: &[Segment], path: &[&str]) -> bool {
    match pattern.first() {
        None => path.is_empty(),
        Some(Segment::Suffix) => !path.is_empty(),
        Some(Segment::Single) => {
            !path.is_empty() && segments_match(&pattern[1..], &path[1..])
        }
        Some(Segment::Literal(literal)) => {
            !path.is_empty() && path[0] == literal && segments_match(&pattern[1..], &path[1..])
        }
    }
}

impl Route {
    fn matches_method(&self, method: &str) -> bool {
        self.methods.is_empty() || self.methods.contains(&method.to_ascii_uppercase())
    }

    fn find_matching_pattern(&self, path_segments: &[&str]) -> Option<&[Segment]> {
        self.patterns
            .iter()
            .find(|pattern| segments_match(pattern, path_segments))
            .map(|p| p.as_slice())
    }

    pub fn is_public_path(&self, path_segments: &[&str]) -> bool {
        self.public_path_patterns
            .iter()
            .any(|pattern| segments_match(pattern, path_segments))
    }
}

pub struct RouteMatch {
    pub route: Arc<Route>,
}

/// Compiled, load-ordered list of routes. Immutable after construction —
/// read without synchronisation, per `spec.md` §5.
pub struct RouteTable {
    routes: Vec<Arc<Route>>,
}

impl RouteTable {
    pub fn new(configs: Vec<RouteConfig>) -> Result<Self, RouteTableError> {
        let mut routes = Vec::with_capacity(configs.len());
        for config in configs {
            let patterns: Vec<Vec<Segment>> = config
                .path_patterns
                .iter()
                .map(|p| compile_pattern(p))
                .collect();
            if patterns.is_empty() {
                return Err(RouteTableError::EmptyPattern(config.id.clone()));
            }
            let public_path_patterns = config
                .public_paths
                .iter()
                .map(|p| compile_pattern(p))
                .collect();
            routes.push(Arc::new(Route {
                id: config.id,
                methods: config.methods.into_iter().map(|m| m.to_ascii_uppercase()).collect(),
                upstream_base_url: config.upstream_base_url,
                strip_prefix: config.strip_prefix,
                rewrite_to: config.rewrite_to,
                auth_required: config.auth_required,
                public_path_patterns,
                rate_limit_policy_ref: config.rate_limit_policy_ref,
                breaker_ref: config.breaker_ref,
                stamp_identity: config.stamp_identity,
                strip_authorization: config.strip_authorization,
                timeout_ms: config.timeout_ms,
                max_retries: config.max_retries,
                patterns,
            }));
        }
        Ok(Self { routes })
    }

    /// `match(method, path) -> (Route, matched_prefix) | NotFound` per
    /// `spec.md` §4.1. Walks routes in load order; within a route, walks
    /// patterns in declaration order. First match wins.
    pub fn match_request(&self, method: &str, path: &str) -> Option<RouteMatch> {
        let normalized = normalize_path(path);
        let decoded_segments = decode_segments(&normalized);
        let borrowed: Vec<&str> = decoded_segments.iter().map(|s| s.as_str()).collect();

        for route in &self.routes {
            if !route.matches_method(method) {
                continue;
            }
            if route.find_matching_pattern(&borrowed).is_some() {
                return Some(RouteMatch {
                    route: Arc::clone(route),
                });
            }
        }
        None
    }
}

/// Empty path maps to `/`; trailing slashes are significant (preserved as an
/// empty trailing segment is NOT added — a trailing slash simply yields no
/// extra segment, matching the "trailing slashes are significant" rule via
/// the literal/suffix semantics above operating on split `/`-segments).
fn normalize_path(path: &str) -> String {
    if path.is_empty() {
        "/".to_string()
    } else {
        path.to_string()
    }
}

fn decode_segments(path: &str) -> Vec<String> {
    path.trim_start_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .map(percent_decode_once)
        .collect()
}

/// Percent-decode a path segment once for matching purposes; forwarding
/// continues to use the original encoded request target (`spec.md` §4.1).
fn percent_decode_once(segment: &str) -> String {
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                out.push(hi * 16 + lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(id: &str, patterns: &[&str], methods: &[&str]) -> RouteConfig {
        RouteConfig {
            id: id.into(),
            path_patterns: patterns.iter().map(|s| s.to_string()).collect(),
            methods: methods.iter().map(|s| s.to_string()).collect(),
            upstream_base_url: "http://upstream.internal".into(),
            strip_prefix: None,
            rewrite_to: None,
            auth_required: false,
            public_paths: vec![],
            rate_limit_policy_ref: None,
            breaker_ref: None,
            stamp_identity: false,
            strip_authorization: false,
            timeout_ms: 5000,
            max_retries: 0,
        }
    }

    #[test]
    fn first_match_wins_on_overlapping_routes() {
        let table = RouteTable::new(vec![
            route("specific", &["/hives/health"], &[]),
            route("generic", &["/hives/*"], &[]),
        ])
        .unwrap();
        let m = table.match_request("GET", "/hives/health").unwrap();
        assert_eq!(m.route.id, "specific");
    }

    #[test]
    fn single_segment_wildcard_excludes_slash() {
        let table = RouteTable::new(vec![route("r", &["/hives/*"], &[])]).unwrap();
        assert!(table.match_request("GET", "/hives/123").is_some());
        assert!(table.match_request("GET", "/hives/123/members").is_none());
    }

    #[test]
    fn suffix_wildcard_matches_any_remaining_segments() {
        let table = RouteTable::new(vec![route("r", &["/auth/**"], &[])]).unwrap();
        assert!(table.match_request("GET", "/auth/login").is_some());
        assert!(table.match_request("GET", "/auth/login/callback").is_some());
        assert!(table.match_request("GET", "/auth").is_none());
    }

    #[test]
    fn method_filter_restricts_matches() {
        let table = RouteTable::new(vec![route("r", &["/chat/messages"], &["POST"])]).unwrap();
        assert!(table.match_request("POST", "/chat/messages").is_some());
        assert!(table.match_request("GET", "/chat/messages").is_none());
    }

    #[test]
    fn empty_path_maps_to_root() {
        let table = RouteTable::new(vec![route("root", &["/"], &[])]).unwrap();
        assert!(table.match_request("GET", "").is_some());
    }

    #[test]
    fn percent_decoding_applies_once_for_matching() {
        let table = RouteTable::new(vec![route("r", &["/hives/my room"], &[])]).unwrap();
        assert!(table.match_request("GET", "/hives/my%20room").is_some());
    }

    #[test]
    fn public_path_bypass_checks_sub_pattern() {
        let mut cfg = route("r", &["/hives/**"], &[]);
        cfg.public_paths = vec!["/hives/public/*".into()];
        let table = RouteTable::new(vec![cfg]).unwrap();
        let m = table.match_request("GET", "/hives/public/123").unwrap();
        let segments = decode_segments("/hives/public/123");
        let borrowed: Vec<&str> = segments.iter().map(|s| s.as_str()).collect();
        assert!(m.route.is_public_path(&borrowed));
    }
}
