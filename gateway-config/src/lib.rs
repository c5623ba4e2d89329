//! Declarative configuration document for the gateway (`spec.md` §6).
//!
//! Grounded on the teacher's `server/core::config` module: a layered
//! `config`-crate builder (default file, optional profile file, explicit
//! path, environment overrides) deserialized into typed sections via serde.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use config::{Config, ConfigError as BuilderError, Environment, File, FileFormat};
use serde::Deserialize;
use thiserror::Error;

const DEFAULT_CONFIG_DIR: &str = "config";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Builder(#[from] BuilderError),
}

impl From<std::net::AddrParseError> for ConfigError {
    fn from(err: std::net::AddrParseError) -> Self {
        ConfigError::Message(err.to_string())
    }
}

/// CLI-sourced overrides layered on top of file + environment configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub profile: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    pub server: ListenerConfig,
    #[serde(default)]
    pub metrics: MetricsListenerConfig,
    pub jwt: JwtConfig,
    pub routes: Vec<RouteConfig>,
    pub policies: Vec<PolicyConfig>,
    pub breakers: Vec<BreakerConfig>,
    pub rate_limit_store: BackingStoreConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub security_headers: SecurityHeadersConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl GatewayConfig {
    pub fn metrics_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.metrics.bind, self.metrics.port).parse()
    }

    /// Referential-integrity checks that a malformed document fails at boot
    /// (`ConfigError`, exit code 64 per `spec.md` §6) rather than at the
    /// first request that happens to exercise the dangling reference.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let policy_ids: HashSet<&str> = self.policies.iter().map(|p| p.id.as_str()).collect();
        let breaker_ids: HashSet<&str> = self.breakers.iter().map(|b| b.id.as_str()).collect();
        let mut route_ids = HashSet::new();

        for route in &self.routes {
            if !route_ids.insert(route.id.as_str()) {
                return Err(ConfigError::Message(format!(
                    "duplicate route id: {}",
                    route.id
                )));
            }
            if route.path_patterns.is_empty() {
                return Err(ConfigError::Message(format!(
                    "route {} has no path patterns",
                    route.id
                )));
            }
            if let Some(policy_ref) = &route.rate_limit_policy_ref {
                if !policy_ids.contains(policy_ref.as_str()) {
                    return Err(ConfigError::Message(format!(
                        "route {} references unknown rate limit policy {}",
                        route.id, policy_ref
                    )));
                }
            }
            if let Some(breaker_ref) = &route.breaker_ref {
                if !breaker_ids.contains(breaker_ref.as_str()) {
                    return Err(ConfigError::Message(format!(
                        "route {} references unknown breaker {}",
                        route.id, breaker_ref
                    )));
                }
            }
        }

        for policy in &self.policies {
            if policy.tokens_per_second <= 0.0 {
                return Err(ConfigError::Message(format!(
                    "policy {} must have a positive refill rate",
                    policy.id
                )));
            }
            if policy.burst_capacity == 0 {
                return Err(ConfigError::Message(format!(
                    "policy {} must have a non-zero burst capacity",
                    policy.id
                )));
            }
        }

        for breaker in &self.breakers {
            if breaker.min_calls == 0 || breaker.window_size == 0 {
                return Err(ConfigError::Message(format!(
                    "breaker {} must have a non-zero window/min_calls",
                    breaker.id
                )));
            }
            if !(0.0..=1.0).contains(&breaker.failure_rate_threshold) {
                return Err(ConfigError::Message(format!(
                    "breaker {} failure_rate_threshold must be in [0, 1]",
                    breaker.id
                )));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl ListenerConfig {
    pub fn bind_address(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }
}

fn default_max_concurrent_requests() -> usize {
    1024
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TlsConfig {
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsListenerConfig {
    #[serde(default = "default_metrics_bind")]
    pub bind: String,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsListenerConfig {
    fn default() -> Self {
        Self {
            bind: default_metrics_bind(),
            port: default_metrics_port(),
        }
    }
}

fn default_metrics_bind() -> String {
    "127.0.0.1".into()
}

fn default_metrics_port() -> u16 {
    9090
}

/// JWT verification mode (`spec.md` §4.2).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum JwtConfig {
    Hmac {
        secret: String,
        #[serde(default = "default_clock_skew")]
        clock_skew_secs: i64,
        #[serde(default)]
        blocklist: Option<BlocklistConfig>,
    },
    Jwks {
        url: String,
        #[serde(default = "default_jwks_ttl")]
        ttl_secs: u64,
        #[serde(default = "default_jwks_cooldown")]
        refresh_cooldown_secs: u64,
        #[serde(default = "default_clock_skew")]
        clock_skew_secs: i64,
        #[serde(default)]
        blocklist: Option<BlocklistConfig>,
    },
}

fn default_clock_skew() -> i64 {
    60
}

fn default_jwks_ttl() -> u64 {
    300
}

fn default_jwks_cooldown() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlocklistConfig {
    pub redis_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    pub id: String,
    pub path_patterns: Vec<String>,
    #[serde(default)]
    pub methods: Vec<String>,
    pub upstream_base_url: String,
    #[serde(default)]
    pub strip_prefix: Option<String>,
    #[serde(default)]
    pub rewrite_to: Option<String>,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub public_paths: Vec<String>,
    #[serde(default)]
    pub rate_limit_policy_ref: Option<String>,
    #[serde(default)]
    pub breaker_ref: Option<String>,
    #[serde(default)]
    pub stamp_identity: bool,
    #[serde(default)]
    pub strip_authorization: bool,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub max_retries: u32,
}

fn default_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    PerUser,
    PerIp,
    PerRoute,
    CompositeUserIp,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    pub id: String,
    pub tokens_per_second: f64,
    pub burst_capacity: u64,
    pub key_strategy: KeyStrategy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
    pub id: String,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_min_calls")]
    pub min_calls: usize,
    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate_threshold: f64,
    #[serde(default = "default_open_duration_ms")]
    pub open_duration_ms: u64,
    #[serde(default = "default_half_open_probes")]
    pub half_open_probes: usize,
    #[serde(default)]
    pub slow_call_ms: Option<u64>,
}

fn default_window_size() -> usize {
    20
}
fn default_min_calls() -> usize {
    10
}
fn default_failure_rate_threshold() -> f64 {
    0.5
}
fn default_open_duration_ms() -> u64 {
    5_000
}
fn default_half_open_probes() -> usize {
    3
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackingStoreConfig {
    pub redis_url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

fn default_pool_size() -> u32 {
    16
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    #[serde(default)]
    pub allow_origins: Vec<String>,
    #[serde(default = "default_cors_methods")]
    pub allow_methods: Vec<String>,
    #[serde(default)]
    pub allow_headers: Vec<String>,
    #[serde(default)]
    pub expose_headers: Vec<String>,
    #[serde(default)]
    pub allow_credentials: bool,
    #[serde(default = "default_cors_max_age")]
    pub max_age_secs: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allow_origins: Vec::new(),
            allow_methods: default_cors_methods(),
            allow_headers: Vec::new(),
            expose_headers: Vec::new(),
            allow_credentials: false,
            max_age_secs: default_cors_max_age(),
        }
    }
}

fn default_cors_methods() -> Vec<String> {
    vec![
        "GET".into(),
        "POST".into(),
        "PUT".into(),
        "PATCH".into(),
        "DELETE".into(),
        "OPTIONS".into(),
    ]
}

fn default_cors_max_age() -> u64 {
    3600
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityHeadersConfig {
    #[serde(default = "default_csp")]
    pub content_security_policy: String,
    #[serde(default = "default_hsts")]
    pub strict_transport_security: String,
    #[serde(default = "default_referrer_policy")]
    pub referrer_policy: String,
}

impl Default for SecurityHeadersConfig {
    fn default() -> Self {
        Self {
            content_security_policy: default_csp(),
            strict_transport_security: default_hsts(),
            referrer_policy: default_referrer_policy(),
        }
    }
}

fn default_csp() -> String {
    "default-src 'none'".into()
}

fn default_hsts() -> String {
    "max-age=63072000; includeSubDomains".into()
}

fn default_referrer_policy() -> String {
    "no-referrer".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

pub fn load(overrides: ConfigOverrides) -> Result<GatewayConfig, ConfigError> {
    let mut builder = Config::builder();
    builder = builder.add_source(required_file(DEFAULT_CONFIG_DIR, "default.toml"));

    if let Some(profile) = overrides.profile.as_deref() {
        let profile_file = format!("{profile}.toml");
        builder = builder.add_source(optional_file(DEFAULT_CONFIG_DIR, &profile_file));
    }

    if let Some(path) = overrides.config_path {
        builder = builder.add_source(File::from(path));
    }

    builder = builder.add_source(Environment::with_prefix("GATEWAY").separator("__"));

    if let Some(host) = overrides.host {
        builder = builder.set_override("server.host", host)?;
    }
    if let Some(port) = overrides.port {
        builder = builder.set_override("server.port", port as i64)?;
    }
    if let Some(level) = overrides.log_level {
        builder = builder.set_override("logging.level", level)?;
    }
    if let Some(format) = overrides.log_format {
        builder = builder.set_override("logging.format", format)?;
    }

    let config = builder.build()?;
    let parsed: GatewayConfig = config.try_deserialize()?;
    parsed
        .validate()
        .map_err(|err| ConfigError::Message(err.to_string()))?;
    Ok(parsed)
}

fn required_file(dir: &str, name: &str) -> File<config::FileSourceFile, FileFormat> {
    File::from(Path::new(dir).join(name)).format(FileFormat::Toml)
}

fn optional_file(dir: &str, name: &str) -> File<config::FileSourceFile, FileFormat> {
    File::from(Path::new(dir).join(name))
        .required(false)
        .format(FileFormat::Toml)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn minimal_toml() -> &'static str {
        r#"
[server]
host = "127.0.0.1"
port = 8080

[jwt]
mode = "hmac"
secret = "dev-secret"

[[routes]]
id = "identity"
path_patterns = ["/auth/**"]
upstream_base_url = "http://identity.internal"

[[policies]]
id = "default"
tokens_per_second = 5.0
burst_capacity = 10
key_strategy = "per_user"

[[breakers]]
id = "identity"

[rate_limit_store]
redis_url = "redis://127.0.0.1:6379"
"#
    }

    #[test]
    fn loads_minimal_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(minimal_toml().as_bytes()).unwrap();

        let overrides = ConfigOverrides {
            config_path: None,
            profile: None,
            host: None,
            port: None,
            log_level: None,
            log_format: None,
        };
        // Build directly against the temp file instead of the default dir.
        let config = Config::builder()
            .add_source(File::from(path))
            .build()
            .unwrap();
        let parsed: GatewayConfig = config.try_deserialize().unwrap();
        parsed.validate().expect("valid document");
        assert_eq!(parsed.server.port, 8080);
        assert_eq!(parsed.routes.len(), 1);
        let _ = overrides;
    }

    #[test]
    fn rejects_dangling_policy_reference() {
        let mut config: GatewayConfig = {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("gateway.toml");
            std::fs::write(&path, minimal_toml()).unwrap();
            let built = Config::builder().add_source(File::from(path)).build().unwrap();
            built.try_deserialize().unwrap()
        };
        config.routes[0].rate_limit_policy_ref = Some("missing".into());
        let err = config.validate().expect_err("dangling ref rejected");
        assert!(err.to_string().contains("unknown rate limit policy"));
    }

    #[test]
    fn rejects_duplicate_route_ids() {
        let mut config: GatewayConfig = {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("gateway.toml");
            std::fs::write(&path, minimal_toml()).unwrap();
            let built = Config::builder().add_source(File::from(path)).build().unwrap();
            built.try_deserialize().unwrap()
        };
        let dup = config.routes[0].clone();
        config.routes.push(dup);
        let err = config.validate().expect_err("duplicate route rejected");
        assert!(err.to_string().contains("duplicate route id"));
    }
}
