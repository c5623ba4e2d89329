//! Tracing and metrics bootstrap shared by gateway binaries.
//!
//! Mirrors the teacher's `server/observability` crate: a single `init`
//! entry point that installs a `tracing-subscriber` pipeline and a
//! Prometheus recorder, returning handles the caller keeps alive for the
//! lifetime of the process.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Supported log output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Pretty => "pretty",
            LogFormat::Json => "json",
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" => Ok(LogFormat::Pretty),
            other => Err(anyhow::anyhow!("unsupported log format: {other}")),
        }
    }
}

/// Configuration driving tracing initialisation.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub service_name: String,
    pub log_format: LogFormat,
    pub log_level: String,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: "api-gateway".into(),
            log_format: LogFormat::Pretty,
            log_level: "info".into(),
        }
    }
}

/// Guard held by the caller for the process lifetime; dropping it is a no-op
/// today but keeps the call site stable if an exporter needing teardown is
/// added later.
pub struct TracingGuard;

/// Install the tracing subscriber with the configured filter and formatter.
pub fn init_tracing(config: &TracingConfig) -> Result<TracingGuard> {
    let env_filter =
        EnvFilter::try_new(config.log_level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::registry().with(env_filter);
    match config.log_format {
        LogFormat::Pretty => subscriber
            .with(fmt::layer().with_target(true))
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to install tracing subscriber: {err}"))?,
        LogFormat::Json => subscriber
            .with(fmt::layer().json().with_target(true))
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to install tracing subscriber: {err}"))?,
    }

    Ok(TracingGuard)
}

/// Prometheus exporter wrapper returning rendered metrics text.
#[derive(Clone)]
pub struct MetricsExporter {
    handle: PrometheusHandle,
}

impl MetricsExporter {
    pub fn install_with_defaults() -> Result<Self> {
        Self::install(PrometheusBuilder::new())
    }

    pub fn install(builder: PrometheusBuilder) -> Result<Self> {
        let handle = builder
            .install_recorder()
            .context("failed to install Prometheus recorder")?;
        describe_gateway_metrics();
        Ok(Self { handle })
    }

    pub fn handle(&self) -> &PrometheusHandle {
        &self.handle
    }

    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Convenience helper initialising tracing + metrics with a single call.
pub fn init(
    tracing: &TracingConfig,
    metrics_builder: Option<PrometheusBuilder>,
) -> Result<(TracingGuard, MetricsExporter)> {
    let guard = init_tracing(tracing)?;
    let exporter = if let Some(builder) = metrics_builder {
        MetricsExporter::install(builder)?
    } else {
        MetricsExporter::install_with_defaults()?
    };
    Ok((guard, exporter))
}

/// Register descriptions for the metric surface named in the gateway spec
/// so `/metrics` carries HELP/TYPE lines even before the first observation.
fn describe_gateway_metrics() {
    metrics::describe_counter!(
        "gateway_requests_total",
        "Total requests handled, labeled by route, method and status"
    );
    metrics::describe_histogram!(
        "gateway_request_duration_seconds",
        "Request handling duration in seconds, labeled by route"
    );
    metrics::describe_counter!(
        "gateway_ratelimit_rejections_total",
        "Total requests rejected by the rate limiter, labeled by policy"
    );
    metrics::describe_gauge!(
        "gateway_breaker_state",
        "Circuit breaker state per upstream (0=closed, 1=half-open, 2=open)"
    );
    metrics::describe_counter!(
        "gateway_upstream_failures_total",
        "Total upstream failures, labeled by upstream and reason"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_log_format_variants() {
        assert_eq!(LogFormat::from_str("json").unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::from_str("PRETTY").unwrap(), LogFormat::Pretty);
        assert!(LogFormat::from_str("yaml").is_err());
    }

    #[test]
    fn installs_prometheus_recorder() {
        // Multiple installs in the same process would panic (global recorder),
        // so this just exercises the builder path in isolation via render().
        if let Ok(exporter) = MetricsExporter::install_with_defaults() {
            metrics::counter!("gateway_requests_total", "route" => "test", "method" => "GET", "status" => "200").increment(1);
            let rendered = exporter.render();
            assert!(rendered.contains("gateway_requests_total"));
        }
    }
}
