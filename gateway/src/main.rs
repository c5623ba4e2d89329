use std::net::SocketAddr;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use clap::{Args, Parser, Subcommand};
use gateway::filter_chain::dispatch;
use gateway::health::{detailed, liveness, metrics, readiness};
use gateway_config::ConfigOverrides;
use gateway_observability::{LogFormat, TracingConfig};
use tokio::net::TcpListener;
use tokio::signal;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "gateway", about = "API gateway: routing, auth, rate limiting, circuit breaking")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load configuration, bind listeners, and serve traffic.
    Run(RunArgs),
    /// Load and validate the configuration document without serving.
    ValidateConfig(ConfigArgs),
    /// Print the gateway's version and exit.
    Version,
}

#[derive(Args, Debug, Clone)]
struct ConfigArgs {
    #[arg(long)]
    config: Option<std::path::PathBuf>,
    #[arg(long)]
    profile: Option<String>,
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    #[command(flatten)]
    config: ConfigArgs,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long = "log-level")]
    log_level: Option<String>,
    #[arg(long = "log-format")]
    log_format: Option<String>,
}

impl RunArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            config_path: self.config.config.clone(),
            profile: self.config.profile.clone(),
            host: self.host.clone(),
            port: self.port,
            log_level: self.log_level.clone(),
            log_format: self.log_format.clone(),
        }
    }
}

/// Config-document and bind-address errors exit 64 (`EX_USAGE`); anything
/// that fails after boot exits 70 (`EX_SOFTWARE`), per `spec.md` §6.
const EXIT_USAGE: u8 = 64;
const EXIT_SOFTWARE: u8 = 70;

fn main() -> ExitCode {
    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new().expect("failed to start tokio runtime");
    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("gateway: {err:#}");
            ExitCode::from(err.downcast_ref::<CliError>().map(|e| e.exit_code).unwrap_or(EXIT_SOFTWARE))
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
struct CliError {
    message: String,
    exit_code: u8,
}

impl CliError {
    fn usage(message: impl Into<String>) -> anyhow::Error {
        anyhow::Error::new(CliError {
            message: message.into(),
            exit_code: EXIT_USAGE,
        })
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Version => {
            println!("gateway {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::ValidateConfig(args) => {
            let overrides = ConfigOverrides {
                config_path: args.config.clone(),
                profile: args.profile.clone(),
                ..Default::default()
            };
            gateway_config::load(overrides).map_err(|err| CliError::usage(err.to_string()))?;
            println!("configuration is valid");
            Ok(())
        }
        Command::Run(args) => run_server(args).await,
    }
}

async fn run_server(args: RunArgs) -> Result<()> {
    let config = gateway_config::load(args.overrides()).map_err(|err| CliError::usage(err.to_string()))?;

    let log_format = LogFormat::from_str(&config.logging.format).unwrap_or(LogFormat::Pretty);
    let tracing_config = TracingConfig {
        service_name: "gateway".into(),
        log_format,
        log_level: config.logging.level.clone(),
    };
    let (_tracing_guard, metrics_exporter) =
        gateway_observability::init(&tracing_config, None).context("initialising observability")?;
    let metrics_exporter = Arc::new(metrics_exporter);

    let gw = gateway::build(&config, metrics_exporter).await.context("building gateway")?;

    let health_router = Router::new()
        .route("/health", get(liveness))
        .route("/ready", get(readiness))
        .route("/health/detailed", get(detailed))
        .route("/metrics", get(metrics))
        .with_state(gw.health_state.clone());
    let proxy_router = Router::new().fallback(dispatch).with_state(gw.app_state);
    let app_router = health_router
        .merge(proxy_router)
        .layer(RequestBodyLimitLayer::new(config.server.max_body_bytes))
        .layer(ConcurrencyLimitLayer::new(config.server.max_concurrent_requests));

    let addr = config
        .server
        .bind_address()
        .context("invalid server bind address")?;
    let metrics_addr = config.metrics_addr().context("invalid metrics bind address")?;

    if metrics_addr != addr {
        let metrics_router = Router::new()
            .route("/metrics", get(metrics))
            .route("/health", get(liveness))
            .with_state(gw.health_state);
        let metrics_listener = TcpListener::bind(metrics_addr)
            .await
            .with_context(|| format!("failed to bind metrics endpoint on {metrics_addr}"))?;
        tokio::spawn(async move {
            info!(%metrics_addr, "starting dedicated metrics listener");
            if let Err(err) = axum::serve(metrics_listener, metrics_router.into_make_service()).await {
                error!(%err, "metrics server terminated");
            }
        });
    }

    if let Some(tls) = load_rustls(config.server.tls.as_ref()).await? {
        info!(%addr, "starting TLS gateway server");
        let handle = axum_server::Handle::new();
        let shutdown_handle = handle.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown_handle.graceful_shutdown(None);
        });
        axum_server::bind_rustls(addr, tls)
            .handle(handle)
            .serve(app_router.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .context("gateway server exited")?;
    } else {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind gateway address {addr}"))?;
        info!(%addr, "starting HTTP gateway server");
        axum::serve(
            listener,
            app_router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server exited")?;
    }

    Ok(())
}

async fn load_rustls(tls: Option<&gateway_config::TlsConfig>) -> Result<Option<RustlsConfig>> {
    if let Some(tls) = tls {
        if let (Some(cert), Some(key)) = (&tls.cert_path, &tls.key_path) {
            let config = RustlsConfig::from_pem_file(cert.clone(), key.clone())
                .await
                .context("failed to load TLS certs")?;
            return Ok(Some(config));
        }
    }
    Ok(None)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
