//! API gateway core: route matching, JWT auth, distributed rate limiting,
//! circuit breaking with fallback, and observability for a microservices
//! front door (`spec.md` §1-2).

pub mod auth;
pub mod breaker;
pub mod clock;
pub mod cors;
pub mod error;
pub mod fallback;
pub mod filter_chain;
pub mod forwarder;
pub mod health;
pub mod rate_limit;
pub mod route_table;

use std::sync::Arc;

use anyhow::{Context, Result};
use gateway_config::GatewayConfig;
use redis::aio::ConnectionManager;

use crate::auth::JwtVerifier;
use crate::breaker::BreakerRegistry;
use crate::clock::{Clock, SystemClock};
use crate::cors::CorsPolicy;
use crate::filter_chain::AppState;
use crate::forwarder::Forwarder;
use crate::health::{HealthState, ReadinessFlag};
use crate::rate_limit::{BucketStore, MemoryBucketStore, RateLimiter, RedisBucketStore};
use crate::route_table::RouteTable;

/// Everything wired up at boot, ready to be mounted onto an `axum::Router`.
/// Grounded on the teacher's `AppState` composition root in `main.rs`.
pub struct Gateway {
    pub app_state: AppState,
    pub health_state: HealthState,
}

/// Build the full gateway wiring from a validated configuration document.
/// Returns a config-time error (exit code 64 at the CLI boundary) if the
/// Redis backing store for rate limiting cannot be reached at all — the
/// limiter itself still fails open per-request afterward, but a store that
/// is unreachable at boot likely indicates misconfiguration rather than a
/// transient blip.
pub async fn build(config: &GatewayConfig, metrics: Arc<gateway_observability::MetricsExporter>) -> Result<Gateway> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let route_table = Arc::new(
        RouteTable::new(config.routes.clone()).context("compiling route table")?,
    );

    let verifier = Arc::new(JwtVerifier::from_config(&config.jwt));

    let bucket_store: Arc<dyn BucketStore> = match connect_redis(&config.rate_limit_store.redis_url).await {
        Ok(manager) => Arc::new(RedisBucketStore::new(manager)),
        Err(err) => {
            tracing::warn!(error = %err, "rate limit store unreachable at boot, using in-memory fallback");
            Arc::new(MemoryBucketStore::default())
        }
    };
    let rate_limiter = Arc::new(RateLimiter::new(config.policies.clone(), bucket_store, clock.clone()));

    let breakers = Arc::new(BreakerRegistry::new(config.breakers.clone(), clock.clone()));
    let known_breaker_ids = Arc::new(config.breakers.iter().map(|b| b.id.clone()).collect::<Vec<_>>());

    let forwarder = Arc::new(Forwarder::new());
    let cors = Arc::new(CorsPolicy::new(config.cors.clone()));
    let security_headers = Arc::new(config.security_headers.clone());

    let app_state = AppState {
        route_table,
        verifier,
        rate_limiter: rate_limiter.clone(),
        breakers: breakers.clone(),
        forwarder,
        cors,
        security_headers,
        clock,
    };

    let readiness = ReadinessFlag::default();
    readiness.mark_ready();

    let health_state = HealthState {
        readiness,
        breakers,
        rate_limiter,
        metrics,
        known_breaker_ids,
    };

    Ok(Gateway {
        app_state,
        health_state,
    })
}

async fn connect_redis(redis_url: &str) -> Result<ConnectionManager> {
    let client = redis::Client::open(redis_url).context("parsing redis url")?;
    let manager = ConnectionManager::new(client)
        .await
        .context("connecting to rate limit store")?;
    Ok(manager)
}
