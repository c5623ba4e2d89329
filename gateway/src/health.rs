//! C9 — Health & Metrics: `/health`, `/health/detailed`, `/ready`, and
//! `/metrics` (`spec.md` §4.8).
//!
//! Grounded on the teacher's `server/observability` health handlers:
//! liveness is unconditional, readiness depends on dependency probes, and
//! the Prometheus text format is rendered straight from the installed
//! recorder rather than hand-built.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::breaker::{BreakerRegistry, BreakerState};
use crate::rate_limit::RateLimiter;
use gateway_observability::MetricsExporter;

/// Flips once after the gateway has completed boot wiring (route table,
/// breaker registry, rate limiter all constructed) so `/ready` doesn't
/// report healthy before the server can actually serve traffic.
#[derive(Clone, Default)]
pub struct ReadinessFlag(Arc<AtomicBool>);

impl ReadinessFlag {
    pub fn mark_ready(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct HealthState {
    pub readiness: ReadinessFlag,
    pub breakers: Arc<BreakerRegistry>,
    pub rate_limiter: Arc<RateLimiter>,
    pub metrics: Arc<MetricsExporter>,
    pub known_breaker_ids: Arc<Vec<String>>,
}

/// `GET /health` — unconditional liveness; a 200 here only means the
/// process is scheduling requests, not that upstreams are reachable.
pub async fn liveness() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({ "status": "ok" })),
    )
}

/// `GET /ready` — readiness gate used by orchestrators to decide whether to
/// route traffic to this instance.
pub async fn readiness(State(state): State<HealthState>) -> impl IntoResponse {
    if state.readiness.is_ready() {
        (StatusCode::OK, Json(json!({ "status": "ready" })))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "status": "starting" })))
    }
}

/// `GET /health/detailed` — per-breaker state and the rate limiter's store
/// failure counter, for dashboards and on-call triage.
pub async fn detailed(State(state): State<HealthState>) -> impl IntoResponse {
    let breakers: serde_json::Map<String, serde_json::Value> = state
        .known_breaker_ids
        .iter()
        .map(|id| {
            let status = match state.breakers.state_of(id) {
                Some(BreakerState::Closed) => "closed",
                Some(BreakerState::Open) => "open",
                Some(BreakerState::HalfOpen) => "half_open",
                None => "unconfigured",
            };
            (id.clone(), json!(status))
        })
        .collect();

    Json(json!({
        "status": if state.readiness.is_ready() { "ready" } else { "starting" },
        "breakers": breakers,
        "rate_limit_store_failures": state.rate_limiter.store_failure_count(),
    }))
}

/// `GET /metrics` — Prometheus exposition format.
pub async fn metrics(State(state): State<HealthState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_flag_starts_unready() {
        let flag = ReadinessFlag::default();
        assert!(!flag.is_ready());
        flag.mark_ready();
        assert!(flag.is_ready());
    }
}
