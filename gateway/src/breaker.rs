//! C5 — Circuit Breaker: per-upstream CLOSED/OPEN/HALF_OPEN state machine
//! over a sliding window of call outcomes (`spec.md` §4.4).
//!
//! Grounded on the teacher's `CircuitBreaker` (per-service `Mutex` guarding a
//! ring buffer of booleans plus a state enum); this version adds the
//! half-open probe budget and the optional slow-call-as-failure threshold
//! the teacher's version doesn't have.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use gateway_config::BreakerConfig;
use parking_lot::{Mutex, RwLock};

use crate::clock::{Clock, Millis};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    /// Numeric encoding used for the `gateway_breaker_state` gauge
    /// (`spec.md` observability section): 0=closed, 1=half_open, 2=open.
    pub fn as_gauge_value(&self) -> f64 {
        match self {
            BreakerState::Closed => 0.0,
            BreakerState::HalfOpen => 1.0,
            BreakerState::Open => 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPermit {
    Allowed,
    Rejected,
}

struct BreakerInner {
    state: BreakerState,
    /// Most recent outcomes, `true` = success. Bounded to `window_size`.
    outcomes: VecDeque<bool>,
    opened_at: Millis,
    half_open_probes_remaining: usize,
    half_open_inflight: usize,
}

impl BreakerInner {
    fn new(config: &BreakerConfig) -> Self {
        Self {
            state: BreakerState::Closed,
            outcomes: VecDeque::with_capacity(config.window_size),
            opened_at: 0,
            half_open_probes_remaining: config.half_open_probes,
            half_open_inflight: 0,
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.outcomes.iter().filter(|ok| !**ok).count();
        failures as f64 / self.outcomes.len() as f64
    }

    fn record(&mut self, config: &BreakerConfig, success: bool) {
        self.outcomes.push_back(success);
        while self.outcomes.len() > config.window_size {
            self.outcomes.pop_front();
        }
    }
}

/// A single upstream's breaker. Cheap to lock: one mutex guards only this
/// upstream's window, so contention never spans upstreams.
struct Breaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl Breaker {
    fn new(config: BreakerConfig) -> Self {
        let inner = BreakerInner::new(&config);
        Self {
            config,
            inner: Mutex::new(inner),
        }
    }

    fn try_acquire(&self, clock: &dyn Clock) -> CallPermit {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => CallPermit::Allowed,
            BreakerState::Open => {
                let elapsed = clock.now_millis() - inner.opened_at;
                if elapsed >= self.config.open_duration_ms as Millis {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_probes_remaining = self.config.half_open_probes;
                    inner.half_open_inflight = 0;
                    self.acquire_half_open(&mut inner)
                } else {
                    CallPermit::Rejected
                }
            }
            BreakerState::HalfOpen => self.acquire_half_open(&mut inner),
        }
    }

    fn acquire_half_open(&self, inner: &mut BreakerInner) -> CallPermit {
        if inner.half_open_probes_remaining == 0 {
            return CallPermit::Rejected;
        }
        inner.half_open_probes_remaining -= 1;
        inner.half_open_inflight += 1;
        CallPermit::Allowed
    }

    fn on_outcome(&self, clock: &dyn Clock, success: bool, was_slow: bool) {
        let treated_as_failure = !success || (was_slow && self.config.slow_call_ms.is_some());
        let mut inner = self.inner.lock();

        match inner.state {
            BreakerState::HalfOpen => {
                inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
                if treated_as_failure {
                    self.trip_open(&mut inner, clock);
                } else if inner.half_open_probes_remaining == 0 && inner.half_open_inflight == 0 {
                    inner.state = BreakerState::Closed;
                    inner.outcomes.clear();
                }
            }
            BreakerState::Closed => {
                inner.record(&self.config, !treated_as_failure);
                if inner.outcomes.len() >= self.config.min_calls
                    && inner.failure_rate() >= self.config.failure_rate_threshold
                {
                    self.trip_open(&mut inner, clock);
                }
            }
            BreakerState::Open => {
                // Outcome arrived after the breaker already re-opened from
                // a failed probe; nothing to update.
            }
        }
    }

    fn trip_open(&self, inner: &mut BreakerInner, clock: &dyn Clock) {
        inner.state = BreakerState::Open;
        inner.opened_at = clock.now_millis();
        inner.outcomes.clear();
    }

    fn snapshot_state(&self) -> BreakerState {
        self.inner.lock().state
    }
}

/// Registry of per-upstream breakers, keyed by the `breaker_ref` named in
/// route configuration.
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<Breaker>>>,
    configs: HashMap<String, BreakerConfig>,
    clock: Arc<dyn Clock>,
}

impl BreakerRegistry {
    pub fn new(configs: Vec<BreakerConfig>, clock: Arc<dyn Clock>) -> Self {
        let configs = configs.into_iter().map(|c| (c.id.clone(), c)).collect();
        Self {
            breakers: RwLock::new(HashMap::new()),
            configs,
            clock,
        }
    }

    fn breaker_for(&self, breaker_id: &str) -> Option<Arc<Breaker>> {
        if let Some(existing) = self.breakers.read().get(breaker_id) {
            return Some(Arc::clone(existing));
        }
        let config = self.configs.get(breaker_id)?.clone();
        let mut breakers = self.breakers.write();
        let entry = breakers
            .entry(breaker_id.to_string())
            .or_insert_with(|| Arc::new(Breaker::new(config)));
        Some(Arc::clone(entry))
    }

    /// `acquire(breaker_id) -> Allowed | Rejected` per `spec.md` §4.4. An
    /// upstream with no configured breaker is treated as always-closed.
    pub fn acquire(&self, breaker_id: &str) -> CallPermit {
        match self.breaker_for(breaker_id) {
            Some(breaker) => breaker.try_acquire(self.clock.as_ref()),
            None => CallPermit::Allowed,
        }
    }

    pub fn record_outcome(&self, breaker_id: &str, success: bool, was_slow: bool) {
        if let Some(breaker) = self.breaker_for(breaker_id) {
            breaker.on_outcome(self.clock.as_ref(), success, was_slow);
        }
    }

    pub fn state_of(&self, breaker_id: &str) -> Option<BreakerState> {
        self.breaker_for(breaker_id).map(|b| b.snapshot_state())
    }

    pub fn is_slow(&self, breaker_id: &str, elapsed_ms: u64) -> bool {
        self.configs
            .get(breaker_id)
            .and_then(|c| c.slow_call_ms)
            .is_some_and(|threshold| elapsed_ms >= threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;

    fn config(id: &str) -> BreakerConfig {
        BreakerConfig {
            id: id.into(),
            window_size: 4,
            min_calls: 4,
            failure_rate_threshold: 0.5,
            open_duration_ms: 1000,
            half_open_probes: 2,
            slow_call_ms: None,
        }
    }

    #[test]
    fn trips_open_after_failure_threshold_with_min_calls() {
        let clock = Arc::new(FixedClock::new(0));
        let registry = BreakerRegistry::new(vec![config("svc")], clock);

        for _ in 0..3 {
            assert_eq!(registry.acquire("svc"), CallPermit::Allowed);
            registry.record_outcome("svc", false, false);
        }
        assert_eq!(registry.state_of("svc"), Some(BreakerState::Closed));

        registry.acquire("svc");
        registry.record_outcome("svc", false, false);
        assert_eq!(registry.state_of("svc"), Some(BreakerState::Open));
        assert_eq!(registry.acquire("svc"), CallPermit::Rejected);
    }

    #[test]
    fn transitions_to_half_open_after_open_duration_elapses() {
        let clock = Arc::new(FixedClock::new(0));
        let registry = BreakerRegistry::new(vec![config("svc")], clock.clone());
        for _ in 0..4 {
            registry.acquire("svc");
            registry.record_outcome("svc", false, false);
        }
        assert_eq!(registry.state_of("svc"), Some(BreakerState::Open));

        clock.advance(1000);
        assert_eq!(registry.acquire("svc"), CallPermit::Allowed);
        assert_eq!(registry.state_of("svc"), Some(BreakerState::HalfOpen));
    }

    #[test]
    fn half_open_probe_failure_reopens_immediately() {
        let clock = Arc::new(FixedClock::new(0));
        let registry = BreakerRegistry::new(vec![config("svc")], clock.clone());
        for _ in 0..4 {
            registry.acquire("svc");
            registry.record_outcome("svc", false, false);
        }
        clock.advance(1000);
        assert_eq!(registry.acquire("svc"), CallPermit::Allowed);
        registry.record_outcome("svc", false, false);
        assert_eq!(registry.state_of("svc"), Some(BreakerState::Open));
    }

    #[test]
    fn half_open_success_on_all_probes_closes_breaker() {
        let clock = Arc::new(FixedClock::new(0));
        let registry = BreakerRegistry::new(vec![config("svc")], clock.clone());
        for _ in 0..4 {
            registry.acquire("svc");
            registry.record_outcome("svc", false, false);
        }
        clock.advance(1000);
        assert_eq!(registry.acquire("svc"), CallPermit::Allowed);
        assert_eq!(registry.acquire("svc"), CallPermit::Allowed);
        registry.record_outcome("svc", true, false);
        registry.record_outcome("svc", true, false);
        assert_eq!(registry.state_of("svc"), Some(BreakerState::Closed));
    }

    #[test]
    fn missing_breaker_ref_is_always_allowed() {
        let clock = Arc::new(FixedClock::new(0));
        let registry = BreakerRegistry::new(vec![], clock);
        assert_eq!(registry.acquire("unconfigured"), CallPermit::Allowed);
    }

    #[test]
    fn slow_call_counts_as_failure_when_configured() {
        let mut cfg = config("svc");
        cfg.slow_call_ms = Some(200);
        let clock = Arc::new(FixedClock::new(0));
        let registry = BreakerRegistry::new(vec![cfg], clock);
        assert!(registry.is_slow("svc", 250));
        assert!(!registry.is_slow("svc", 50));
    }
}
