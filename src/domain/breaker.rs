//! Per-campaign circuit breaker.
//!
//! The breaker vetoes bids independently of the pacing algorithm when a hard
//! safety condition holds: the campaign has consumed more than
//! `budget_threshold` of its daily budget, or failures have accumulated past
//! `max_failures`. After `timeout` in `OPEN` the breaker admits a bounded
//! number of probes (`HALF_OPEN`) and closes again once `success_threshold`
//! consecutive successes are recorded.

use crate::domain::budget::BudgetStatus;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    /// Numeric encoding used by the state gauge: 0=closed, 1=open,
    /// 2=half-open.
    pub fn as_gauge(&self) -> f64 {
        match self {
            BreakerState::Closed => 0.0,
            BreakerState::Open => 1.0,
            BreakerState::HalfOpen => 2.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Spend fraction at which the breaker trips regardless of failures.
    pub budget_threshold: f64,
    /// Consecutive failures tolerated while `CLOSED`.
    pub max_failures: u32,
    /// Time spent `OPEN` before probing.
    pub timeout: Duration,
    /// Successful probes required to close from `HALF_OPEN`.
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            budget_threshold: 0.95,
            max_failures: 3,
            timeout: Duration::from_secs(300),
            success_threshold: 2,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    last_state_change: Instant,
}

/// Snapshot of a breaker's counters for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
                last_state_change: Instant::now(),
            }),
        }
    }

    /// Decide whether a bid may proceed. May mutate state: trips on the
    /// budget threshold or an accumulated failure burst, and transitions
    /// `OPEN` → `HALF_OPEN` once the timeout has elapsed.
    pub fn allow(&self, status: &BudgetStatus) -> bool {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");

        if status.spend_fraction() >= self.config.budget_threshold {
            Self::trip(&mut inner, &status.campaign_id, "budget threshold exceeded");
            return false;
        }

        if inner.state == BreakerState::Closed && inner.failure_count >= self.config.max_failures {
            Self::trip(&mut inner, &status.campaign_id, "max failures exceeded");
            return false;
        }

        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                if inner.last_state_change.elapsed() > self.config.timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.success_count = 0;
                    inner.failure_count = 0;
                    inner.last_state_change = Instant::now();
                    info!(campaign_id = %status.campaign_id, "circuit breaker entering HALF_OPEN");
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => inner.success_count < self.config.success_threshold,
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");

        inner.failure_count = 0;

        if inner.state == BreakerState::HalfOpen {
            inner.success_count += 1;
            if inner.success_count >= self.config.success_threshold {
                inner.state = BreakerState::Closed;
                inner.last_state_change = Instant::now();
                info!("circuit breaker recovered to CLOSED");
            }
        }
    }

    pub fn record_failure(&self, reason: &str) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");

        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());

        if inner.state == BreakerState::HalfOpen || inner.failure_count >= self.config.max_failures
        {
            Self::trip(&mut inner, "", reason);
        }
    }

    /// Force the breaker back to `CLOSED` with zeroed counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_state_change = Instant::now();
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().expect("breaker lock poisoned");
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
        }
    }

    fn trip(inner: &mut BreakerInner, campaign_id: &str, reason: &str) {
        if inner.state != BreakerState::Open {
            inner.state = BreakerState::Open;
            inner.last_state_change = Instant::now();
            inner.success_count = 0;
            warn!(campaign_id = %campaign_id, reason = %reason, "circuit breaker tripped to OPEN");
        }
    }
}

/// Owns one breaker per campaign, created on first reference and retained
/// for the process lifetime.
pub struct CircuitBreakerManager {
    config: BreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerManager {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn breaker(&self, campaign_id: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self
            .breakers
            .read()
            .expect("breaker map lock poisoned")
            .get(campaign_id)
        {
            return breaker.clone();
        }

        let mut breakers = self.breakers.write().expect("breaker map lock poisoned");
        // Re-check: another task may have created it between the locks.
        breakers
            .entry(campaign_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config.clone())))
            .clone()
    }

    /// Breaker gate for the decision path. Marks the status when the bid is
    /// vetoed so downstream consumers see a consistent snapshot.
    pub fn check_and_trip(&self, status: &mut BudgetStatus) -> bool {
        let breaker = self.breaker(&status.campaign_id);

        if !breaker.allow(status) {
            status.circuit_breaker_on = true;
            return false;
        }

        true
    }

    pub fn reset(&self, campaign_id: &str) {
        let breaker = self
            .breakers
            .read()
            .expect("breaker map lock poisoned")
            .get(campaign_id)
            .cloned();

        if let Some(breaker) = breaker {
            breaker.reset();
        }
    }

    pub fn all_states(&self) -> HashMap<String, BreakerState> {
        self.breakers
            .read()
            .expect("breaker map lock poisoned")
            .iter()
            .map(|(id, breaker)| (id.clone(), breaker.state()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::budget::PacingMode;

    fn status(daily_budget: i64, daily_spent: i64) -> BudgetStatus {
        BudgetStatus {
            campaign_id: "c1".to_string(),
            daily_budget,
            daily_spent,
            hourly_budget: daily_budget / 24,
            hourly_spent: 0,
            remaining_hours: 12,
            current_hour: 12,
            pacing_mode: PacingMode::Even,
            throttle_rate: 0.0,
            circuit_breaker_on: false,
            degraded_mode: false,
        }
    }

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            budget_threshold: 0.95,
            max_failures: 3,
            timeout: Duration::from_millis(100),
            success_threshold: 2,
        }
    }

    #[test]
    fn test_allows_under_threshold() {
        let cb = CircuitBreaker::new(BreakerConfig::default());
        assert!(cb.allow(&status(10_000, 5_000)));
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn test_trips_at_budget_threshold() {
        let cb = CircuitBreaker::new(BreakerConfig::default());
        assert!(!cb.allow(&status(10_000, 9_510)));
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[test]
    fn test_trips_on_failure_burst() {
        let cb = CircuitBreaker::new(BreakerConfig::default());
        cb.record_failure("store write failed");
        cb.record_failure("store write failed");
        assert!(cb.allow(&status(10_000, 100)));

        cb.record_failure("store write failed");
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.allow(&status(10_000, 100)));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let cb = CircuitBreaker::new(BreakerConfig::default());
        cb.record_failure("x");
        cb.record_failure("x");
        cb.record_success();
        cb.record_failure("x");
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn test_recovery_cycle() {
        let cb = CircuitBreaker::new(fast_config());

        // Trip on budget, then bring spend back down.
        assert!(!cb.allow(&status(10_000, 9_600)));
        assert_eq!(cb.state(), BreakerState::Open);

        // Still open before the timeout.
        assert!(!cb.allow(&status(10_000, 9_000)));

        std::thread::sleep(Duration::from_millis(150));

        // First call after the timeout admits a probe.
        assert!(cb.allow(&status(10_000, 9_000)));
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new(fast_config());
        cb.allow(&status(10_000, 9_600));
        std::thread::sleep(Duration::from_millis(150));
        assert!(cb.allow(&status(10_000, 9_000)));
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        cb.record_failure("probe failed");
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[test]
    fn test_half_open_bounds_probes() {
        let cb = CircuitBreaker::new(fast_config());
        cb.allow(&status(10_000, 9_600));
        std::thread::sleep(Duration::from_millis(150));

        assert!(cb.allow(&status(10_000, 9_000)));
        cb.record_success();
        // One success recorded; one more probe allowed.
        assert!(cb.allow(&status(10_000, 9_000)));
    }

    #[test]
    fn test_reset_forces_closed() {
        let cb = CircuitBreaker::new(BreakerConfig::default());
        cb.allow(&status(10_000, 9_600));
        assert_eq!(cb.state(), BreakerState::Open);

        cb.reset();
        assert_eq!(cb.state(), BreakerState::Closed);
        let snap = cb.snapshot();
        assert_eq!(snap.failure_count, 0);
        assert_eq!(snap.success_count, 0);
    }

    #[test]
    fn test_manager_reuses_breakers() {
        let mgr = CircuitBreakerManager::new(BreakerConfig::default());
        let a = mgr.breaker("c1");
        let b = mgr.breaker("c1");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &mgr.breaker("c2")));
    }

    #[test]
    fn test_manager_check_and_trip_marks_status() {
        let mgr = CircuitBreakerManager::new(BreakerConfig::default());
        let mut s = status(10_000, 9_600);
        assert!(!mgr.check_and_trip(&mut s));
        assert!(s.circuit_breaker_on);
        assert_eq!(mgr.all_states().get("c1"), Some(&BreakerState::Open));

        mgr.reset("c1");
        assert_eq!(mgr.all_states().get("c1"), Some(&BreakerState::Closed));
    }
}
