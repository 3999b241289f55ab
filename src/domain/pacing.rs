//! Pacing algorithms.
//!
//! Each algorithm maps a [`BudgetStatus`] to a throttle rate in `[0, 1]` and
//! an admit/deny verdict, plus a per-bid price ceiling. Algorithms are pure:
//! the uniform draw used for probabilistic admission is passed in by the
//! caller, so identical inputs always produce identical outputs.

use crate::domain::budget::{BudgetStatus, PacingMode};

/// Hour-of-day traffic profile used by ADAPTIVE pacing. Peaks mid-morning
/// and early evening.
const ADAPTIVE_MULTIPLIERS: [f64; 24] = [
    0.3, 0.2, 0.2, 0.2, 0.3, 0.5, // 00-05
    0.8, 1.0, 1.2, 1.5, 1.8, 2.0, // 06-11
    1.8, 1.5, 1.3, 1.2, 1.1, 1.0, // 12-17
    1.6, 1.8, 1.5, 1.2, 0.8, 0.5, // 18-23
];

pub trait PacingAlgorithm: Send + Sync {
    /// Throttle rate in `[0, 1]` for the given status.
    fn calculate_throttle(&self, status: &BudgetStatus) -> f64;

    /// Admission verdict. `draw` is a uniform sample in `[0, 1)`; when the
    /// algorithm admits probabilistically it admits iff
    /// `draw > status.throttle_rate`.
    fn should_bid(&self, status: &BudgetStatus, draw: f64) -> bool;

    /// Per-bid ceiling: never more than the target bid, never more than 10%
    /// of the remaining daily budget, zero once the budget is gone.
    fn max_bid(&self, remaining: i64, target: i64) -> i64 {
        if remaining <= 0 {
            return 0;
        }
        (remaining / 10).min(target)
    }
}

/// Look up the algorithm for a pacing mode. Algorithms hold no per-call
/// state, so a single static instance serves all campaigns.
pub fn algorithm_for(mode: PacingMode) -> &'static dyn PacingAlgorithm {
    match mode {
        PacingMode::Even => &EvenPacing,
        PacingMode::Asap => &AsapPacing,
        PacingMode::FrontLoaded => &FrontLoadedPacing,
        PacingMode::Adaptive => &ADAPTIVE,
    }
}

/// Targets `daily_budget / 24` every hour of the day.
pub struct EvenPacing;

impl PacingAlgorithm for EvenPacing {
    fn calculate_throttle(&self, status: &BudgetStatus) -> f64 {
        if status.circuit_breaker_on {
            return 1.0;
        }

        let target = status.daily_budget as f64 / 24.0;
        let actual = status.hourly_spent as f64;
        if actual == 0.0 {
            return 0.0;
        }

        ((actual - target) / target).clamp(0.0, 1.0)
    }

    fn should_bid(&self, status: &BudgetStatus, draw: f64) -> bool {
        if status.circuit_breaker_on {
            return false;
        }
        if status.remaining_budget() <= 0 {
            return false;
        }

        let target_hourly = status.daily_budget / 24;
        if status.hourly_spent >= target_hourly {
            return draw > status.throttle_rate;
        }

        true
    }
}

/// Spends as fast as possible, stepping up the throttle only near
/// exhaustion.
pub struct AsapPacing;

impl PacingAlgorithm for AsapPacing {
    fn calculate_throttle(&self, status: &BudgetStatus) -> f64 {
        if status.circuit_breaker_on {
            return 1.0;
        }

        let spent = status.spend_fraction();
        if spent >= 0.95 {
            0.9
        } else if spent >= 0.9 {
            0.5
        } else if spent >= 0.8 {
            0.2
        } else {
            0.0
        }
    }

    fn should_bid(&self, status: &BudgetStatus, draw: f64) -> bool {
        if status.circuit_breaker_on {
            return false;
        }
        if status.remaining_budget() <= 0 {
            return false;
        }

        if status.throttle_rate > 0.0 {
            return draw > status.throttle_rate;
        }

        true
    }
}

/// Spends 70% of the budget in hours 0-11 and 30% in hours 12-23.
pub struct FrontLoadedPacing;

impl PacingAlgorithm for FrontLoadedPacing {
    fn calculate_throttle(&self, status: &BudgetStatus) -> f64 {
        if status.circuit_breaker_on {
            return 1.0;
        }

        let target = if status.current_hour < 12 {
            status.daily_budget as f64 * 0.7 / 12.0
        } else {
            status.daily_budget as f64 * 0.3 / 12.0
        };

        let actual = status.hourly_spent as f64;
        if actual <= target {
            return 0.0;
        }

        ((actual - target) / target).min(1.0)
    }

    fn should_bid(&self, status: &BudgetStatus, draw: f64) -> bool {
        if status.circuit_breaker_on {
            return false;
        }
        if status.remaining_budget() <= 0 {
            return false;
        }

        if status.throttle_rate > 0.8 {
            false
        } else if status.throttle_rate > 0.0 {
            draw > status.throttle_rate
        } else {
            true
        }
    }
}

/// Shapes hourly targets by an hour-of-day traffic profile and throttles at
/// half the overspend ratio, tolerating bursts into busy hours.
pub struct AdaptivePacing {
    multipliers: [f64; 24],
}

static ADAPTIVE: AdaptivePacing = AdaptivePacing {
    multipliers: ADAPTIVE_MULTIPLIERS,
};

impl AdaptivePacing {
    fn multiplier(&self, hour: u32) -> f64 {
        self.multipliers
            .get(hour as usize)
            .copied()
            .unwrap_or(1.0)
    }
}

impl PacingAlgorithm for AdaptivePacing {
    fn calculate_throttle(&self, status: &BudgetStatus) -> f64 {
        if status.circuit_breaker_on {
            return 1.0;
        }

        let target =
            status.daily_budget as f64 / 24.0 * self.multiplier(status.current_hour);
        let actual = status.hourly_spent as f64;
        if actual <= target {
            return 0.0;
        }

        ((actual - target) / target * 0.5).min(1.0)
    }

    fn should_bid(&self, status: &BudgetStatus, draw: f64) -> bool {
        if status.circuit_breaker_on {
            return false;
        }
        if status.remaining_budget() <= 0 {
            return false;
        }

        if status.throttle_rate > 0.9 {
            false
        } else if status.throttle_rate > 0.0 {
            draw > status.throttle_rate
        } else {
            true
        }
    }
}
