use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Spend-shaping strategy for a campaign's day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PacingMode {
    #[default]
    Even,
    Asap,
    FrontLoaded,
    Adaptive,
}

impl fmt::Display for PacingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PacingMode::Even => "EVEN",
            PacingMode::Asap => "ASAP",
            PacingMode::FrontLoaded => "FRONT_LOADED",
            PacingMode::Adaptive => "ADAPTIVE",
        };
        f.write_str(s)
    }
}

impl FromStr for PacingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EVEN" => Ok(PacingMode::Even),
            "ASAP" => Ok(PacingMode::Asap),
            "FRONT_LOADED" => Ok(PacingMode::FrontLoaded),
            "ADAPTIVE" => Ok(PacingMode::Adaptive),
            other => Err(format!("unknown pacing mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CampaignStatus {
    Active,
    Paused,
    Completed,
}

impl FromStr for CampaignStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(CampaignStatus::Active),
            "PAUSED" => Ok(CampaignStatus::Paused),
            "COMPLETED" => Ok(CampaignStatus::Completed),
            other => Err(format!("unknown campaign status: {}", other)),
        }
    }
}

/// A campaign as read from the relational store. Read-only to the core;
/// only `ACTIVE` campaigns are decisioned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub name: String,
    pub daily_budget_cents: i64,
    pub pacing_mode: PacingMode,
    pub status: CampaignStatus,
}

impl Campaign {
    pub fn is_active(&self) -> bool {
        self.status == CampaignStatus::Active
    }
}

/// Request-scoped snapshot of a campaign's budget consumption, produced by
/// the tracker and consumed by the breaker and the pacing algorithms.
///
/// All monetary fields are in cents. `throttle_rate` starts out as the
/// tracker's conservative floor (0 on the healthy path) and is replaced by
/// the decision engine with the effective rate before any admission draw.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub campaign_id: String,
    pub daily_budget: i64,
    pub daily_spent: i64,
    pub hourly_budget: i64,
    pub hourly_spent: i64,
    pub remaining_hours: u32,
    pub current_hour: u32,
    pub pacing_mode: PacingMode,
    pub throttle_rate: f64,
    pub circuit_breaker_on: bool,
    /// True when the snapshot was synthesized from the in-process cache
    /// because the counter store was unreachable.
    pub degraded_mode: bool,
}

impl BudgetStatus {
    /// Fraction of the daily budget consumed, in `[0, ..)`. A zero budget
    /// reports zero; exhaustion of a zero budget is caught by the
    /// remaining-budget check instead.
    pub fn spend_fraction(&self) -> f64 {
        if self.daily_budget == 0 {
            return 0.0;
        }
        self.daily_spent as f64 / self.daily_budget as f64
    }

    pub fn spend_percentage(&self) -> f64 {
        self.spend_fraction() * 100.0
    }

    pub fn remaining_budget(&self) -> i64 {
        self.daily_budget - self.daily_spent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pacing_mode_round_trip() {
        for mode in [
            PacingMode::Even,
            PacingMode::Asap,
            PacingMode::FrontLoaded,
            PacingMode::Adaptive,
        ] {
            assert_eq!(mode.to_string().parse::<PacingMode>().unwrap(), mode);
        }
        assert!("TURBO".parse::<PacingMode>().is_err());
    }

    #[test]
    fn test_pacing_mode_json_names() {
        assert_eq!(
            serde_json::to_string(&PacingMode::FrontLoaded).unwrap(),
            "\"FRONT_LOADED\""
        );
        let mode: PacingMode = serde_json::from_str("\"ASAP\"").unwrap();
        assert_eq!(mode, PacingMode::Asap);
    }

    #[test]
    fn test_spend_fraction() {
        let status = BudgetStatus {
            campaign_id: "c1".to_string(),
            daily_budget: 10_000,
            daily_spent: 5_000,
            hourly_budget: 416,
            hourly_spent: 300,
            remaining_hours: 12,
            current_hour: 12,
            pacing_mode: PacingMode::Even,
            throttle_rate: 0.0,
            circuit_breaker_on: false,
            degraded_mode: false,
        };
        assert_eq!(status.spend_fraction(), 0.5);
        assert_eq!(status.spend_percentage(), 50.0);
        assert_eq!(status.remaining_budget(), 5_000);
    }

    #[test]
    fn test_spend_fraction_zero_budget() {
        let status = BudgetStatus {
            campaign_id: "c1".to_string(),
            daily_budget: 0,
            daily_spent: 0,
            hourly_budget: 0,
            hourly_spent: 0,
            remaining_hours: 24,
            current_hour: 0,
            pacing_mode: PacingMode::Even,
            throttle_rate: 0.0,
            circuit_breaker_on: false,
            degraded_mode: false,
        };
        assert_eq!(status.spend_fraction(), 0.0);
        assert!(status.remaining_budget() <= 0);
    }
}
