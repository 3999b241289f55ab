//! The decision engine: composes the campaign registry, the budget
//! tracker, the per-campaign circuit breakers, and the pacing algorithms
//! into a single bid-gating use case.

use crate::adapters::campaigns::{CampaignRegistry, SpendLog};
use crate::adapters::tracker::ResilientBudgetTracker;
use crate::domain::{
    algorithm_for, BreakerSnapshot, BudgetStatus, CircuitBreakerManager,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    WithinBudget,
    Throttled,
    CircuitBreaker,
    BudgetExhausted,
    CampaignNotFound,
}

/// Outcome of one bid-opportunity evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacingDecision {
    pub allow_bid: bool,
    pub max_bid_cents: i64,
    pub throttle_rate: f64,
    pub reason: DecisionReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl PacingDecision {
    fn refusal(reason: DecisionReason) -> Self {
        Self {
            allow_bid: false,
            max_bid_cents: 0,
            throttle_rate: 0.0,
            reason,
            warning: None,
        }
    }
}

/// A decision together with the status snapshot it was computed from, so
/// the HTTP layer can record per-campaign gauges without a second tracker
/// read. `status` is `None` when the campaign is unknown.
#[derive(Debug, Clone)]
pub struct DecisionOutcome {
    pub decision: PacingDecision,
    pub status: Option<BudgetStatus>,
}

/// Full budget view for the status endpoint: the tracker snapshot plus the
/// breaker's current state.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetReport {
    pub campaign_id: String,
    pub daily_budget_cents: i64,
    pub daily_spent_cents: i64,
    pub hourly_spent_cents: i64,
    pub pace_percentage: f64,
    pub should_throttle: bool,
    pub throttle_rate: f64,
    pub degraded_mode: bool,
    pub circuit_breaker_open: bool,
    pub circuit_breaker: BreakerSnapshot,
}

pub struct DecisionEngine {
    campaigns: Arc<CampaignRegistry>,
    tracker: Arc<ResilientBudgetTracker>,
    breakers: Arc<CircuitBreakerManager>,
    spend_log: Option<Arc<SpendLog>>,
}

impl DecisionEngine {
    pub fn new(
        campaigns: Arc<CampaignRegistry>,
        tracker: Arc<ResilientBudgetTracker>,
        breakers: Arc<CircuitBreakerManager>,
        spend_log: Option<Arc<SpendLog>>,
    ) -> Self {
        Self {
            campaigns,
            tracker,
            breakers,
            spend_log,
        }
    }

    /// Evaluate one bid opportunity.
    pub async fn decide(&self, campaign_id: &str, bid_cents: i64) -> DecisionOutcome {
        let Some(campaign) = self.campaigns.get(campaign_id).await else {
            return DecisionOutcome {
                decision: PacingDecision::refusal(DecisionReason::CampaignNotFound),
                status: None,
            };
        };

        let mut status = self
            .tracker
            .get_budget_status(campaign_id, campaign.daily_budget_cents)
            .await;
        status.pacing_mode = campaign.pacing_mode;

        if !self.breakers.check_and_trip(&mut status) {
            let mut decision = PacingDecision::refusal(DecisionReason::CircuitBreaker);
            decision.throttle_rate = 1.0;
            decision.warning = degraded_warning(&status);
            return DecisionOutcome {
                decision,
                status: Some(status),
            };
        }

        let decision = self.run_algorithm(&status, bid_cents, rand::thread_rng().gen());
        DecisionOutcome {
            decision,
            status: Some(status),
        }
    }

    /// Pure tail of the decision: everything after the tracker and breaker
    /// have spoken. Split out so tests can pin the admission draw.
    fn run_algorithm(&self, status: &BudgetStatus, bid_cents: i64, draw: f64) -> PacingDecision {
        let algorithm = algorithm_for(status.pacing_mode);

        let mut status = status.clone();
        let mut throttle = algorithm.calculate_throttle(&status);
        if status.degraded_mode {
            // The tracker's conservative floor can only be raised, never
            // lowered, by the algorithm.
            throttle = throttle.max(status.throttle_rate);
        }
        status.throttle_rate = throttle;

        let mut should_bid = algorithm.should_bid(&status, draw);

        let remaining = status.remaining_budget();
        let max_bid = algorithm.max_bid(remaining, bid_cents);
        if should_bid && max_bid < bid_cents {
            // The ceiling caps the price rather than vetoing the bid, as
            // long as something can still be spent.
            should_bid = max_bid > 0;
        }

        let reason = if should_bid {
            DecisionReason::WithinBudget
        } else if status.circuit_breaker_on {
            DecisionReason::CircuitBreaker
        } else if remaining <= 0 {
            DecisionReason::BudgetExhausted
        } else {
            DecisionReason::Throttled
        };

        debug!(
            campaign_id = %status.campaign_id,
            allow = should_bid,
            throttle = throttle,
            ?reason,
            "pacing decision"
        );

        PacingDecision {
            allow_bid: should_bid,
            max_bid_cents: max_bid,
            throttle_rate: throttle,
            reason,
            warning: degraded_warning(&status),
        }
    }

    /// Handle a spend report from the exchange. Never fails: the tracker
    /// absorbs store trouble and the spend-log write is fire-and-forget.
    pub async fn record_spend(&self, campaign_id: &str, spend_cents: i64, impressions: i64) {
        self.tracker.track_spend(campaign_id, spend_cents).await;
        self.breakers.breaker(campaign_id).record_success();

        if let Some(spend_log) = &self.spend_log {
            let spend_log = spend_log.clone();
            let campaign_id = campaign_id.to_string();
            tokio::spawn(async move {
                spend_log.record(&campaign_id, spend_cents, impressions).await;
            });
        }
    }

    /// Budget + breaker view for `GET /budget/status/{campaign_id}`.
    /// `None` when the campaign is unknown.
    pub async fn budget_report(&self, campaign_id: &str) -> Option<BudgetReport> {
        let campaign = self.campaigns.get(campaign_id).await?;

        let status = self
            .tracker
            .get_budget_status(campaign_id, campaign.daily_budget_cents)
            .await;
        let breaker = self.breakers.breaker(campaign_id).snapshot();

        Some(BudgetReport {
            campaign_id: campaign_id.to_string(),
            daily_budget_cents: campaign.daily_budget_cents,
            daily_spent_cents: status.daily_spent,
            hourly_spent_cents: status.hourly_spent,
            pace_percentage: status.spend_percentage(),
            should_throttle: status.throttle_rate > 0.0,
            throttle_rate: status.throttle_rate,
            degraded_mode: status.degraded_mode,
            circuit_breaker_open: breaker.state == crate::domain::BreakerState::Open,
            circuit_breaker: breaker,
        })
    }
}

fn degraded_warning(status: &BudgetStatus) -> Option<String> {
    status.degraded_mode.then(|| "degraded".to_string())
}
