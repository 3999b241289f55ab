//! HTTP surface of the decision core: bid gating, spend reporting, and the
//! per-campaign budget status view.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

use crate::adapters::metrics_handler::MetricsCollector;
use crate::application::decision::{DecisionEngine, DecisionReason, PacingDecision};

#[derive(Debug, Deserialize)]
pub struct PacingDecisionRequest {
    pub campaign_id: String,
    pub bid_cents: i64,
}

#[derive(Debug, Deserialize)]
pub struct SpendTrackRequest {
    pub campaign_id: String,
    pub spend_cents: i64,
    #[serde(default)]
    pub impressions: i64,
}

#[derive(Debug, Serialize)]
pub struct SpendTrackResponse {
    pub status: String,
}

pub struct PacingHandler {
    engine: Arc<DecisionEngine>,
    metrics: Arc<MetricsCollector>,
}

impl PacingHandler {
    pub fn new(engine: Arc<DecisionEngine>, metrics: Arc<MetricsCollector>) -> Self {
        Self { engine, metrics }
    }

    /// `POST /pacing/decision`
    pub async fn decision(&self, req: PacingDecisionRequest) -> impl IntoResponse {
        let start = Instant::now();
        let outcome = self.engine.decide(&req.campaign_id, req.bid_cents).await;

        // The bid hot path keeps the per-campaign gauges current.
        if let Some(status) = &outcome.status {
            self.metrics
                .budget_utilization
                .with_label_values(&[req.campaign_id.as_str()])
                .set(status.spend_percentage());
            self.metrics
                .degraded_mode
                .set(if status.degraded_mode { 1.0 } else { 0.0 });
        }

        self.record_decision_metrics(&outcome.decision);
        self.metrics
            .request_duration
            .with_label_values(&["/pacing/decision", "POST"])
            .observe(start.elapsed().as_secs_f64());
        self.metrics
            .requests_total
            .with_label_values(&["/pacing/decision", "POST", "200"])
            .inc();

        (StatusCode::OK, Json(outcome.decision))
    }

    /// `POST /spend/track`. Never errors toward the exchange; a timeout
    /// retried by the caller may double-count.
    pub async fn track(&self, req: SpendTrackRequest) -> impl IntoResponse {
        let start = Instant::now();
        self.engine
            .record_spend(&req.campaign_id, req.spend_cents, req.impressions)
            .await;

        if req.spend_cents > 0 {
            self.metrics.spend_tracked_cents.inc_by(req.spend_cents as f64);
        }
        self.metrics
            .request_duration
            .with_label_values(&["/spend/track", "POST"])
            .observe(start.elapsed().as_secs_f64());
        self.metrics
            .requests_total
            .with_label_values(&["/spend/track", "POST", "200"])
            .inc();

        (
            StatusCode::OK,
            Json(SpendTrackResponse {
                status: "success".to_string(),
            }),
        )
    }

    /// `GET /budget/status/{campaign_id}`
    pub async fn budget_status(&self, campaign_id: String) -> impl IntoResponse {
        match self.engine.budget_report(&campaign_id).await {
            Some(report) => {
                self.metrics
                    .budget_utilization
                    .with_label_values(&[campaign_id.as_str()])
                    .set(report.pace_percentage);
                self.metrics
                    .circuit_breaker_state
                    .with_label_values(&[campaign_id.as_str()])
                    .set(report.circuit_breaker.state.as_gauge());
                self.metrics
                    .degraded_mode
                    .set(if report.degraded_mode { 1.0 } else { 0.0 });

                (StatusCode::OK, Json(serde_json::to_value(report).unwrap_or_default()))
            }
            None => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "campaign not found" })),
            ),
        }
    }

    fn record_decision_metrics(&self, decision: &PacingDecision) {
        let reason = match decision.reason {
            DecisionReason::WithinBudget => "within_budget",
            DecisionReason::Throttled => "throttled",
            DecisionReason::CircuitBreaker => "circuit_breaker",
            DecisionReason::BudgetExhausted => "budget_exhausted",
            DecisionReason::CampaignNotFound => "campaign_not_found",
        };
        self.metrics.decisions_total.with_label_values(&[reason]).inc();
    }
}
