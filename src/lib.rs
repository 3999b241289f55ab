//! # Pacer - Ad Budget Pacing Service
//!
//! Pacer sits in the hot path of a real-time bidding exchange and decides,
//! per bid opportunity, whether a campaign should participate and at what
//! maximum price, so that daily budgets are never materially exceeded and
//! spend follows the campaign's pacing strategy through the day.
//!
//! ## Architecture
//!
//! Pacer follows a hexagonal layout:
//! - **Domain**: budget types, the four pacing algorithms, the per-campaign
//!   circuit breaker, and the ports to the counter and relational stores
//! - **Application**: the decision engine composing tracker, breaker, and
//!   algorithm into one bid-gating use case
//! - **Adapters**: the Redis counter store (with an in-memory twin), the
//!   resilient budget tracker, the campaign registry and spend log, and the
//!   HTTP/metrics/health handlers
//! - **Config**: layered settings with CLI/env overrides and validation
//!
//! The tracker never fails the caller: when the counter store is
//! unreachable it serves from a process-local cache, throttles
//! conservatively, and writes the accumulated spend back once the store
//! recovers.

pub mod adapters;
pub mod application;
pub mod cli;
pub mod config;
pub mod domain;

use crate::adapters::health_handler::HealthHandler;
use crate::adapters::metrics_handler::MetricsHandler;
use crate::adapters::pacing_handler::{
    PacingDecisionRequest, PacingHandler, SpendTrackRequest,
};
use axum::extract::Path;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;

use crate::config::RateLimitConfig;

/// Assemble the Axum router with all endpoints configured.
pub fn create_app(
    pacing_handler: Arc<PacingHandler>,
    health_handler: Arc<HealthHandler>,
    metrics_handler: Arc<MetricsHandler>,
    rate_limit: Option<&RateLimitConfig>,
) -> Router {
    let mut router = Router::new()
        .route(
            "/pacing/decision",
            post({
                let handler = pacing_handler.clone();
                move |Json(req): Json<PacingDecisionRequest>| {
                    let h = handler.clone();
                    async move { h.decision(req).await }
                }
            }),
        )
        .route(
            "/spend/track",
            post({
                let handler = pacing_handler.clone();
                move |Json(req): Json<SpendTrackRequest>| {
                    let h = handler.clone();
                    async move { h.track(req).await }
                }
            }),
        )
        .route(
            "/budget/status/{campaign_id}",
            get({
                let handler = pacing_handler.clone();
                move |Path(campaign_id): Path<String>| {
                    let h = handler.clone();
                    async move { h.budget_status(campaign_id).await }
                }
            }),
        )
        .route(
            "/health",
            get({
                let handler = health_handler.clone();
                move || {
                    let h = handler.clone();
                    async move { h.health().await }
                }
            }),
        )
        .route(
            "/metrics",
            get({
                let handler = metrics_handler.clone();
                move || {
                    let h = handler.clone();
                    async move { h.metrics().await }
                }
            }),
        );

    // Apply the QPS guard if enabled (before the CORS layer)
    if let Some(config) = rate_limit {
        if config.enabled {
            let guard = crate::adapters::rate_limit::guard_from_config(config);
            router = router.layer(axum::middleware::from_fn_with_state(
                guard,
                crate::adapters::rate_limit::qps_middleware,
            ));
        }
    }

    router.layer(
        tower_http::cors::CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any),
    )
}
