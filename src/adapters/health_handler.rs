use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::adapters::tracker::{ResilientBudgetTracker, TrackerHealth};

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub tracker: TrackerHealth,
}

pub struct HealthHandler {
    tracker: Arc<ResilientBudgetTracker>,
    start_time: std::time::Instant,
}

impl HealthHandler {
    pub fn new(tracker: Arc<ResilientBudgetTracker>) -> Self {
        Self {
            tracker,
            start_time: std::time::Instant::now(),
        }
    }

    /// Overall health. The service keeps serving in degraded mode, so this
    /// stays 200; the detail tells operators which half is limping.
    pub async fn health(&self) -> impl IntoResponse {
        let tracker = self.tracker.health().await;
        let status = HealthStatus {
            status: if tracker.degraded_mode {
                "degraded".to_string()
            } else {
                "healthy".to_string()
            },
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            tracker,
        };

        (StatusCode::OK, Json(status))
    }
}
