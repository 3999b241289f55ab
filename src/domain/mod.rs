//! Core budget-pacing types and the ports implemented by adapters.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub mod breaker;
pub mod budget;
pub mod pacing;

pub use breaker::{
    BreakerConfig, BreakerSnapshot, BreakerState, CircuitBreaker, CircuitBreakerManager,
};
pub use budget::{BudgetStatus, Campaign, CampaignStatus, PacingMode};
pub use pacing::{algorithm_for, PacingAlgorithm};

/// Errors surfaced by a counter store adapter. Transport failures flip the
/// tracker into degraded mode; they never propagate to the bid exchange.
#[derive(Debug, Error)]
pub enum CounterStoreError {
    #[error("counter store timeout after {0:?}")]
    Timeout(Duration),

    #[error("counter store transport error: {0}")]
    Transport(String),

    #[error("counter store returned a non-integer value for {key}")]
    BadValue { key: String },
}

/// One mutation in a pipelined batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterOp {
    IncrBy {
        key: String,
        delta: i64,
        ttl: Duration,
    },
    Set {
        key: String,
        value: i64,
        ttl: Duration,
    },
}

/// Atomic integer counters with expiry, pipelined batches, and a liveness
/// probe. Every call carries its own deadline inside the adapter; callers
/// see either a value or a [`CounterStoreError`], never a hang.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn incr_by(
        &self,
        key: &str,
        delta: i64,
        ttl: Duration,
    ) -> Result<i64, CounterStoreError>;

    async fn get(&self, key: &str) -> Result<Option<i64>, CounterStoreError>;

    /// Pipelined read of several keys; the result vector is positionally
    /// aligned with `keys`.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<i64>>, CounterStoreError>;

    async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<(), CounterStoreError>;

    /// Apply a batch of mutations in one pipelined round trip.
    async fn apply(&self, ops: &[CounterOp]) -> Result<(), CounterStoreError>;

    async fn delete(&self, key: &str) -> Result<(), CounterStoreError>;

    /// Liveness probe, bounded by the adapter's probe timeout (≤ 1 s).
    async fn ping(&self) -> Result<(), CounterStoreError>;
}

/// Errors from the relational campaign/spend-log store.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error: {0}")]
    Connection(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid campaign row: {0}")]
    InvalidRow(String),
}

/// Read-only source of decisionable campaigns, refreshed periodically.
#[async_trait]
pub trait CampaignSource: Send + Sync {
    async fn load_active(&self) -> Result<Vec<Campaign>, RepositoryError>;
}
