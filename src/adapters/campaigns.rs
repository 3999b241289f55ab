//! Campaign registry and relational-store adapters.
//!
//! Campaigns are administered elsewhere; this side only reads the `ACTIVE`
//! set on a timer and appends to the spend log. Between refreshes the
//! in-memory registry is authoritative for decisioning.

use crate::domain::{Campaign, CampaignSource, CampaignStatus, PacingMode, RepositoryError};
use async_trait::async_trait;
use chrono_tz::Tz;
use sqlx::{AnyPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Open the shared `AnyPool` for campaigns and the spend log. Fails fast:
/// an unreachable relational store at startup is fatal.
pub async fn connect_database(url: &str, max_connections: u32) -> Result<AnyPool, RepositoryError> {
    sqlx::any::install_default_drivers();

    let pool = sqlx::any::AnyPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
        .map_err(|e| RepositoryError::Connection(e.to_string()))?;

    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .map_err(|e| RepositoryError::Connection(format!("ping failed: {}", e)))?;

    info!("connected to campaign database");
    Ok(pool)
}

pub struct SqlxCampaignSource {
    pool: AnyPool,
}

impl SqlxCampaignSource {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CampaignSource for SqlxCampaignSource {
    async fn load_active(&self) -> Result<Vec<Campaign>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, name, daily_budget_cents, pacing_mode, status \
             FROM campaigns WHERE status = 'ACTIVE'",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut campaigns = Vec::with_capacity(rows.len());
        for row in rows {
            match campaign_from_row(&row) {
                Ok(campaign) => campaigns.push(campaign),
                // One malformed row must not take down the whole refresh.
                Err(err) => error!(error = %err, "skipping invalid campaign row"),
            }
        }

        Ok(campaigns)
    }
}

fn campaign_from_row(row: &sqlx::any::AnyRow) -> Result<Campaign, RepositoryError> {
    let id: String = row.try_get("id")?;
    let name: String = row.try_get("name")?;
    let daily_budget_cents: i64 = row.try_get("daily_budget_cents")?;
    let pacing_mode: String = row.try_get("pacing_mode")?;
    let status: String = row.try_get("status")?;

    let pacing_mode: PacingMode = pacing_mode
        .parse()
        .map_err(RepositoryError::InvalidRow)?;
    let status: CampaignStatus = status.parse().map_err(RepositoryError::InvalidRow)?;

    if daily_budget_cents < 0 {
        return Err(RepositoryError::InvalidRow(format!(
            "campaign {} has negative daily budget",
            id
        )));
    }

    Ok(Campaign {
        id,
        name,
        daily_budget_cents,
        pacing_mode,
        status,
    })
}

/// In-memory view of the decisionable campaigns.
#[derive(Default)]
pub struct CampaignRegistry {
    campaigns: RwLock<HashMap<String, Campaign>>,
}

impl CampaignRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, campaign_id: &str) -> Option<Campaign> {
        self.campaigns.read().await.get(campaign_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.campaigns.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.campaigns.read().await.is_empty()
    }

    /// Replace the whole set with a fresh load.
    pub async fn replace_all(&self, campaigns: Vec<Campaign>) {
        let map: HashMap<String, Campaign> = campaigns
            .into_iter()
            .filter(|c| c.is_active())
            .map(|c| (c.id.clone(), c))
            .collect();
        *self.campaigns.write().await = map;
    }

    /// Daily budgets per campaign, fed to the tracker for degraded-mode
    /// synthesis.
    pub async fn budgets(&self) -> HashMap<String, i64> {
        self.campaigns
            .read()
            .await
            .values()
            .map(|c| (c.id.clone(), c.daily_budget_cents))
            .collect()
    }

    /// Load from `source` and swap the set in. Refresh failures keep the
    /// previous set.
    pub async fn refresh_from(&self, source: &dyn CampaignSource) -> Result<usize, RepositoryError> {
        let campaigns = source.load_active().await?;
        let count = campaigns.len();
        self.replace_all(campaigns).await;
        Ok(count)
    }
}

/// Append-only spend history writer. Fire-and-forget from the decision
/// core's point of view: failures are logged, never surfaced.
pub struct SpendLog {
    pool: AnyPool,
    tz: Tz,
}

impl SpendLog {
    pub fn new(pool: AnyPool, tz: Tz) -> Self {
        Self { pool, tz }
    }

    pub async fn record(&self, campaign_id: &str, amount_cents: i64, impressions: i64) {
        let now = chrono::Utc::now().with_timezone(&self.tz);
        let hour_bucket = now.format("%Y-%m-%d-%H").to_string();
        let day_bucket = now.format("%Y-%m-%d").to_string();

        let result = sqlx::query(
            "INSERT INTO spend_log (campaign_id, amount_cents, impressions, hour_bucket, day_bucket) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(campaign_id)
        .bind(amount_cents)
        .bind(impressions)
        .bind(hour_bucket)
        .bind(day_bucket)
        .execute(&self.pool)
        .await;

        if let Err(err) = result {
            warn!(campaign_id, error = %err, "failed to append to spend log");
        }
    }
}

/// Spawn the periodic campaign refresh: reloads the registry and pushes
/// budgets to `on_budgets` (the tracker's advisory map).
pub fn spawn_refresh_task(
    registry: Arc<CampaignRegistry>,
    source: Arc<dyn CampaignSource>,
    interval: std::time::Duration,
    on_budgets: impl Fn(HashMap<String, i64>) + Send + Sync + 'static,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately and re-validates the startup
        // load.
        loop {
            ticker.tick().await;
            match registry.refresh_from(source.as_ref()).await {
                Ok(count) => {
                    info!(campaigns = count, "campaign set refreshed");
                    on_budgets(registry.budgets().await);
                }
                Err(err) => error!(error = %err, "failed to refresh campaigns"),
            }
        }
    })
}
