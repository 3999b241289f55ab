//! Resilient budget tracker.
//!
//! Records spend and answers "how much has this campaign spent today / this
//! hour". The healthy path reads and writes the shared counter store; a
//! process-local cache mirrors every write and takes over when the store is
//! unreachable, so the caller never fails. Spend accumulated during an
//! outage is parked in a recovery queue and written back (as absolute
//! values) once the store is reachable again.
//!
//! Counter key schema, with TTLs slightly wider than the bucket so a key
//! touched at the start of a bucket stays readable to its end:
//!
//! ```text
//! budget:day:<campaign_id>:YYYY-MM-DD      TTL 25h
//! budget:hour:<campaign_id>:YYYY-MM-DD-HH  TTL 2h
//! budget:total:<campaign_id>               TTL 30d
//! ```

use crate::config::TrackerSettings;
use crate::domain::{BudgetStatus, CounterOp, CounterStore, CounterStoreError, PacingMode};
use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, info, warn};

const DAY_TTL: Duration = Duration::from_secs(25 * 60 * 60);
const HOUR_TTL: Duration = Duration::from_secs(2 * 60 * 60);
const TOTAL_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Conservative throttle floors applied to statuses synthesized from the
/// local cache. The engine only ever raises these.
const DEGRADED_THROTTLE: f64 = 0.5;
const BLIND_THROTTLE: f64 = 0.7;

/// Per-campaign in-process spend counters. The hourly counter is valid only
/// for `current_hour`; crossing an hour boundary resets it before the next
/// add.
#[derive(Debug, Clone)]
pub struct MemoryBudget {
    pub daily_spent: i64,
    pub hourly_spent: i64,
    pub current_hour: u32,
    pub last_update: DateTime<Utc>,
}

/// Health detail exposed on `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct TrackerHealth {
    pub store_healthy: bool,
    pub degraded_mode: bool,
    pub memory_cache_size: usize,
    pub recovery_queue_size: usize,
}

/// One queued write for the spend worker pool: the per-campaign deltas of a
/// single `track_spend` or `batch_track_spend` call.
struct SpendWrite {
    entries: Vec<(String, i64)>,
    at: DateTime<Tz>,
}

pub struct ResilientBudgetTracker {
    store: Arc<dyn CounterStore>,
    tz: Tz,

    /// Fallback counters, mirroring every accepted spend report.
    cache: RwLock<HashMap<String, MemoryBudget>>,
    /// Read-through cache of healthy-path statuses.
    status_cache: RwLock<HashMap<String, (BudgetStatus, Instant)>>,
    status_cache_ttl: Duration,
    /// Advisory daily budgets used to synthesize a status when the caller
    /// has none (fed by the campaign refresh task).
    known_budgets: RwLock<HashMap<String, i64>>,
    /// Spend accumulated while the store was unreachable, pending
    /// write-back. Guarded separately from `cache` so the drain never
    /// contends with decisioning.
    recovery_queue: Mutex<HashMap<String, MemoryBudget>>,

    store_healthy: AtomicBool,
    degraded: AtomicBool,

    spend_tx: mpsc::Sender<SpendWrite>,
    recover_now: Arc<Notify>,
    probe_interval: Duration,
    recovery_interval: Duration,
}

impl ResilientBudgetTracker {
    /// Build the tracker and spawn its background machinery: the spend
    /// worker pool, the store health prober, and the recovery drainer.
    /// Must be called from within a tokio runtime.
    pub fn new(
        store: Arc<dyn CounterStore>,
        settings: &TrackerSettings,
        tz: Tz,
        probe_interval: Duration,
    ) -> Arc<Self> {
        let (spend_tx, spend_rx) = mpsc::channel(settings.spend_queue_capacity);

        let tracker = Arc::new(Self {
            store,
            tz,
            cache: RwLock::new(HashMap::new()),
            status_cache: RwLock::new(HashMap::new()),
            status_cache_ttl: Duration::from_millis(settings.status_cache_ttl_ms),
            known_budgets: RwLock::new(HashMap::new()),
            recovery_queue: Mutex::new(HashMap::new()),
            store_healthy: AtomicBool::new(true),
            degraded: AtomicBool::new(false),
            spend_tx,
            recover_now: Arc::new(Notify::new()),
            probe_interval,
            recovery_interval: Duration::from_secs(settings.recovery_interval_secs),
        });

        let spend_rx = Arc::new(tokio::sync::Mutex::new(spend_rx));
        for _ in 0..settings.spend_workers.max(1) {
            tokio::spawn(Self::spend_worker(
                Arc::downgrade(&tracker),
                spend_rx.clone(),
            ));
        }
        tokio::spawn(Self::health_probe_loop(Arc::downgrade(&tracker)));
        tokio::spawn(Self::recovery_loop(Arc::downgrade(&tracker)));

        tracker
    }

    fn now(&self) -> DateTime<Tz> {
        Utc::now().with_timezone(&self.tz)
    }

    fn day_key(campaign_id: &str, at: &DateTime<Tz>) -> String {
        format!("budget:day:{}:{}", campaign_id, at.format("%Y-%m-%d"))
    }

    fn hour_key(campaign_id: &str, at: &DateTime<Tz>) -> String {
        format!("budget:hour:{}:{}", campaign_id, at.format("%Y-%m-%d-%H"))
    }

    fn total_key(campaign_id: &str) -> String {
        format!("budget:total:{}", campaign_id)
    }

    /// Record spend for a campaign. Never fails: the in-memory update is
    /// synchronous and the counter-store write happens on the worker pool.
    pub async fn track_spend(&self, campaign_id: &str, amount: i64) {
        self.track_spend_at(campaign_id, amount, self.now()).await;
    }

    /// Clock-explicit variant of [`track_spend`](Self::track_spend); the
    /// wall clock is read once per request and reused so a decision cannot
    /// straddle a bucket boundary.
    pub async fn track_spend_at(&self, campaign_id: &str, amount: i64, at: DateTime<Tz>) {
        if amount <= 0 {
            warn!(campaign_id, amount, "ignoring non-positive spend amount");
            return;
        }

        self.update_memory(campaign_id, amount, &at).await;
        self.status_cache.write().await.remove(campaign_id);

        let write = SpendWrite {
            entries: vec![(campaign_id.to_string(), amount)],
            at,
        };
        if self.spend_tx.try_send(write).is_err() {
            // Backpressure: the store is not keeping up. Degrade rather
            // than queue without bound; the recovery drain owns write-back.
            warn!(campaign_id, "spend write queue full, entering degraded mode");
            self.degraded.store(true, Ordering::SeqCst);
            self.queue_for_recovery(&[campaign_id.to_string()]).await;
        }
    }

    /// Record spend for several campaigns in one counter-store round trip.
    pub async fn batch_track_spend(&self, spends: &HashMap<String, i64>) {
        let at = self.now();
        let mut entries = Vec::with_capacity(spends.len());

        for (campaign_id, amount) in spends {
            if *amount <= 0 {
                warn!(
                    campaign_id = %campaign_id,
                    amount = *amount,
                    "ignoring non-positive spend amount"
                );
                continue;
            }
            self.update_memory(campaign_id, *amount, &at).await;
            self.status_cache.write().await.remove(campaign_id);
            entries.push((campaign_id.clone(), *amount));
        }

        if entries.is_empty() {
            return;
        }

        let ids: Vec<String> = entries.iter().map(|(id, _)| id.clone()).collect();
        if self.spend_tx.try_send(SpendWrite { entries, at }).is_err() {
            warn!("spend write queue full, entering degraded mode");
            self.degraded.store(true, Ordering::SeqCst);
            self.queue_for_recovery(&ids).await;
        }
    }

    /// Budget status for one campaign: from the store when healthy, from
    /// the local cache (flagged `degraded_mode`) otherwise.
    pub async fn get_budget_status(&self, campaign_id: &str, daily_budget: i64) -> BudgetStatus {
        self.status_at(campaign_id, daily_budget, self.now()).await
    }

    pub async fn status_at(
        &self,
        campaign_id: &str,
        daily_budget: i64,
        at: DateTime<Tz>,
    ) -> BudgetStatus {
        if let Some(status) = self.cached_status(campaign_id).await {
            return status;
        }

        if self.store_healthy.load(Ordering::SeqCst) {
            match self.status_from_store(campaign_id, daily_budget, &at).await {
                Ok(status) => {
                    self.sync_to_memory(campaign_id, &status).await;
                    self.status_cache
                        .write()
                        .await
                        .insert(campaign_id.to_string(), (status.clone(), Instant::now()));
                    return status;
                }
                Err(err) => self.mark_store_failure(&err),
            }
        }

        self.status_from_memory(campaign_id, daily_budget, &at).await
    }

    /// Healthy-path bulk read: one pipelined round trip for many
    /// campaigns. Falls back per-campaign to the local cache when the
    /// store is unreachable.
    pub async fn get_multiple_statuses(
        &self,
        budgets: &HashMap<String, i64>,
    ) -> HashMap<String, BudgetStatus> {
        let at = self.now();

        if self.store_healthy.load(Ordering::SeqCst) {
            let ids: Vec<&String> = budgets.keys().collect();
            let mut keys = Vec::with_capacity(ids.len() * 2);
            for id in &ids {
                keys.push(Self::day_key(id, &at));
                keys.push(Self::hour_key(id, &at));
            }

            match self.store.get_many(&keys).await {
                Ok(values) => {
                    let mut statuses = HashMap::with_capacity(ids.len());
                    for (i, id) in ids.iter().enumerate() {
                        let daily_spent = values.get(i * 2).copied().flatten().unwrap_or(0);
                        let hourly_spent = values.get(i * 2 + 1).copied().flatten().unwrap_or(0);
                        let status =
                            Self::build_status(id, budgets[*id], daily_spent, hourly_spent, &at);
                        self.sync_to_memory(id, &status).await;
                        statuses.insert((*id).clone(), status);
                    }
                    return statuses;
                }
                Err(err) => self.mark_store_failure(&err),
            }
        }

        let mut statuses = HashMap::with_capacity(budgets.len());
        for (id, budget) in budgets {
            statuses.insert(id.clone(), self.status_from_memory(id, *budget, &at).await);
        }
        statuses
    }

    /// Delete the day counter and drop cached state for the campaign.
    pub async fn reset_daily_budget(&self, campaign_id: &str) -> Result<(), CounterStoreError> {
        let at = self.now();
        self.store.delete(&Self::day_key(campaign_id, &at)).await?;

        self.cache.write().await.remove(campaign_id);
        self.status_cache.write().await.remove(campaign_id);
        Ok(())
    }

    /// Advisory budgets for degraded-mode synthesis when a caller cannot
    /// supply one.
    pub async fn set_campaign_budgets(&self, budgets: HashMap<String, i64>) {
        *self.known_budgets.write().await = budgets;
    }

    pub fn is_healthy(&self) -> bool {
        !self.degraded.load(Ordering::SeqCst)
    }

    pub async fn health(&self) -> TrackerHealth {
        TrackerHealth {
            store_healthy: self.store_healthy.load(Ordering::SeqCst),
            degraded_mode: self.degraded.load(Ordering::SeqCst),
            memory_cache_size: self.cache.read().await.len(),
            recovery_queue_size: self
                .recovery_queue
                .lock()
                .expect("recovery queue lock poisoned")
                .len(),
        }
    }

    async fn cached_status(&self, campaign_id: &str) -> Option<BudgetStatus> {
        let cache = self.status_cache.read().await;
        let (status, fetched_at) = cache.get(campaign_id)?;
        if fetched_at.elapsed() < self.status_cache_ttl {
            Some(status.clone())
        } else {
            None
        }
    }

    async fn status_from_store(
        &self,
        campaign_id: &str,
        daily_budget: i64,
        at: &DateTime<Tz>,
    ) -> Result<BudgetStatus, CounterStoreError> {
        let keys = vec![Self::day_key(campaign_id, at), Self::hour_key(campaign_id, at)];
        let values = self.store.get_many(&keys).await?;

        let daily_spent = values.first().copied().flatten().unwrap_or(0);
        let hourly_spent = values.get(1).copied().flatten().unwrap_or(0);

        Ok(Self::build_status(
            campaign_id,
            daily_budget,
            daily_spent,
            hourly_spent,
            at,
        ))
    }

    fn build_status(
        campaign_id: &str,
        daily_budget: i64,
        daily_spent: i64,
        hourly_spent: i64,
        at: &DateTime<Tz>,
    ) -> BudgetStatus {
        BudgetStatus {
            campaign_id: campaign_id.to_string(),
            daily_budget,
            daily_spent,
            hourly_budget: daily_budget / 24,
            hourly_spent,
            remaining_hours: 24 - at.hour(),
            current_hour: at.hour(),
            pacing_mode: PacingMode::Even,
            throttle_rate: 0.0,
            circuit_breaker_on: false,
            degraded_mode: false,
        }
    }

    async fn status_from_memory(
        &self,
        campaign_id: &str,
        daily_budget: i64,
        at: &DateTime<Tz>,
    ) -> BudgetStatus {
        let hour = at.hour();

        if let Some(budget) = self.cache.read().await.get(campaign_id) {
            // The stored hourly counter only counts if it belongs to the
            // current hour.
            let hourly_spent = if budget.current_hour == hour {
                budget.hourly_spent
            } else {
                0
            };

            let mut status =
                Self::build_status(campaign_id, daily_budget, budget.daily_spent, hourly_spent, at);
            status.throttle_rate = DEGRADED_THROTTLE;
            status.degraded_mode = true;
            return status;
        }

        // No local data at all: assume the campaign spent proportionally to
        // the elapsed day and throttle hard.
        let daily_budget = if daily_budget > 0 {
            daily_budget
        } else {
            self.known_budgets
                .read()
                .await
                .get(campaign_id)
                .copied()
                .unwrap_or(0)
        };
        let assumed_spent = daily_budget * i64::from(hour) / 24;

        let mut status = Self::build_status(campaign_id, daily_budget, assumed_spent, 0, at);
        status.throttle_rate = BLIND_THROTTLE;
        status.degraded_mode = true;
        status
    }

    async fn update_memory(&self, campaign_id: &str, amount: i64, at: &DateTime<Tz>) {
        let hour = at.hour();
        let snapshot = {
            let mut cache = self.cache.write().await;
            let budget = cache.entry(campaign_id.to_string()).or_insert(MemoryBudget {
                daily_spent: 0,
                hourly_spent: 0,
                current_hour: hour,
                last_update: at.with_timezone(&Utc),
            });

            if budget.current_hour != hour {
                budget.hourly_spent = 0;
                budget.current_hour = hour;
            }

            budget.daily_spent += amount;
            budget.hourly_spent += amount;
            budget.last_update = at.with_timezone(&Utc);

            if self.degraded.load(Ordering::SeqCst) {
                Some(budget.clone())
            } else {
                None
            }
        };

        if let Some(snapshot) = snapshot {
            self.recovery_queue
                .lock()
                .expect("recovery queue lock poisoned")
                .insert(campaign_id.to_string(), snapshot);
        }
    }

    async fn sync_to_memory(&self, campaign_id: &str, status: &BudgetStatus) {
        let mut cache = self.cache.write().await;
        cache.insert(
            campaign_id.to_string(),
            MemoryBudget {
                daily_spent: status.daily_spent,
                hourly_spent: status.hourly_spent,
                current_hour: status.current_hour,
                last_update: Utc::now(),
            },
        );
    }

    /// Copy the current memory entries for `ids` into the recovery queue
    /// (last writer wins per campaign).
    async fn queue_for_recovery(&self, ids: &[String]) {
        let snapshots: Vec<(String, MemoryBudget)> = {
            let cache = self.cache.read().await;
            ids.iter()
                .filter_map(|id| cache.get(id).map(|b| (id.clone(), b.clone())))
                .collect()
        };

        let mut queue = self
            .recovery_queue
            .lock()
            .expect("recovery queue lock poisoned");
        for (id, snapshot) in snapshots {
            queue.insert(id, snapshot);
        }
    }

    fn mark_store_failure(&self, err: &CounterStoreError) {
        warn!(error = %err, "counter store operation failed, entering degraded mode");
        self.store_healthy.store(false, Ordering::SeqCst);
        self.degraded.store(true, Ordering::SeqCst);
    }

    /// Write queued degraded-mode spend back to the store. Day and hour
    /// keys are written as absolute values (the memory entry already holds
    /// the accumulated outage delta); the lifetime total is incremented by
    /// the observed daily figure. Clears degraded mode once the queue is
    /// fully drained.
    async fn drain_recovery_queue(&self) -> Result<usize, CounterStoreError> {
        let snapshot: HashMap<String, MemoryBudget> = {
            let mut queue = self
                .recovery_queue
                .lock()
                .expect("recovery queue lock poisoned");
            std::mem::take(&mut *queue)
        };

        if snapshot.is_empty() {
            self.degraded.store(false, Ordering::SeqCst);
            return Ok(0);
        }

        let at = self.now();
        let mut ops = Vec::with_capacity(snapshot.len() * 3);
        for (campaign_id, budget) in &snapshot {
            // An hourly counter from a previous hour has expired from the
            // current bucket's point of view.
            let hourly_spent = if budget.current_hour == at.hour() {
                budget.hourly_spent
            } else {
                0
            };

            ops.push(CounterOp::Set {
                key: Self::day_key(campaign_id, &at),
                value: budget.daily_spent,
                ttl: DAY_TTL,
            });
            ops.push(CounterOp::Set {
                key: Self::hour_key(campaign_id, &at),
                value: hourly_spent,
                ttl: HOUR_TTL,
            });
            ops.push(CounterOp::IncrBy {
                key: Self::total_key(campaign_id),
                delta: budget.daily_spent,
                ttl: TOTAL_TTL,
            });
        }

        if let Err(err) = self.store.apply(&ops).await {
            // Re-admit the snapshot, but let anything written in the
            // meantime win: queue entries are fresher.
            let mut queue = self
                .recovery_queue
                .lock()
                .expect("recovery queue lock poisoned");
            for (id, budget) in snapshot {
                queue.entry(id).or_insert(budget);
            }
            return Err(err);
        }

        let synced = snapshot.len();
        self.degraded.store(false, Ordering::SeqCst);
        info!(campaigns_synced = synced, "recovered from degraded mode");
        Ok(synced)
    }

    async fn spend_worker(
        tracker: Weak<Self>,
        rx: Arc<tokio::sync::Mutex<mpsc::Receiver<SpendWrite>>>,
    ) {
        loop {
            let write = {
                let mut rx = rx.lock().await;
                rx.recv().await
            };
            let Some(write) = write else {
                return; // channel closed, tracker gone
            };
            let Some(tracker) = tracker.upgrade() else {
                return;
            };

            if !tracker.store_healthy.load(Ordering::SeqCst) {
                // The store is known down; make sure these deltas survive
                // for the recovery drain instead of burning a round trip.
                let ids: Vec<String> = write.entries.iter().map(|(id, _)| id.clone()).collect();
                tracker.queue_for_recovery(&ids).await;
                continue;
            }

            let mut ops = Vec::with_capacity(write.entries.len() * 3);
            for (campaign_id, amount) in &write.entries {
                ops.push(CounterOp::IncrBy {
                    key: Self::day_key(campaign_id, &write.at),
                    delta: *amount,
                    ttl: DAY_TTL,
                });
                ops.push(CounterOp::IncrBy {
                    key: Self::hour_key(campaign_id, &write.at),
                    delta: *amount,
                    ttl: HOUR_TTL,
                });
                ops.push(CounterOp::IncrBy {
                    key: Self::total_key(campaign_id),
                    delta: *amount,
                    ttl: TOTAL_TTL,
                });
            }

            if let Err(err) = tracker.store.apply(&ops).await {
                tracker.mark_store_failure(&err);
                let ids: Vec<String> = write.entries.iter().map(|(id, _)| id.clone()).collect();
                tracker.queue_for_recovery(&ids).await;
            }
        }
    }

    async fn health_probe_loop(tracker: Weak<Self>) {
        let Some(probe_interval) = tracker.upgrade().map(|t| t.probe_interval) else {
            return;
        };
        let mut interval = tokio::time::interval(probe_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            let Some(tracker) = tracker.upgrade() else {
                return;
            };

            let healthy = tracker.store.ping().await.is_ok();
            let was_healthy = tracker.store_healthy.swap(healthy, Ordering::SeqCst);

            if healthy && !was_healthy {
                info!("counter store connection restored");
                tracker.recover_now.notify_one();
            } else if !healthy && was_healthy {
                warn!("counter store probe failed");
            }
        }
    }

    async fn recovery_loop(tracker: Weak<Self>) {
        let Some((recovery_interval, notify)) = tracker
            .upgrade()
            .map(|t| (t.recovery_interval, t.recover_now.clone()))
        else {
            return;
        };
        let mut interval = tokio::time::interval(recovery_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = notify.notified() => {}
            }

            let Some(tracker) = tracker.upgrade() else {
                return;
            };
            if !tracker.degraded.load(Ordering::SeqCst)
                || !tracker.store_healthy.load(Ordering::SeqCst)
            {
                continue;
            }

            debug!("attempting recovery from degraded mode");
            if let Err(err) = tracker.drain_recovery_queue().await {
                warn!(error = %err, "recovery drain failed, will retry");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::counter_store::InMemoryCounterStore;
    use chrono::TimeZone;
    use chrono_tz::Tz;

    fn test_settings() -> TrackerSettings {
        TrackerSettings {
            timezone: "UTC".to_string(),
            status_cache_ttl_ms: 0, // disable the read cache in unit tests
            spend_queue_capacity: 64,
            spend_workers: 2,
            recovery_interval_secs: 3600, // drains are driven manually
        }
    }

    fn new_tracker() -> (Arc<ResilientBudgetTracker>, Arc<InMemoryCounterStore>) {
        let store = Arc::new(InMemoryCounterStore::new());
        let tracker = ResilientBudgetTracker::new(
            store.clone(),
            &test_settings(),
            chrono_tz::UTC,
            Duration::from_secs(3600),
        );
        (tracker, store)
    }

    fn at(hour: u32) -> DateTime<Tz> {
        chrono_tz::UTC
            .with_ymd_and_hms(2025, 6, 15, hour, 30, 0)
            .unwrap()
    }

    /// Wait until the async spend workers have drained a write into the
    /// store, bounded so a broken path fails the test instead of hanging.
    async fn wait_for_counter(store: &InMemoryCounterStore, key: &str, expected: i64) {
        for _ in 0..200 {
            if let Ok(Some(value)) = crate::domain::CounterStore::get(store, key).await {
                if value >= expected {
                    assert_eq!(value, expected);
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("counter {} never reached {}", key, expected);
    }

    #[tokio::test]
    async fn test_track_spend_round_trip() {
        let (tracker, store) = new_tracker();
        let now = at(12);

        tracker.track_spend_at("c1", 1_000, now).await;
        tracker.track_spend_at("c1", 500, now).await;

        let day_key = ResilientBudgetTracker::day_key("c1", &now);
        let hour_key = ResilientBudgetTracker::hour_key("c1", &now);
        wait_for_counter(&store, &day_key, 1_500).await;
        wait_for_counter(&store, &hour_key, 1_500).await;

        let status = tracker.status_at("c1", 24_000, now).await;
        assert!(!status.degraded_mode);
        assert_eq!(status.daily_spent, 1_500);
        assert_eq!(status.hourly_spent, 1_500);
        assert_eq!(status.hourly_budget, 1_000);
        assert_eq!(status.current_hour, 12);
        assert_eq!(status.remaining_hours, 12);
    }

    #[tokio::test]
    async fn test_non_positive_spend_is_ignored() {
        let (tracker, _store) = new_tracker();
        let now = at(10);

        tracker.track_spend_at("c1", 0, now).await;
        tracker.track_spend_at("c1", -50, now).await;

        let status = tracker.status_at("c1", 24_000, now).await;
        assert_eq!(status.daily_spent, 0);
    }

    #[tokio::test]
    async fn test_batch_track_spend() {
        let (tracker, store) = new_tracker();

        let mut spends = HashMap::new();
        spends.insert("a".to_string(), 100i64);
        spends.insert("b".to_string(), 200i64);
        tracker.batch_track_spend(&spends).await;

        let now = tracker.now();
        wait_for_counter(&store, &ResilientBudgetTracker::day_key("a", &now), 100).await;
        wait_for_counter(&store, &ResilientBudgetTracker::day_key("b", &now), 200).await;
    }

    #[tokio::test]
    async fn test_degraded_status_from_memory() {
        let (tracker, store) = new_tracker();
        let now = at(12);

        store.set_failing(true);
        for _ in 0..10 {
            tracker.track_spend_at("c1", 1_000, now).await;
        }
        // Let a worker hit the failure and flip the health flag.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = tracker.status_at("c1", 240_000, now).await;
        assert!(status.degraded_mode);
        assert_eq!(status.daily_spent, 10_000);
        assert!(status.throttle_rate >= DEGRADED_THROTTLE);
        assert!(!tracker.is_healthy());
    }

    #[tokio::test]
    async fn test_degraded_status_without_cache_entry() {
        let (tracker, store) = new_tracker();
        let now = at(12);

        store.set_failing(true);
        // Force the failure to be noticed by a read.
        let status = tracker.status_at("ghost", 24_000, now).await;

        assert!(status.degraded_mode);
        // Half the day gone: assume half the budget spent.
        assert_eq!(status.daily_spent, 12_000);
        assert_eq!(status.hourly_spent, 0);
        assert_eq!(status.throttle_rate, BLIND_THROTTLE);
    }

    #[tokio::test]
    async fn test_degraded_blind_status_uses_advisory_budget() {
        let (tracker, store) = new_tracker();
        store.set_failing(true);

        let mut budgets = HashMap::new();
        budgets.insert("c9".to_string(), 48_000i64);
        tracker.set_campaign_budgets(budgets).await;

        let status = tracker.status_at("c9", 0, at(6)).await;
        assert_eq!(status.daily_budget, 48_000);
        assert_eq!(status.daily_spent, 48_000 * 6 / 24);
    }

    #[tokio::test]
    async fn test_hour_rollover_resets_hourly() {
        let (tracker, store) = new_tracker();

        tracker.track_spend_at("c1", 40_000, at(9)).await;
        store.set_failing(true); // read memory, not the store

        // First observation in the new hour reports a fresh hourly counter.
        let status = tracker.status_at("c1", 1_000_000, at(10)).await;
        assert_eq!(status.hourly_spent, 0);
        assert_eq!(status.current_hour, 10);
        assert_eq!(status.daily_spent, 40_000);

        // And the next spend starts the new hour from zero.
        tracker.track_spend_at("c1", 5_000, at(10)).await;
        let status = tracker.status_at("c1", 1_000_000, at(10)).await;
        assert_eq!(status.hourly_spent, 5_000);
        assert_eq!(status.daily_spent, 45_000);
    }

    #[tokio::test]
    async fn test_outage_then_recovery_drain() {
        let (tracker, store) = new_tracker();
        let now = at(12);

        store.set_failing(true);
        for _ in 0..10 {
            tracker.track_spend_at("c1", 1_000, now).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(tracker.status_at("c1", 240_000, now).await.degraded_mode);

        store.set_failing(false);
        tracker.store_healthy.store(true, Ordering::SeqCst);
        let synced = tracker.drain_recovery_queue().await.unwrap();
        assert_eq!(synced, 1);
        assert!(tracker.is_healthy());

        // The store now holds the absolute outage totals.
        let day_key = ResilientBudgetTracker::day_key("c1", &tracker.now());
        assert_eq!(
            crate::domain::CounterStore::get(store.as_ref(), &day_key)
                .await
                .unwrap(),
            Some(10_000)
        );

        let status = tracker.status_at("c1", 240_000, tracker.now()).await;
        assert!(!status.degraded_mode);
        assert_eq!(status.daily_spent, 10_000);
    }

    #[tokio::test]
    async fn test_recovery_drain_is_idempotent() {
        let (tracker, store) = new_tracker();
        let now = at(12);

        store.set_failing(true);
        tracker.track_spend_at("c1", 7_000, now).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        store.set_failing(false);
        tracker.store_healthy.store(true, Ordering::SeqCst);
        tracker.drain_recovery_queue().await.unwrap();

        let day_key = ResilientBudgetTracker::day_key("c1", &tracker.now());
        let after_first = crate::domain::CounterStore::get(store.as_ref(), &day_key)
            .await
            .unwrap();

        // A second drain over the same state changes nothing: the queue was
        // cleared and day/hour values are absolute.
        tracker.drain_recovery_queue().await.unwrap();
        let after_second = crate::domain::CounterStore::get(store.as_ref(), &day_key)
            .await
            .unwrap();
        assert_eq!(after_first, after_second);
    }

    #[tokio::test]
    async fn test_failed_drain_requeues_with_fresh_entries_winning() {
        let (tracker, store) = new_tracker();
        let now = at(12);

        store.set_failing(true);
        tracker.track_spend_at("c1", 1_000, now).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Drain while the store is still failing: the snapshot must come
        // back.
        assert!(tracker.drain_recovery_queue().await.is_err());
        assert_eq!(tracker.health().await.recovery_queue_size, 1);

        // More spend arrives before the next drain; the queue keeps the
        // fresher figure.
        tracker.track_spend_at("c1", 2_000, now).await;
        let queued = tracker
            .recovery_queue
            .lock()
            .unwrap()
            .get("c1")
            .unwrap()
            .clone();
        assert_eq!(queued.daily_spent, 3_000);
    }

    #[tokio::test]
    async fn test_reset_daily_budget() {
        let (tracker, store) = new_tracker();
        let now = at(12);

        tracker.track_spend_at("c1", 1_000, now).await;
        let day_key = ResilientBudgetTracker::day_key("c1", &now);
        wait_for_counter(&store, &day_key, 1_000).await;

        tracker.reset_daily_budget("c1").await.unwrap();
        assert_eq!(
            crate::domain::CounterStore::get(store.as_ref(), &day_key)
                .await
                .unwrap(),
            None
        );
        assert!(tracker.cache.read().await.get("c1").is_none());
    }

    #[tokio::test]
    async fn test_get_multiple_statuses() {
        let (tracker, store) = new_tracker();
        let now = tracker.now();

        tracker.track_spend("a", 100).await;
        tracker.track_spend("b", 200).await;
        wait_for_counter(&store, &ResilientBudgetTracker::day_key("a", &now), 100).await;
        wait_for_counter(&store, &ResilientBudgetTracker::day_key("b", &now), 200).await;

        let mut budgets = HashMap::new();
        budgets.insert("a".to_string(), 2_400i64);
        budgets.insert("b".to_string(), 4_800i64);

        let statuses = tracker.get_multiple_statuses(&budgets).await;
        assert_eq!(statuses["a"].daily_spent, 100);
        assert_eq!(statuses["b"].daily_spent, 200);
        assert_eq!(statuses["b"].hourly_budget, 200);
    }

    #[tokio::test]
    async fn test_daily_spent_monotonic_within_day() {
        let (tracker, store) = new_tracker();
        let now = at(8);

        let mut last = 0;
        for i in 1..=20 {
            tracker.track_spend_at("c1", 10, now).await;
            let status = tracker.status_at("c1", 100_000, now).await;
            assert!(status.daily_spent >= last, "iteration {}", i);
            last = status.daily_spent;
        }

        // Once the store has drained, the full total is visible.
        wait_for_counter(&store, &ResilientBudgetTracker::day_key("c1", &now), 200).await;
        let status = tracker.status_at("c1", 100_000, now).await;
        assert_eq!(status.daily_spent, 200);
    }
}
