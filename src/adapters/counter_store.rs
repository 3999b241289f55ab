//! Counter store adapters.
//!
//! [`RedisCounterStore`] is the production implementation: one multiplexed
//! connection with automatic reconnection, pipelined batches, and a
//! per-operation deadline so a slow store can never stall the decision
//! path. [`InMemoryCounterStore`] implements the same port over a local map
//! and powers tests and store-less local runs, including fault injection
//! for outage scenarios.

use crate::config::CounterStoreSettings;
use crate::domain::{CounterOp, CounterStore, CounterStoreError};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

impl From<redis::RedisError> for CounterStoreError {
    fn from(err: redis::RedisError) -> Self {
        CounterStoreError::Transport(err.to_string())
    }
}

pub struct RedisCounterStore {
    client: redis::Client,
    conn: RwLock<Option<ConnectionManager>>,
    dial_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
    read_retries: u32,
    probe_timeout: Duration,
}

impl RedisCounterStore {
    /// Build the store from settings. Only the URL is validated here; the
    /// first connection is established lazily so a store outage at startup
    /// degrades service instead of aborting it.
    pub fn new(settings: &CounterStoreSettings) -> Result<Self, CounterStoreError> {
        let client = redis::Client::open(settings.url.as_str())?;

        Ok(Self {
            client,
            conn: RwLock::new(None),
            dial_timeout: Duration::from_millis(settings.dial_timeout_ms),
            read_timeout: Duration::from_millis(settings.read_timeout_ms),
            write_timeout: Duration::from_millis(settings.write_timeout_ms),
            read_retries: settings.read_retries,
            probe_timeout: Duration::from_millis(settings.probe_timeout_ms),
        })
    }

    /// Current connection, dialing one under the dial deadline if none is
    /// live yet. `ConnectionManager` reconnects on its own after transient
    /// drops; this only covers the cold start.
    async fn connection(&self) -> Result<ConnectionManager, CounterStoreError> {
        if let Some(conn) = self.conn.read().await.clone() {
            return Ok(conn);
        }

        let manager = deadline(
            self.dial_timeout,
            ConnectionManager::new(self.client.clone()),
        )
        .await??;

        debug!("counter store connection established");
        *self.conn.write().await = Some(manager.clone());
        Ok(manager)
    }

    async fn read_with_retry<T, F, Fut>(&self, op: F) -> Result<T, CounterStoreError>
    where
        F: Fn(ConnectionManager) -> Fut,
        Fut: Future<Output = Result<T, CounterStoreError>>,
    {
        let mut last_err = None;
        for _ in 0..=self.read_retries {
            let conn = match self.connection().await {
                Ok(conn) => conn,
                Err(err) => {
                    last_err = Some(err);
                    continue;
                }
            };
            match deadline(self.read_timeout, op(conn)).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => last_err = Some(err),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or(CounterStoreError::Timeout(self.read_timeout)))
    }
}

/// Bound a store future by `limit`, mapping elapsed time to
/// [`CounterStoreError::Timeout`].
async fn deadline<T>(
    limit: Duration,
    fut: impl Future<Output = T>,
) -> Result<T, CounterStoreError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| CounterStoreError::Timeout(limit))
}

fn push_op(pipe: &mut redis::Pipeline, op: &CounterOp) {
    match op {
        CounterOp::IncrBy { key, delta, ttl } => {
            pipe.incr(key, *delta).ignore();
            pipe.expire(key, ttl.as_secs() as i64).ignore();
        }
        CounterOp::Set { key, value, ttl } => {
            pipe.set_ex(key, *value, ttl.as_secs()).ignore();
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn incr_by(
        &self,
        key: &str,
        delta: i64,
        ttl: Duration,
    ) -> Result<i64, CounterStoreError> {
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.incr(key, delta);
        pipe.expire(key, ttl.as_secs() as i64).ignore();

        let (value,): (i64,) = deadline(self.write_timeout, pipe.query_async(&mut conn)).await??;
        Ok(value)
    }

    async fn get(&self, key: &str) -> Result<Option<i64>, CounterStoreError> {
        let key = key.to_string();
        self.read_with_retry(move |mut conn| {
            let key = key.clone();
            async move {
                let value: Option<i64> = conn.get(&key).await?;
                Ok(value)
            }
        })
        .await
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<i64>>, CounterStoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let keys = keys.to_vec();
        self.read_with_retry(move |mut conn| {
            let keys = keys.clone();
            async move {
                let mut pipe = redis::pipe();
                for key in &keys {
                    pipe.get(key);
                }
                let values: Vec<Option<i64>> = pipe.query_async(&mut conn).await?;
                Ok(values)
            }
        })
        .await
    }

    async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<(), CounterStoreError> {
        let mut conn = self.connection().await?;
        let fut = conn.set_ex::<_, _, ()>(key, value, ttl.as_secs());
        deadline(self.write_timeout, fut).await??;
        Ok(())
    }

    async fn apply(&self, ops: &[CounterOp]) -> Result<(), CounterStoreError> {
        if ops.is_empty() {
            return Ok(());
        }

        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        for op in ops {
            push_op(&mut pipe, op);
        }

        let _: () = deadline(self.write_timeout, pipe.query_async(&mut conn)).await??;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CounterStoreError> {
        let mut conn = self.connection().await?;
        let fut = conn.del::<_, ()>(key);
        deadline(self.write_timeout, fut).await??;
        Ok(())
    }

    async fn ping(&self) -> Result<(), CounterStoreError> {
        let mut conn = self.connection().await?;
        let cmd = redis::cmd("PING");
        let _: String = deadline(self.probe_timeout, cmd.query_async(&mut conn)).await??;
        Ok(())
    }
}

struct MemoryEntry {
    value: i64,
    expires_at: Option<Instant>,
}

/// Counter store over a process-local map. Expiry is honored lazily on
/// read. `set_failing(true)` makes every operation return a transport
/// error, which is how the outage tests push the tracker into degraded
/// mode.
#[derive(Default)]
pub struct InMemoryCounterStore {
    entries: Mutex<HashMap<String, MemoryEntry>>,
    failing: AtomicBool,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), CounterStoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CounterStoreError::Transport(
                "injected store failure".to_string(),
            ));
        }
        Ok(())
    }

    fn live_value(entry: &MemoryEntry) -> Option<i64> {
        match entry.expires_at {
            Some(deadline) if Instant::now() >= deadline => None,
            _ => Some(entry.value),
        }
    }

    fn apply_locked(entries: &mut HashMap<String, MemoryEntry>, op: &CounterOp) {
        match op {
            CounterOp::IncrBy { key, delta, ttl } => {
                let now = Instant::now();
                let entry = entries.entry(key.clone()).or_insert(MemoryEntry {
                    value: 0,
                    expires_at: None,
                });
                // An expired entry restarts from zero, like a fresh key.
                if matches!(entry.expires_at, Some(deadline) if now >= deadline) {
                    entry.value = 0;
                }
                entry.value += delta;
                entry.expires_at = Some(now + *ttl);
            }
            CounterOp::Set { key, value, ttl } => {
                entries.insert(
                    key.clone(),
                    MemoryEntry {
                        value: *value,
                        expires_at: Some(Instant::now() + *ttl),
                    },
                );
            }
        }
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn incr_by(
        &self,
        key: &str,
        delta: i64,
        ttl: Duration,
    ) -> Result<i64, CounterStoreError> {
        self.check_available()?;
        let mut entries = self.entries.lock().expect("counter map lock poisoned");
        Self::apply_locked(
            &mut entries,
            &CounterOp::IncrBy {
                key: key.to_string(),
                delta,
                ttl,
            },
        );
        Ok(entries[key].value)
    }

    async fn get(&self, key: &str) -> Result<Option<i64>, CounterStoreError> {
        self.check_available()?;
        let entries = self.entries.lock().expect("counter map lock poisoned");
        Ok(entries.get(key).and_then(Self::live_value))
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<i64>>, CounterStoreError> {
        self.check_available()?;
        let entries = self.entries.lock().expect("counter map lock poisoned");
        Ok(keys
            .iter()
            .map(|key| entries.get(key).and_then(Self::live_value))
            .collect())
    }

    async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<(), CounterStoreError> {
        self.check_available()?;
        let mut entries = self.entries.lock().expect("counter map lock poisoned");
        Self::apply_locked(
            &mut entries,
            &CounterOp::Set {
                key: key.to_string(),
                value,
                ttl,
            },
        );
        Ok(())
    }

    async fn apply(&self, ops: &[CounterOp]) -> Result<(), CounterStoreError> {
        self.check_available()?;
        let mut entries = self.entries.lock().expect("counter map lock poisoned");
        for op in ops {
            Self::apply_locked(&mut entries, op);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CounterStoreError> {
        self.check_available()?;
        let mut entries = self.entries.lock().expect("counter map lock poisoned");
        entries.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<(), CounterStoreError> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_incr_and_get() {
        let store = InMemoryCounterStore::new();
        assert_eq!(store.incr_by("k", 5, TTL).await.unwrap(), 5);
        assert_eq!(store.incr_by("k", 3, TTL).await.unwrap(), 8);
        assert_eq!(store.get("k").await.unwrap(), Some(8));
        assert_eq!(store.get("absent").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_pipelined_batch() {
        let store = InMemoryCounterStore::new();
        store
            .apply(&[
                CounterOp::IncrBy {
                    key: "a".to_string(),
                    delta: 10,
                    ttl: TTL,
                },
                CounterOp::Set {
                    key: "b".to_string(),
                    value: 42,
                    ttl: TTL,
                },
            ])
            .await
            .unwrap();

        let values = store
            .get_many(&["a".to_string(), "b".to_string(), "c".to_string()])
            .await
            .unwrap();
        assert_eq!(values, vec![Some(10), Some(42), None]);
    }

    #[tokio::test]
    async fn test_set_is_absolute() {
        let store = InMemoryCounterStore::new();
        store.incr_by("k", 7, TTL).await.unwrap();
        store.set("k", 100, TTL).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(100));
    }

    #[tokio::test]
    async fn test_expiry_hides_and_resets_counter() {
        let store = InMemoryCounterStore::new();
        store
            .incr_by("k", 9, Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(store.get("k").await.unwrap(), None);
        // A new increment starts over rather than resurrecting the value.
        assert_eq!(store.incr_by("k", 1, TTL).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = InMemoryCounterStore::new();
        store.incr_by("k", 1, TTL).await.unwrap();
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let store = InMemoryCounterStore::new();
        store.incr_by("k", 1, TTL).await.unwrap();

        store.set_failing(true);
        assert!(store.get("k").await.is_err());
        assert!(store.ping().await.is_err());
        assert!(store.incr_by("k", 1, TTL).await.is_err());

        store.set_failing(false);
        assert_eq!(store.get("k").await.unwrap(), Some(1));
        assert!(store.ping().await.is_ok());
    }
}
