use async_trait::async_trait;
use moka::{future::Cache, Expiry};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, info};

use crate::{
    error::Result,
    redis::{RedisClient, RedisConfig},
    utils::{window_millis, Clock},
};

/// Hits accumulated for one key since its window began
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateRecord {
    pub count: u64,
    pub window_start_ms: i64,
}

impl RateRecord {
    /// Record for the first hit of a fresh window
    pub fn first_hit(now_ms: i64) -> Self {
        Self {
            count: 1,
            window_start_ms: now_ms,
        }
    }

    /// A record is valid while `now - window_start <= window`
    pub fn is_expired(&self, now_ms: i64, window_ms: i64) -> bool {
        now_ms.saturating_sub(self.window_start_ms) > window_ms
    }

    /// Apply one hit. An absent or expired record is replaced, never merged.
    pub fn advance(previous: Option<RateRecord>, now_ms: i64, window_ms: i64) -> Self {
        match previous {
            Some(record) if !record.is_expired(now_ms, window_ms) => Self {
                count: record.count.saturating_add(1),
                window_start_ms: record.window_start_ms,
            },
            _ => Self::first_hit(now_ms),
        }
    }
}

/// Key to record accounting with expiry.
///
/// `increment` must be atomic per key: concurrent callers on the same key
/// never both start a new window and never lose a hit.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Count one hit against `key` and return the resulting record
    async fn increment(&self, key: &str, window: Duration) -> Result<RateRecord>;

    /// Drop all state for `key`
    async fn reset(&self, key: &str) -> Result<()>;

    /// Health check for the store
    async fn health_check(&self) -> Result<()>;

    /// Short backend name used in logs
    fn backend(&self) -> &'static str;
}

#[derive(Debug, Clone)]
struct LocalEntry {
    record: RateRecord,
    window: Duration,
}

/// Evicts an entry one window after its window started
struct WindowExpiry;

impl Expiry<String, LocalEntry> for WindowExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &LocalEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.window)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &LocalEntry,
        _updated_at: Instant,
        duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        // a restarted window gets a full TTL; in-window hits keep the old deadline
        if value.record.count == 1 {
            Some(value.window)
        } else {
            duration_until_expiry
        }
    }
}

/// In-process counter store.
///
/// Eviction is handled by the cache's expiry timer, but every increment also
/// checks the window against the clock, so a late eviction never lets a stale
/// count through.
///
/// The cache has no size bound: a live window is only ever dropped by its own
/// expiry, and the number of live keys is bounded by traffic per window.
pub struct LocalCounterStore {
    entries: Cache<String, LocalEntry>,
    clock: Arc<dyn Clock>,
}

impl LocalCounterStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let entries = Cache::builder().expire_after(WindowExpiry).build();

        Self { entries, clock }
    }
}

#[async_trait]
impl CounterStore for LocalCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<RateRecord> {
        let window_ms = window_millis(window);

        // upserts on the same key are serialized by the cache
        let entry = self
            .entries
            .entry(key.to_string())
            .and_upsert_with(|existing| {
                let previous = existing.map(|entry| entry.into_value().record);
                let record = RateRecord::advance(previous, self.clock.now_millis(), window_ms);
                std::future::ready(LocalEntry { record, window })
            })
            .await;

        Ok(entry.into_value().record)
    }

    async fn reset(&self, key: &str) -> Result<()> {
        self.entries.invalidate(key).await;
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "local"
    }
}

/// Counter store shared between processes through Redis.
///
/// Each identity maps to one hash under `key_prefix + identity` with
/// `count` and `timestamp` fields and a TTL of one window.
pub struct SharedCounterStore {
    client: RedisClient,
    key_prefix: String,
    clock: Arc<dyn Clock>,
}

impl SharedCounterStore {
    pub fn new(client: RedisClient, key_prefix: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
            clock,
        }
    }

    /// Connect to Redis and build a store from the connection settings
    pub async fn connect(config: &RedisConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let client = RedisClient::new(config).await?;
        info!("Shared counter store using key prefix '{}'", config.key_prefix);
        Ok(Self::new(client, config.key_prefix.clone(), clock))
    }

    fn record_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[async_trait]
impl CounterStore for SharedCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<RateRecord> {
        let record_key = self.record_key(key);
        let (count, window_start_ms) = self
            .client
            .increment_window(&record_key, self.clock.now_millis(), window_millis(window))
            .await?;

        debug!("{} -> count={} window_start={}", record_key, count, window_start_ms);

        // a negative count can only come from a tampered record; surface it as zero
        Ok(RateRecord {
            count: u64::try_from(count).unwrap_or(0),
            window_start_ms,
        })
    }

    async fn reset(&self, key: &str) -> Result<()> {
        self.client.delete(&self.record_key(key)).await
    }

    async fn health_check(&self) -> Result<()> {
        self.client.health_check().await
    }

    fn backend(&self) -> &'static str {
        "shared"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ManualClock;

    const WINDOW: Duration = Duration::from_millis(3000);

    fn local_store() -> (LocalCounterStore, ManualClock) {
        let clock = ManualClock::new(1_000_000);
        (LocalCounterStore::new(Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_advance_replaces_expired_record() {
        let old = RateRecord {
            count: 7,
            window_start_ms: 0,
        };
        assert_eq!(RateRecord::advance(Some(old), 3000, 3000).count, 8);
        assert_eq!(
            RateRecord::advance(Some(old), 3001, 3000),
            RateRecord::first_hit(3001)
        );
        assert_eq!(RateRecord::advance(None, 5, 3000), RateRecord::first_hit(5));
    }

    #[tokio::test]
    async fn test_local_increments_within_window() {
        let (store, clock) = local_store();
        let start = clock.now_millis();

        for expected in 1..=4 {
            let record = store.increment("10.0.0.1", WINDOW).await.unwrap();
            assert_eq!(record.count, expected);
            assert_eq!(record.window_start_ms, start);
            clock.advance(Duration::from_millis(100));
        }
    }

    #[tokio::test]
    async fn test_local_window_restarts_after_expiry() {
        let (store, clock) = local_store();

        for _ in 0..5 {
            store.increment("10.0.0.1", WINDOW).await.unwrap();
        }
        clock.advance(Duration::from_millis(3100));

        // the cache's own timer has not fired yet; the clock check alone restarts the window
        let record = store.increment("10.0.0.1", WINDOW).await.unwrap();
        assert_eq!(record, RateRecord::first_hit(clock.now_millis()));
    }

    #[tokio::test]
    async fn test_local_keys_are_independent() {
        let (store, _clock) = local_store();

        for _ in 0..3 {
            store.increment("alice", WINDOW).await.unwrap();
        }
        let bob = store.increment("bob", WINDOW).await.unwrap();
        assert_eq!(bob.count, 1);
        assert_eq!(store.increment("alice", WINDOW).await.unwrap().count, 4);
    }

    #[tokio::test]
    async fn test_local_reset_clears_key() {
        let (store, _clock) = local_store();

        store.increment("alice", WINDOW).await.unwrap();
        store.increment("alice", WINDOW).await.unwrap();
        store.reset("alice").await.unwrap();

        assert_eq!(store.increment("alice", WINDOW).await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_local_entries_evicted_by_timer() {
        let store = LocalCounterStore::new(Arc::new(crate::utils::SystemClock));

        store.increment("short", Duration::from_millis(50)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        store.entries.run_pending_tasks().await;

        assert!(store.entries.get("short").await.is_none());
    }

    #[tokio::test]
    async fn test_local_live_window_survives_key_churn() {
        let (store, _clock) = local_store();
        let window = Duration::from_secs(60);

        assert_eq!(store.increment("steady", window).await.unwrap().count, 1);
        assert_eq!(store.increment("steady", window).await.unwrap().count, 2);

        for i in 0..500 {
            let key = format!("rotating-{}", i);
            for _ in 0..5 {
                store.increment(&key, window).await.unwrap();
            }
            store.entries.run_pending_tasks().await;
        }

        assert_eq!(store.increment("steady", window).await.unwrap().count, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_local_concurrent_increments_are_not_lost() {
        let (store, _clock) = local_store();
        let store = Arc::new(store);

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.increment("shared", WINDOW).await.unwrap().count })
            })
            .collect();

        let mut counts = Vec::new();
        for handle in handles {
            counts.push(handle.await.unwrap());
        }
        counts.sort_unstable();

        // every caller observed a distinct count
        assert_eq!(counts, (1..=100).collect::<Vec<u64>>());
    }
}
