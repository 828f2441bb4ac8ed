//! In-process counter store backed by a concurrent map.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

use crate::error::Result;
use crate::ratelimit::{Clock, CounterKey, CounterRecord, CounterStore, IncrementStrategy, SystemClock};

/// Counter store that keeps every record in memory.
///
/// Suitable for a single limiter instance and for tests. Both strategies
/// hold the map shard lock for the key across the whole increment, so
/// concurrent writers never lose updates. `Atomic` is a single upsert;
/// `BestEffort` reads the current count and writes back a fresh record,
/// mirroring the fallback path of the database store.
pub struct MemoryCounterStore {
    counters: DashMap<CounterKey, CounterRecord>,
    strategy: IncrementStrategy,
    clock: Arc<dyn Clock>,
}

impl MemoryCounterStore {
    /// Create a store using atomic increments.
    pub fn new() -> Self {
        Self::with_strategy(IncrementStrategy::Atomic)
    }

    /// Create a store with an explicit increment strategy.
    ///
    /// `Auto` resolves to `Atomic`; the primitive is always available here.
    pub fn with_strategy(strategy: IncrementStrategy) -> Self {
        let strategy = match strategy {
            IncrementStrategy::Auto => IncrementStrategy::Atomic,
            other => other,
        };
        Self {
            counters: DashMap::new(),
            strategy,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `clock` for `updated_at` stamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Insert or replace a record verbatim.
    pub fn insert_record(&self, record: CounterRecord) {
        self.counters.insert(record.key(), record);
    }

    /// Fetch a copy of the record for a key.
    pub fn get(&self, key: &CounterKey) -> Option<CounterRecord> {
        self.counters.get(key).map(|r| r.value().clone())
    }

    /// Number of stored counters.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    fn new_record(&self, key: &CounterKey, request_count: u64) -> CounterRecord {
        CounterRecord {
            user_id: key.user_id,
            endpoint: key.endpoint,
            window_start: key.window_start,
            request_count,
            updated_at: self.clock.now(),
        }
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn read_count(&self, key: &CounterKey) -> Result<u64> {
        Ok(self.counters.get(key).map(|r| r.request_count).unwrap_or(0))
    }

    async fn increment_count(&self, key: &CounterKey) -> Result<()> {
        match self.strategy {
            IncrementStrategy::BestEffort => match self.counters.entry(*key) {
                Entry::Occupied(mut entry) => {
                    let next = entry.get().request_count + 1;
                    entry.insert(self.new_record(key, next));
                }
                Entry::Vacant(entry) => {
                    entry.insert(self.new_record(key, 1));
                }
            },
            _ => {
                let now = self.clock.now();
                self.counters
                    .entry(*key)
                    .and_modify(|r| {
                        r.request_count += 1;
                        r.updated_at = now;
                    })
                    .or_insert_with(|| self.new_record(key, 1));
            }
        }

        trace!(key = %key, strategy = %self.strategy, "Incremented in-memory counter");
        Ok(())
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut removed = 0;
        self.counters.retain(|_, record| {
            let keep = record.window_start >= cutoff;
            if !keep {
                removed += 1;
            }
            keep
        });
        Ok(removed)
    }

    fn strategy(&self) -> IncrementStrategy {
        self.strategy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{Endpoint, ManualClock};
    use chrono::{Duration, TimeZone};
    use uuid::Uuid;

    fn key_at(window_start: DateTime<Utc>) -> CounterKey {
        CounterKey::new(Uuid::new_v4(), Endpoint::Chat, window_start)
    }

    fn midnight() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_read_absent_counter_is_zero() {
        let store = MemoryCounterStore::new();
        assert_eq!(store.read_count(&key_at(midnight())).await.unwrap(), 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_increment_creates_then_increments() {
        let clock = Arc::new(ManualClock::new(midnight() + Duration::hours(3)));
        let store = MemoryCounterStore::new().with_clock(clock.clone());
        let key = key_at(midnight());

        store.increment_count(&key).await.unwrap();
        assert_eq!(store.read_count(&key).await.unwrap(), 1);

        clock.advance(Duration::minutes(5));
        store.increment_count(&key).await.unwrap();

        let record = store.get(&key).unwrap();
        assert_eq!(record.request_count, 2);
        assert_eq!(record.updated_at, midnight() + Duration::hours(3) + Duration::minutes(5));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_best_effort_sequential_increments() {
        let store = MemoryCounterStore::with_strategy(IncrementStrategy::BestEffort);
        let key = key_at(midnight());

        for _ in 0..3 {
            store.increment_count(&key).await.unwrap();
        }
        assert_eq!(store.read_count(&key).await.unwrap(), 3);
        assert_eq!(store.strategy(), IncrementStrategy::BestEffort);
    }

    #[test]
    fn test_auto_resolves_to_atomic() {
        let store = MemoryCounterStore::with_strategy(IncrementStrategy::Auto);
        assert_eq!(store.strategy(), IncrementStrategy::Atomic);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_atomic_increments_are_not_lost() {
        let store = Arc::new(MemoryCounterStore::new());
        let key = key_at(midnight());

        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.increment_count(&key).await })
            })
            .collect();

        for task in futures::future::join_all(tasks).await {
            task.unwrap().unwrap();
        }

        assert_eq!(store.read_count(&key).await.unwrap(), 64);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_best_effort_increments_are_not_lost() {
        let store = Arc::new(MemoryCounterStore::with_strategy(IncrementStrategy::BestEffort));
        let key = key_at(midnight());

        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    for _ in 0..8 {
                        store.increment_count(&key).await?;
                    }
                    Ok::<_, crate::error::TollgateError>(())
                })
            })
            .collect();

        for task in futures::future::join_all(tasks).await {
            task.unwrap().unwrap();
        }

        assert_eq!(store.read_count(&key).await.unwrap(), 512);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_before_removes_only_older_windows() {
        let store = MemoryCounterStore::new();
        let old = key_at(midnight() - Duration::days(10));
        let recent = key_at(midnight() - Duration::days(2));

        store.increment_count(&old).await.unwrap();
        store.increment_count(&recent).await.unwrap();

        let removed = store.delete_before(midnight() - Duration::days(7)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(&old).is_none());
        assert!(store.get(&recent).is_some());
    }
}
