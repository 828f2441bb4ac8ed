//! Retention cleanup for expired counters.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use super::backend::CounterStore;
use super::window::{Clock, SystemClock};
use crate::error::Result;

/// Default retention horizon for counters.
pub const DEFAULT_RETENTION_DAYS: u32 = 7;

/// Deletes counters whose window started before the retention horizon.
///
/// Live traffic only touches the current window, so sweeping runs
/// alongside checks and increments without coordination.
pub struct RetentionSweeper {
    store: Arc<dyn CounterStore>,
    retention: Duration,
    clock: Arc<dyn Clock>,
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn CounterStore>, retention_days: u32) -> Self {
        Self {
            store,
            retention: Duration::days(i64::from(retention_days)),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Delete every counter older than the retention horizon.
    ///
    /// Returns the number of counters removed.
    pub async fn sweep(&self) -> Result<u64> {
        let cutoff = self.clock.now() - self.retention;
        let removed = self.store.delete_before(cutoff).await?;

        info!(cutoff = %cutoff, removed, "Swept expired counters");
        Ok(removed)
    }

    /// Sweep every `interval` until `shutdown` resolves.
    ///
    /// The first sweep runs immediately. A failed sweep is logged and the
    /// loop carries on.
    pub async fn run_until<F>(&self, interval: StdDuration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(interval_secs = interval.as_secs(), "Retention sweeper started");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Retention sweeper stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Retention sweep failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{CounterKey, CounterRecord, Endpoint, ManualClock};
    use crate::store::MemoryCounterStore;
    use chrono::{DateTime, TimeZone, Utc};
    use uuid::Uuid;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 11, 20, 9, 30, 0).unwrap()
    }

    fn record(window_start: DateTime<Utc>) -> CounterRecord {
        CounterRecord {
            user_id: Uuid::new_v4(),
            endpoint: Endpoint::Chat,
            window_start,
            request_count: 4,
            updated_at: window_start,
        }
    }

    fn midnight_days_ago(days: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 11, 20, 0, 0, 0).unwrap() - Duration::days(days)
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired_counters() {
        let store = Arc::new(MemoryCounterStore::new());
        let old = record(midnight_days_ago(10));
        let recent = record(midnight_days_ago(2));
        store.insert_record(old.clone());
        store.insert_record(recent.clone());

        let sweeper = RetentionSweeper::new(store.clone(), DEFAULT_RETENTION_DAYS)
            .with_clock(Arc::new(ManualClock::new(now())));

        assert_eq!(sweeper.sweep().await.unwrap(), 1);
        assert!(store.get(&old.key()).is_none());
        assert_eq!(store.get(&recent.key()), Some(recent));
    }

    #[tokio::test]
    async fn test_sweep_is_idempotent() {
        let store = Arc::new(MemoryCounterStore::new());
        store.insert_record(record(midnight_days_ago(8)));

        let sweeper = RetentionSweeper::new(store.clone(), DEFAULT_RETENTION_DAYS)
            .with_clock(Arc::new(ManualClock::new(now())));

        assert_eq!(sweeper.sweep().await.unwrap(), 1);
        assert_eq!(sweeper.sweep().await.unwrap(), 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_keeps_counter_at_horizon() {
        let store = Arc::new(MemoryCounterStore::new());
        let at_horizon = record(now() - Duration::days(7));
        store.insert_record(at_horizon.clone());

        let sweeper = RetentionSweeper::new(store.clone(), DEFAULT_RETENTION_DAYS)
            .with_clock(Arc::new(ManualClock::new(now())));

        assert_eq!(sweeper.sweep().await.unwrap(), 0);
        assert!(store.get(&at_horizon.key()).is_some());
    }

    #[tokio::test]
    async fn test_run_until_sweeps_then_stops() {
        let store = Arc::new(MemoryCounterStore::new());
        let old = record(Utc::now() - Duration::days(30));
        store.insert_record(old.clone());
        let live = CounterKey::new(Uuid::new_v4(), Endpoint::QuizGeneration, Utc::now());
        store.increment_count(&live).await.unwrap();

        let sweeper = RetentionSweeper::new(store.clone(), DEFAULT_RETENTION_DAYS);
        sweeper
            .run_until(
                StdDuration::from_millis(5),
                tokio::time::sleep(StdDuration::from_millis(50)),
            )
            .await;

        assert!(store.get(&old.key()).is_none());
        assert_eq!(store.read_count(&live).await.unwrap(), 1);
    }
}
