//! Counter store trait for abstracting in-memory and database persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::quota::Endpoint;
use crate::error::Result;

/// Identifies one request counter: a user's usage of an endpoint in one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub user_id: Uuid,
    pub endpoint: Endpoint,
    /// Canonical window start (see `window::window_start`)
    pub window_start: DateTime<Utc>,
}

impl CounterKey {
    pub fn new(user_id: Uuid, endpoint: Endpoint, window_start: DateTime<Utc>) -> Self {
        Self {
            user_id,
            endpoint,
            window_start,
        }
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}@{}",
            self.user_id,
            self.endpoint,
            self.window_start.to_rfc3339()
        )
    }
}

/// A persisted counter row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterRecord {
    pub user_id: Uuid,
    pub endpoint: Endpoint,
    pub window_start: DateTime<Utc>,
    pub request_count: u64,
    pub updated_at: DateTime<Utc>,
}

impl CounterRecord {
    pub fn key(&self) -> CounterKey {
        CounterKey::new(self.user_id, self.endpoint, self.window_start)
    }
}

/// How a store performs `increment_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncrementStrategy {
    /// Single server-side atomic upsert.
    Atomic,
    /// Read, then update or insert. Used when the atomic primitive is missing.
    BestEffort,
    /// Inspect the store once at startup and pick one of the above.
    #[default]
    Auto,
}

impl fmt::Display for IncrementStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IncrementStrategy::Atomic => f.write_str("atomic"),
            IncrementStrategy::BestEffort => f.write_str("best_effort"),
            IncrementStrategy::Auto => f.write_str("auto"),
        }
    }
}

/// Persistence for request counters.
///
/// Implementations must keep at most one counter per `CounterKey`. Keys are
/// disjoint per user, endpoint and window, so no cross-key locking is needed.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Current count for a key, or 0 when no counter exists.
    async fn read_count(&self, key: &CounterKey) -> Result<u64>;

    /// Add one to the counter for a key, creating it at 1 if absent.
    async fn increment_count(&self, key: &CounterKey) -> Result<()>;

    /// Delete every counter whose window started before `cutoff`.
    ///
    /// Returns the number of counters removed.
    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// The resolved increment strategy in use.
    fn strategy(&self) -> IncrementStrategy;
}
