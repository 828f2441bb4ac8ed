//! Core rate limiter implementation.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use super::backend::{CounterKey, CounterStore};
use super::quota::{Endpoint, QuotaRegistry};
use super::window::{window_end, window_start, Clock, SystemClock};

/// HTTP status route handlers should use for a quota rejection.
pub const QUOTA_EXCEEDED_STATUS: u16 = 429;

/// The outcome of a quota check. Produced fresh on every call, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitResult {
    /// Whether the call may proceed
    pub allowed: bool,
    /// Calls left in the window; `None` means unlimited
    pub remaining: Option<u64>,
    /// When the current window ends
    pub reset_at: DateTime<Utc>,
    /// Calls already recorded in the window
    pub current: u64,
    /// Calls allowed per window; `None` means unlimited
    pub limit: Option<u64>,
}

impl RateLimitResult {
    fn unlimited(now: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            remaining: None,
            reset_at: now + Duration::hours(24),
            current: 0,
            limit: None,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.limit.is_none()
    }

    /// The rejection to surface to the caller, if this result denies the call.
    pub fn rejection(&self, endpoint: Endpoint, now: DateTime<Utc>) -> Option<QuotaExceeded> {
        if self.allowed {
            return None;
        }
        Some(QuotaExceeded {
            endpoint,
            limit: self.limit?,
            reset_at: self.reset_at,
            retry_after_secs: (self.reset_at - now).num_seconds().max(0) as u64,
        })
    }
}

/// A call denied because the caller's quota for the window is used up.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("quota of {limit} for {endpoint} exhausted, resets at {reset_at}")]
pub struct QuotaExceeded {
    pub endpoint: Endpoint,
    pub limit: u64,
    pub reset_at: DateTime<Utc>,
    /// Seconds until `reset_at`, for a `Retry-After` header
    pub retry_after_secs: u64,
}

impl QuotaExceeded {
    /// HTTP status for the rejection response.
    pub fn status_code(&self) -> u16 {
        QUOTA_EXCEEDED_STATUS
    }
}

/// Why `RateLimiter::admit` did not return the work's output.
#[derive(Debug, Error)]
pub enum AdmissionError<E> {
    /// Over quota; the work was not started.
    #[error(transparent)]
    Rejected(QuotaExceeded),
    /// The work ran and failed; no usage was recorded.
    #[error("admitted operation failed: {0}")]
    Failed(E),
}

/// Per-user, per-endpoint quota enforcement over a shared counter store.
///
/// Checking never mutates and recording never re-checks. Storage failures
/// never reach the caller: reads fail open and writes are dropped.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    registry: QuotaRegistry,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, registry: QuotaRegistry) -> Self {
        Self {
            store,
            registry,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Decide whether `user_id` may call `endpoint` now.
    ///
    /// Privileged callers get an unlimited result without any storage access.
    pub async fn check_quota(
        &self,
        user_id: Uuid,
        endpoint: Endpoint,
        is_privileged: bool,
    ) -> RateLimitResult {
        let now = self.clock.now();

        // Privileged callers bypass accounting entirely
        if is_privileged {
            return RateLimitResult::unlimited(now);
        }

        let policy = match self.registry.policy_for(endpoint) {
            Ok(policy) => policy,
            Err(e) => {
                error!(user_id = %user_id, endpoint = %endpoint, error = %e, "No quota policy, allowing call");
                return RateLimitResult::unlimited(now);
            }
        };

        // Counters are keyed by the aligned window, not by the call time
        let start = window_start(now, policy.window_minutes);
        let reset_at = window_end(start, policy.window_minutes);
        let key = CounterKey::new(user_id, endpoint, start);

        trace!(key = %key, limit = policy.limit, "Checking quota");

        // A failed read fails open with the full quota
        let current = match self.store.read_count(&key).await {
            Ok(count) => count,
            Err(e) => {
                warn!(
                    key = %key,
                    error = %e,
                    "Counter read failed, allowing call with full quota"
                );
                return RateLimitResult {
                    allowed: true,
                    remaining: Some(policy.limit),
                    reset_at,
                    current: 0,
                    limit: Some(policy.limit),
                };
            }
        };

        let allowed = current < policy.limit;
        if !allowed {
            debug!(
                key = %key,
                count = current,
                limit = policy.limit,
                "Quota exhausted"
            );
        }

        RateLimitResult {
            allowed,
            remaining: Some(policy.limit.saturating_sub(current)),
            reset_at,
            current,
            limit: Some(policy.limit),
        }
    }

    /// Count one completed call against the caller's quota.
    ///
    /// Never fails: a lost increment only under-counts.
    pub async fn record_usage(&self, user_id: Uuid, endpoint: Endpoint, is_privileged: bool) {
        if is_privileged {
            trace!(user_id = %user_id, endpoint = %endpoint, "Privileged caller, not recording usage");
            return;
        }

        let policy = match self.registry.policy_for(endpoint) {
            Ok(policy) => policy,
            Err(e) => {
                error!(user_id = %user_id, endpoint = %endpoint, error = %e, "No quota policy, usage not recorded");
                return;
            }
        };

        let key = CounterKey::new(
            user_id,
            endpoint,
            window_start(self.clock.now(), policy.window_minutes),
        );

        // A failed write is logged, never returned
        if let Err(e) = self.store.increment_count(&key).await {
            error!(
                key = %key,
                strategy = %self.store.strategy(),
                error = %e,
                "Failed to record usage"
            );
        }
    }

    /// Check every registered endpoint for one caller.
    pub async fn status_for_all_endpoints(
        &self,
        user_id: Uuid,
        is_privileged: bool,
    ) -> BTreeMap<Endpoint, RateLimitResult> {
        let checks = self.registry.endpoints().map(|endpoint| async move {
            (endpoint, self.check_quota(user_id, endpoint, is_privileged).await)
        });

        futures::future::join_all(checks).await.into_iter().collect()
    }

    /// Run `work` under the caller's quota.
    ///
    /// Checks first and rejects without polling `work` when over quota.
    /// Usage is recorded once, only after `work` returns `Ok`. Dropping the
    /// returned future before `work` completes records nothing.
    pub async fn admit<T, E, F>(
        &self,
        user_id: Uuid,
        endpoint: Endpoint,
        is_privileged: bool,
        work: F,
    ) -> Result<T, AdmissionError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        let status = self.check_quota(user_id, endpoint, is_privileged).await;
        if let Some(rejection) = status.rejection(endpoint, self.clock.now()) {
            debug!(
                user_id = %user_id,
                endpoint = %endpoint,
                reset_at = %rejection.reset_at,
                "Rejecting call over quota"
            );
            return Err(AdmissionError::Rejected(rejection));
        }

        // Failed work is not counted against the caller
        let output = work.await.map_err(AdmissionError::Failed)?;
        self.record_usage(user_id, endpoint, is_privileged).await;
        Ok(output)
    }
}
