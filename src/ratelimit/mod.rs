//! Quota enforcement: window alignment, policies, counters and cleanup.

mod backend;
mod limiter;
mod quota;
mod sweeper;
mod window;

pub use backend::{CounterKey, CounterRecord, CounterStore, IncrementStrategy};
pub use limiter::{AdmissionError, QuotaExceeded, RateLimitResult, RateLimiter, QUOTA_EXCEEDED_STATUS};
pub use quota::{
    Endpoint, QuotaPolicy, QuotaRegistry, DEFAULT_CHAT_POLICY, DEFAULT_QUIZ_GENERATION_POLICY,
};
pub use sweeper::{RetentionSweeper, DEFAULT_RETENTION_DAYS};
pub use window::{window_end, window_start, Clock, ManualClock, SystemClock};
