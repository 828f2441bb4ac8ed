//! Fixed-window alignment and the clock used to drive it.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

const MINUTES_PER_HOUR: u32 = 60;
const MINUTES_PER_DAY: u32 = 1440;
const SECS_PER_HOUR: i64 = 3600;
const SECS_PER_DAY: i64 = 86_400;

/// Compute the canonical start of the window containing `now`.
///
/// Windows of a day or longer align to midnight UTC, windows of an hour or
/// longer align to the top of the UTC hour, and shorter windows are carved
/// out of the current hour in `window_minutes` steps.
pub fn window_start(now: DateTime<Utc>, window_minutes: u32) -> DateTime<Utc> {
    let secs = now.timestamp();

    let into_window = if window_minutes >= MINUTES_PER_DAY {
        secs.rem_euclid(SECS_PER_DAY)
    } else if window_minutes >= MINUTES_PER_HOUR {
        secs.rem_euclid(SECS_PER_HOUR)
    } else {
        let step = i64::from(window_minutes.max(1));
        let into_hour = secs.rem_euclid(SECS_PER_HOUR);
        let minute = into_hour / 60;
        into_hour - (minute / step) * step * 60
    };

    now - Duration::seconds(into_window)
        - Duration::nanoseconds(i64::from(now.timestamp_subsec_nanos()))
}

/// End of a window: its start plus the configured duration.
///
/// This is additive and is not re-aligned, so for multi-day or multi-hour
/// windows it can differ from the start of the next aligned window.
pub fn window_end(window_start: DateTime<Utc>, window_minutes: u32) -> DateTime<Utc> {
    window_start + Duration::minutes(i64::from(window_minutes))
}

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock in UTC.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = *now + by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
