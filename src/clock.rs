//! Clock used for durable log positions and cleanup deadlines
//!
//! Log positions must never go backward across an NTP step, and every
//! deferred cleanup deadline is widened by the tolerated skew so that a
//! node whose clock runs behind never deletes orphaned ranges early.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Monotonic wall clock with a skew allowance for cleanup waits.
#[derive(Debug)]
pub struct BoundedClock {
    /// Last value handed out by `now_nanos`
    last_ns: AtomicI64,
    skew_margin: Duration,
}

impl BoundedClock {
    pub fn new(skew_margin: Duration) -> Self {
        Self {
            last_ns: AtomicI64::new(0),
            skew_margin,
        }
    }

    /// Nanoseconds since the epoch, strictly increasing per clock.
    pub fn now_nanos(&self) -> i64 {
        let wall = Utc::now().timestamp_nanos_opt().unwrap_or(0);
        let previous = self
            .last_ns
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(wall.max(last.saturating_add(1)))
            })
            .unwrap_or_else(|last| last);
        wall.max(previous.saturating_add(1))
    }

    pub fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.now_nanos())
    }

    /// Deadline for a wait of `wait` begun at `since`, skew margin included.
    pub fn ready_at(&self, since: DateTime<Utc>, wait: Duration) -> DateTime<Utc> {
        let total = wait.saturating_add(self.skew_margin);
        match chrono::Duration::from_std(total) {
            Ok(delta) => since.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC),
            Err(_) => DateTime::<Utc>::MAX_UTC,
        }
    }

    pub fn has_elapsed(&self, since: DateTime<Utc>, wait: Duration) -> bool {
        self.now() >= self.ready_at(since, wait)
    }

    pub fn max_skew(&self) -> Duration {
        self.skew_margin
    }
}

impl Default for BoundedClock {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}
