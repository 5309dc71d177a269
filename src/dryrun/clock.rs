//! Event Time
//!
//! Millisecond event-time model for the dry-run engine. The engine never
//! reads system time: every timestamp it sees comes from an ingested event,
//! and the supervisor tracks a monotone "now" derived from those events for
//! cross-symbol log timestamping.

use chrono::{TimeZone, Utc};

/// Milliseconds since Unix epoch.
pub type Millis = i64;

pub const MILLIS_PER_SEC: i64 = 1_000;
pub const MILLIS_PER_MIN: i64 = 60_000;
pub const MILLIS_PER_HOUR: i64 = 3_600_000;

/// Floor a timestamp to the start of the interval that contains it.
/// `interval_ms` must be positive.
#[inline]
pub fn floor_to_interval(ts_ms: Millis, interval_ms: i64) -> Millis {
    debug_assert!(interval_ms > 0);
    ts_ms - ts_ms.rem_euclid(interval_ms)
}

/// UTC day key for daily file rotation, e.g. `20260801`.
pub fn utc_day_key(ts_ms: Millis) -> String {
    match Utc.timestamp_millis_opt(ts_ms).single() {
        Some(dt) => dt.format("%Y%m%d").to_string(),
        None => "invalid".to_string(),
    }
}

/// Monotone event clock owned by the supervisor. Advances only forward;
/// ingest of an older timestamp leaves it unchanged.
#[derive(Debug, Clone, Default)]
pub struct EventClock {
    now_ms: Millis,
}

impl EventClock {
    pub fn new() -> Self {
        Self { now_ms: 0 }
    }

    /// Current event time (0 until the first observation).
    #[inline]
    pub fn now_ms(&self) -> Millis {
        self.now_ms
    }

    /// Observe a timestamp; the clock never moves backward.
    #[inline]
    pub fn observe(&mut self, ts_ms: Millis) {
        if ts_ms > self.now_ms {
            self.now_ms = ts_ms;
        }
    }
}
