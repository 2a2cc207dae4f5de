//! Wall-clock abstraction. Every timestamp in the engine comes from a Clock.
//!
//! RULE: nothing reads the system time directly.
//! Workers, the rate limiter and the store all take an `Arc<dyn Clock>`,
//! so tests and the fast-forward runner can drive time by hand.

use crate::types::TimestampMs;
use std::sync::atomic::{AtomicI64, Ordering};

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> TimestampMs;
}

/// Real time, via chrono.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> TimestampMs {
        chrono::Utc::now().timestamp_millis()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: TimestampMs) -> Self {
        Self { now: AtomicI64::new(start) }
    }

    pub fn set(&self, t: TimestampMs) {
        self.now.store(t, Ordering::SeqCst);
    }

    /// Advance by `ms`. Returns the new time.
    pub fn advance(&self, ms: i64) -> TimestampMs {
        self.now.fetch_add(ms, Ordering::SeqCst) + ms
    }

    /// Move forward to `t`; never moves backwards.
    pub fn advance_to(&self, t: TimestampMs) -> TimestampMs {
        self.now.fetch_max(t, Ordering::SeqCst).max(t)
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> TimestampMs {
        self.now.load(Ordering::SeqCst)
    }
}

/// Render a timestamp as RFC 3339, for logs and CRM properties.
pub fn format_ms(t: TimestampMs) -> String {
    chrono::DateTime::from_timestamp_millis(t)
        .map(|d| d.to_rfc3339())
        .unwrap_or_else(|| t.to_string())
}
