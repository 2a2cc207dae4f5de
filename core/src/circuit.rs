//! Sliding-window circuit breaker shared by every worker.
//!
//! Failure timestamps live in a scored set in the KV store. The breaker trips
//! when the window holds `threshold` failures and stays tripped until its
//! cooldown timestamp passes. Only time decay shrinks the window; successes
//! do not clear it.

use serde::{Deserialize, Serialize};

use crate::{
    config::BreakerConfig,
    error::SimResult,
    kv::{keys, KvStore},
    types::TimestampMs,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitStatus {
    pub tripped:           bool,
    pub tripped_until:     Option<TimestampMs>,
    pub failures_in_window: usize,
    pub threshold:         u32,
}

pub struct CircuitBreaker<'a> {
    kv:     &'a dyn KvStore,
    config: &'a BreakerConfig,
}

impl<'a> CircuitBreaker<'a> {
    pub fn new(kv: &'a dyn KvStore, config: &'a BreakerConfig) -> Self {
        Self { kv, config }
    }

    /// Record one failure at `now`. Returns true if this failure tripped it.
    pub fn record_failure(&self, now: TimestampMs) -> SimResult<bool> {
        let member = format!("{now}:{}", uuid::Uuid::new_v4());
        self.kv.zadd(keys::CIRCUIT_FAILURES, &member, now, Some(self.config.window_ms))?;
        let failures = self.failures_in_window(now)?;

        if failures < self.config.threshold as usize || self.is_tripped(now)? {
            return Ok(false);
        }
        let until = now + self.config.cooldown_ms;
        let tripped = self.kv.set_nx(
            keys::CIRCUIT_TRIPPED_UNTIL,
            &until.to_string(),
            Some(self.config.cooldown_ms),
        )?;
        if tripped {
            log::warn!(
                "Circuit breaker tripped: {failures} failures within {}ms, open until {until}",
                self.config.window_ms
            );
        }
        Ok(tripped)
    }

    /// Trim the window and count what is left.
    pub fn failures_in_window(&self, now: TimestampMs) -> SimResult<usize> {
        self.kv.zrem_by_score(keys::CIRCUIT_FAILURES, now - self.config.window_ms)?;
        self.kv.zcard(keys::CIRCUIT_FAILURES)
    }

    pub fn tripped_until(&self, now: TimestampMs) -> SimResult<Option<TimestampMs>> {
        Ok(self
            .kv
            .get_i64(keys::CIRCUIT_TRIPPED_UNTIL)?
            .filter(|until| *until > now))
    }

    pub fn is_tripped(&self, now: TimestampMs) -> SimResult<bool> {
        Ok(self.tripped_until(now)?.is_some())
    }

    pub fn status(&self, now: TimestampMs) -> SimResult<CircuitStatus> {
        let tripped_until = self.tripped_until(now)?;
        Ok(CircuitStatus {
            tripped: tripped_until.is_some(),
            tripped_until,
            failures_in_window: self.failures_in_window(now)?,
            threshold: self.config.threshold,
        })
    }
}
