//! Admission control in front of the CRM client.
//!
//! A call is admitted only with no active cooldown, the breaker closed,
//! and one token taken from the object type's bucket. A denial is a soft
//! drop; nothing at this layer queues the call for later.
//!
//! Buckets are per (simulation, object type) and refill to full capacity once
//! per cadence epoch. The first admission attempt in a new epoch wins a
//! set-if-absent on the epoch key and performs the refill for everyone.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{
    circuit::CircuitBreaker,
    config::{RuntimeConfig, ScenarioConfig},
    crm::CrmObject,
    error::SimResult,
    kv::{keys, KvStore},
    types::TimestampMs,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Admission {
    Admitted,
    Cooldown { until: TimestampMs },
    BreakerOpen { until: TimestampMs },
    NoToken,
}

impl Admission {
    pub fn is_admitted(self) -> bool {
        matches!(self, Admission::Admitted)
    }

    /// Metric bumped when this denial drops a call.
    pub fn drop_metric(self) -> Option<&'static str> {
        match self {
            Admission::Admitted => None,
            Admission::Cooldown { .. } => Some("dropped_cooldown"),
            Admission::BreakerOpen { .. } => Some("dropped_breaker"),
            Admission::NoToken => Some("dropped_no_token"),
        }
    }
}

pub struct RateLimiter<'a> {
    kv:       &'a dyn KvStore,
    runtime:  &'a RuntimeConfig,
    scenario: &'a ScenarioConfig,
}

impl<'a> RateLimiter<'a> {
    pub fn new(kv: &'a dyn KvStore, runtime: &'a RuntimeConfig, scenario: &'a ScenarioConfig) -> Self {
        Self { kv, runtime, scenario }
    }

    pub fn capacity(&self, object: CrmObject) -> u64 {
        self.scenario
            .rate_limits
            .capacities
            .get(object.as_str())
            .copied()
            .unwrap_or(self.runtime.default_bucket_capacity)
    }

    fn epoch(&self, now: TimestampMs) -> i64 {
        now.div_euclid(self.scenario.rate_limits.refill_interval_ms.max(1))
    }

    /// Fill every bucket of the simulation to capacity.
    pub fn refill(&self, simulation_id: &str) -> SimResult<()> {
        for object in CrmObject::ALL {
            self.kv.set(
                &keys::bucket(simulation_id, object.as_str()),
                &self.capacity(object).to_string(),
                Some(self.runtime.cache_ttl_ms),
            )?;
        }
        Ok(())
    }

    /// Start-of-run setup: full buckets, current epoch already claimed.
    pub fn initialize(&self, simulation_id: &str, now: TimestampMs) -> SimResult<()> {
        self.kv.set(
            &keys::bucket_refill(simulation_id, self.epoch(now)),
            "1",
            Some(self.scenario.rate_limits.refill_interval_ms * 2),
        )?;
        self.refill(simulation_id)
    }

    /// Refill if this is the first look at a new epoch. Returns whether it did.
    pub fn refill_if_due(&self, simulation_id: &str, now: TimestampMs) -> SimResult<bool> {
        let claimed = self.kv.set_nx(
            &keys::bucket_refill(simulation_id, self.epoch(now)),
            "1",
            Some(self.scenario.rate_limits.refill_interval_ms * 2),
        )?;
        if claimed {
            self.refill(simulation_id)?;
        }
        Ok(claimed)
    }

    pub fn try_take(&self, simulation_id: &str, object: CrmObject, now: TimestampMs) -> SimResult<bool> {
        self.refill_if_due(simulation_id, now)?;
        Ok(self
            .kv
            .decr_if_positive(&keys::bucket(simulation_id, object.as_str()))?
            .is_some())
    }

    pub fn tokens(&self, simulation_id: &str, object: CrmObject) -> SimResult<u64> {
        Ok(self
            .kv
            .get_i64(&keys::bucket(simulation_id, object.as_str()))?
            .unwrap_or(0)
            .max(0) as u64)
    }

    pub fn snapshot(&self, simulation_id: &str) -> SimResult<BTreeMap<String, u64>> {
        CrmObject::ALL
            .into_iter()
            .map(|o| Ok((o.as_str().to_string(), self.tokens(simulation_id, o)?)))
            .collect()
    }

    pub fn cooldown_until(&self, now: TimestampMs) -> SimResult<Option<TimestampMs>> {
        Ok(self.kv.get_i64(keys::COOLDOWN_UNTIL)?.filter(|until| *until > now))
    }

    /// Start (or extend) the global cooldown after a rate-limit response.
    pub fn start_cooldown(&self, now: TimestampMs, retry_after_ms: Option<i64>) -> SimResult<TimestampMs> {
        let duration = retry_after_ms
            .filter(|ms| *ms > 0)
            .unwrap_or(self.runtime.default_rate_limit_cooldown_ms);
        let until = now + duration;
        if let Some(current) = self.cooldown_until(now)?.filter(|c| *c >= until) {
            return Ok(current);
        }
        self.kv.set(keys::COOLDOWN_UNTIL, &until.to_string(), Some(duration))?;
        log::warn!("Rate-limit cooldown active until {until}");
        Ok(until)
    }

    pub fn admit(&self, simulation_id: &str, object: CrmObject, now: TimestampMs) -> SimResult<Admission> {
        if let Some(until) = self.cooldown_until(now)? {
            return Ok(Admission::Cooldown { until });
        }
        let breaker = CircuitBreaker::new(self.kv, &self.runtime.breaker);
        if let Some(until) = breaker.tripped_until(now)? {
            return Ok(Admission::BreakerOpen { until });
        }
        if !self.try_take(simulation_id, object, now)? {
            return Ok(Admission::NoToken);
        }
        Ok(Admission::Admitted)
    }
}
