//! Fast expiring key-value store contract.
//!
//! RULE: every counter shared between workers lives behind this trait and is
//! mutated only through its atomic primitives. Workers are independent
//! processes, so an in-process copy of a counter is never authoritative.

use crate::{error::SimResult, types::TimestampMs};

pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> SimResult<Option<String>>;

    fn get_i64(&self, key: &str) -> SimResult<Option<i64>> {
        Ok(self.get(key)?.and_then(|v| v.parse().ok()))
    }

    /// Unconditional write. `ttl_ms = None` keeps the key until deleted.
    fn set(&self, key: &str, value: &str, ttl_ms: Option<i64>) -> SimResult<()>;

    /// Write only if the key is absent (or expired). Returns whether it won.
    fn set_nx(&self, key: &str, value: &str, ttl_ms: Option<i64>) -> SimResult<bool>;

    fn del(&self, key: &str) -> SimResult<bool>;

    /// Atomic add. A missing key counts as 0; `ttl_ms` applies only on creation.
    fn incr_by(&self, key: &str, delta: i64, ttl_ms: Option<i64>) -> SimResult<i64>;

    /// Atomic decrement that refuses to go below zero.
    /// Returns the new value, or None if the counter was missing or already 0.
    fn decr_if_positive(&self, key: &str) -> SimResult<Option<i64>>;

    /// Add (or re-score) a member of a scored set.
    fn zadd(&self, key: &str, member: &str, score: i64, ttl_ms: Option<i64>) -> SimResult<()>;

    /// Remove every member with score <= `max_score`. Returns how many went.
    fn zrem_by_score(&self, key: &str, max_score: i64) -> SimResult<usize>;

    fn zcard(&self, key: &str) -> SimResult<usize>;

    /// Highest-scored members first.
    fn zrange_desc(&self, key: &str, limit: usize) -> SimResult<Vec<(String, i64)>>;

    /// Keep only the `keep` highest-scored members.
    fn ztrim_newest(&self, key: &str, keep: usize) -> SimResult<usize>;

    /// All live plain keys starting with `prefix`, with their values.
    fn scan_prefix(&self, prefix: &str) -> SimResult<Vec<(String, String)>>;

    /// Drop expired rows. Reads ignore them anyway; this just reclaims space.
    fn purge_expired(&self, now: TimestampMs) -> SimResult<usize>;
}

/// Key layout. Everything the engine writes to the KV store is named here.
pub mod keys {
    use crate::types::{OverrideVersion, RecordIndex};

    pub fn aborted(sim: &str) -> String {
        format!("sim:{sim}:aborted")
    }

    pub fn timestamps(sim: &str) -> String {
        format!("sim:{sim}:timestamps")
    }

    pub fn segments(sim: &str) -> String {
        format!("sim:{sim}:segments")
    }

    pub fn segment_claim(sim: &str, ordinal: u32) -> String {
        format!("sim:{sim}:segment:{ordinal}:claim")
    }

    pub fn segment_expanded(sim: &str, ordinal: u32) -> String {
        format!("sim:{sim}:segment:{ordinal}:expanded")
    }

    pub fn idempotency(sim: &str, version: OverrideVersion, idx: RecordIndex, phase_suffix: Option<&str>) -> String {
        match phase_suffix {
            None => format!("idem:{sim}:{version}:{idx}"),
            Some(phase) => format!("idem:{sim}:{version}:{idx}:{phase}"),
        }
    }

    pub fn activity_idempotency(sim: &str, idx: RecordIndex, activity: &str, ordinal: u32) -> String {
        format!("idem:{sim}:activity:{idx}:{activity}:{ordinal}")
    }

    pub fn counted(sim: &str, idx: RecordIndex) -> String {
        format!("progress:{sim}:counted:{idx}")
    }

    pub fn processed(sim: &str) -> String {
        format!("progress:{sim}:processed")
    }

    pub fn metric(sim: &str, name: &str) -> String {
        format!("metrics:{sim}:{name}")
    }

    pub fn metric_prefix(sim: &str) -> String {
        format!("metrics:{sim}:")
    }

    pub fn crm_id(sim: &str, idx: RecordIndex) -> String {
        format!("record:{sim}:{idx}:crm_id")
    }

    pub fn budget(sim: &str, activity: &str) -> String {
        format!("budget:{sim}:{activity}")
    }

    pub fn record_cap(sim: &str, idx: RecordIndex, activity: &str) -> String {
        format!("cap:{sim}:{idx}:{activity}")
    }

    /// One decision per (record, phase, rule), however often the phase runs.
    pub fn activity_marker(sim: &str, idx: RecordIndex, phase: &str, rule_id: &str) -> String {
        format!("activity:{sim}:{idx}:{phase}:{rule_id}")
    }

    pub fn lifecycle_decided(sim: &str, idx: RecordIndex, phase: &str) -> String {
        format!("lifecycle:{sim}:{idx}:{phase}")
    }

    pub fn bucket(sim: &str, object: &str) -> String {
        format!("bucket:{sim}:{object}")
    }

    pub fn bucket_refill(sim: &str, epoch: i64) -> String {
        format!("bucket:{sim}:refill:{epoch}")
    }

    pub const COOLDOWN_UNTIL: &str = "governor:cooldown_until";
    pub const CIRCUIT_FAILURES: &str = "governor:circuit:failures";
    pub const CIRCUIT_TRIPPED_UNTIL: &str = "governor:circuit:tripped_until";

    pub const DLQ_SIM_COUNT_PREFIX: &str = "dlq:count:sim:";

    pub fn dlq_count(sim: &str, category: &str) -> String {
        format!("{DLQ_SIM_COUNT_PREFIX}{sim}:{category}")
    }

    pub fn dlq_count_prefix(sim: &str) -> String {
        format!("{DLQ_SIM_COUNT_PREFIX}{sim}:")
    }

    pub fn dlq_global_count(category: &str) -> String {
        format!("dlq:count:all:{category}")
    }

    pub fn dlq_samples(sim: &str) -> String {
        format!("dlq:samples:{sim}")
    }

    pub fn replay_recent(entry_id: &str) -> String {
        format!("dlq:replay:recent:{entry_id}")
    }

    pub fn replay_operator(actor: &str, window: i64) -> String {
        format!("dlq:replay:operator:{actor}:{window}")
    }
}
