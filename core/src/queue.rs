//! Durable delayed-job queue contract and the job payloads that travel on it.
//!
//! The queue hands a job to one worker at a time, but a job can still run
//! more than once (retries, worker restarts). Idempotency is the worker's
//! problem, not the queue's.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{
    activity::{ActivityType, LifecyclePhase},
    config::RetryPolicy,
    error::SimResult,
    types::{JobId, OverrideVersion, RecordIndex, SimulationId, TimestampMs},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    Primary,
    Notes,
    Calls,
    Tasks,
    Tickets,
    Control,
}

impl QueueName {
    pub const ALL: [QueueName; 6] = [
        Self::Primary,
        Self::Notes,
        Self::Calls,
        Self::Tasks,
        Self::Tickets,
        Self::Control,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Notes => "notes",
            Self::Calls => "calls",
            Self::Tasks => "tasks",
            Self::Tickets => "tickets",
            Self::Control => "control",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|q| q.as_str() == s)
    }

    pub fn for_activity(activity: ActivityType) -> Self {
        match activity {
            ActivityType::Note => Self::Notes,
            ActivityType::Call => Self::Calls,
            ActivityType::Task => Self::Tasks,
            ActivityType::Ticket => Self::Tickets,
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which scenario snapshot a job was scheduled under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioStamp {
    pub scenario_id:      String,
    pub override_version: OverrideVersion,
    pub content_hash:     String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryJob {
    pub simulation_id: SimulationId,
    pub record_index:  RecordIndex,
    pub phase:         LifecyclePhase,
    pub scheduled_at:  TimestampMs,
    pub scenario:      ScenarioStamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityJob {
    pub simulation_id: SimulationId,
    pub record_index:  RecordIndex,
    pub activity:      ActivityType,
    pub ordinal:       u32,
    pub rule_id:       String,
    pub delay_ms:      i64,
    pub scenario:      ScenarioStamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    Primary(PrimaryJob),
    Activity(ActivityJob),
    ExpandSegment { simulation_id: SimulationId, ordinal: u32 },
}

impl JobPayload {
    pub fn simulation_id(&self) -> &str {
        match self {
            JobPayload::Primary(j) => &j.simulation_id,
            JobPayload::Activity(j) => &j.simulation_id,
            JobPayload::ExpandSegment { simulation_id, .. } => simulation_id,
        }
    }

    /// The queue this payload belongs on.
    pub fn home_queue(&self) -> QueueName {
        match self {
            JobPayload::Primary(_) => QueueName::Primary,
            JobPayload::Activity(j) => QueueName::for_activity(j.activity),
            JobPayload::ExpandSegment { .. } => QueueName::Control,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub queue:   QueueName,
    pub payload: JobPayload,
    pub run_at:  TimestampMs,
    pub policy:  RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id:            JobId,
    pub queue:         QueueName,
    pub payload:       JobPayload,
    pub run_at:        TimestampMs,
    pub enqueued_at:   TimestampMs,
    /// Attempts finished before the current one.
    pub attempts_made: u32,
    pub policy:        RetryPolicy,
}

impl QueuedJob {
    /// 1-based number of the attempt now running.
    pub fn current_attempt(&self) -> u32 {
        self.attempts_made + 1
    }

    pub fn attempts_exhausted_after_current(&self) -> bool {
        self.current_attempt() >= self.policy.max_attempts
    }
}

pub trait JobQueue: Send + Sync {
    fn enqueue(&self, job: &NewJob) -> SimResult<JobId>;

    /// Enqueue every job or none of them.
    fn enqueue_batch(&self, jobs: &[NewJob]) -> SimResult<Vec<JobId>>;

    /// Atomically take the earliest due job from any of `queues` and lease it
    /// for `lease_ms`. An active job whose lease ran out (its worker died) is
    /// due again and counts the lost run as an attempt.
    fn reserve(&self, queues: &[QueueName], now: TimestampMs, lease_ms: i64) -> SimResult<Option<QueuedJob>>;

    fn complete(&self, job_id: &str) -> SimResult<()>;

    /// Put the job back as waiting, one attempt further along.
    fn retry(&self, job_id: &str, run_at: TimestampMs, error: &str) -> SimResult<()>;

    /// Terminal failure; the job will not run again.
    fn fail(&self, job_id: &str, error: &str) -> SimResult<()>;

    /// Waiting plus delayed jobs across `queues`.
    fn waiting_count(&self, queues: &[QueueName]) -> SimResult<u64>;

    fn next_due_at(&self, queues: &[QueueName]) -> SimResult<Option<TimestampMs>>;

    /// Delete every waiting or delayed job of a simulation. Returns the count.
    fn purge_simulation(&self, simulation_id: &str) -> SimResult<usize>;

    /// Job counts by state for one simulation.
    fn state_counts(&self, simulation_id: &str) -> SimResult<BTreeMap<String, u64>>;
}
