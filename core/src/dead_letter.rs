//! Dead-letter routing, storage and summary.
//!
//! A failed job goes to the dead-letter store iff its category is not
//! retryable or the attempt that just failed was its queue's last. Anything
//! else goes back on the queue with the policy's backoff.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{
    config::DeadLetterConfig,
    error::{ErrorCategory, JobFailure, SimResult},
    event::SimEvent,
    kv::{keys, KvStore},
    queue::{JobQueue, QueueName, QueuedJob},
    store::SimStore,
    types::{JobId, SimulationId, TimestampMs},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub entry_id:        String,
    pub origin_queue:    QueueName,
    pub job_id:          JobId,
    pub simulation_id:   SimulationId,
    /// Full job payload as it was when the job failed.
    pub payload:         serde_json::Value,
    pub category:        ErrorCategory,
    pub retryable:       bool,
    pub message:         String,
    pub failed_at:       TimestampMs,
    pub attempts:        u32,
    pub replayed_at:     Option<TimestampMs>,
    pub replay_batch_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureRoute {
    /// Back on the queue; `attempt` is the number the next run will be.
    Retry { run_at: TimestampMs, attempt: u32 },
    DeadLetter,
}

pub fn route_failure(job: &QueuedJob, failure: &JobFailure, now: TimestampMs) -> FailureRoute {
    if !failure.category.is_retryable() || job.attempts_exhausted_after_current() {
        return FailureRoute::DeadLetter;
    }
    let attempt = job.current_attempt();
    FailureRoute::Retry {
        run_at:  now + job.policy.backoff_for(attempt),
        attempt: attempt + 1,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterSample {
    pub entry_id:  String,
    pub job_id:    JobId,
    pub queue:     QueueName,
    pub category:  ErrorCategory,
    pub message:   String,
    pub failed_at: TimestampMs,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeadLetterSummary {
    /// Totals per category across every simulation.
    pub global:        BTreeMap<String, i64>,
    pub by_simulation: BTreeMap<SimulationId, BTreeMap<String, i64>>,
    /// Newest first, bounded per simulation.
    pub samples:       BTreeMap<SimulationId, Vec<DeadLetterSample>>,
}

pub struct DeadLetterQueue<'a> {
    store:  &'a SimStore,
    config: &'a DeadLetterConfig,
}

impl<'a> DeadLetterQueue<'a> {
    pub fn new(store: &'a SimStore, config: &'a DeadLetterConfig) -> Self {
        Self { store, config }
    }

    /// Move a terminally failed job into the dead-letter store.
    pub fn record(&self, job: &QueuedJob, failure: &JobFailure) -> SimResult<DeadLetterEntry> {
        let now = self.store.clock().now_ms();
        let entry = DeadLetterEntry {
            entry_id:        uuid::Uuid::new_v4().to_string(),
            origin_queue:    job.queue,
            job_id:          job.id.clone(),
            simulation_id:   job.payload.simulation_id().to_string(),
            payload:         serde_json::to_value(&job.payload)?,
            category:        failure.category,
            retryable:       failure.category.is_retryable(),
            message:         failure.message.clone(),
            failed_at:       now,
            attempts:        job.current_attempt(),
            replayed_at:     None,
            replay_batch_id: None,
        };
        self.store.fail(&job.id, &failure.to_string())?;
        self.store.insert_dead_letter(&entry)?;

        let category = entry.category.as_str();
        let sim_id = &entry.simulation_id;
        self.store.incr_by(&keys::dlq_count(sim_id, category), 1, None)?;
        self.store.incr_by(&keys::dlq_global_count(category), 1, None)?;
        self.store.incr_by(&keys::metric(sim_id, "dead_lettered"), 1, None)?;

        let sample = DeadLetterSample {
            entry_id:  entry.entry_id.clone(),
            job_id:    entry.job_id.clone(),
            queue:     entry.origin_queue,
            category:  entry.category,
            message:   entry.message.clone(),
            failed_at: entry.failed_at,
        };
        let samples_key = keys::dlq_samples(sim_id);
        self.store.zadd(&samples_key, &serde_json::to_string(&sample)?, now, None)?;
        self.store.ztrim_newest(&samples_key, self.config.sample_size)?;

        self.store.append_event(&SimEvent::JobDeadLettered {
            simulation_id: sim_id.clone(),
            entry_id:      entry.entry_id.clone(),
            job_id:        entry.job_id.clone(),
            queue:         entry.origin_queue.to_string(),
            category:      category.to_string(),
        })?;
        log::warn!(
            "Dead-lettered job {} from {} ({}) after {} attempt(s): {}",
            entry.job_id,
            entry.origin_queue,
            category,
            entry.attempts,
            entry.message
        );
        Ok(entry)
    }

    pub fn samples(&self, simulation_id: &str) -> SimResult<Vec<DeadLetterSample>> {
        self.store
            .zrange_desc(&keys::dlq_samples(simulation_id), self.config.sample_size)?
            .into_iter()
            .map(|(member, _)| Ok(serde_json::from_str(&member)?))
            .collect()
    }

    pub fn counts_for(&self, simulation_id: &str) -> SimResult<BTreeMap<String, i64>> {
        let prefix = keys::dlq_count_prefix(simulation_id);
        Ok(self
            .store
            .scan_prefix(&prefix)?
            .into_iter()
            .filter_map(|(k, v)| Some((k.strip_prefix(&prefix)?.to_string(), v.parse().ok()?)))
            .collect())
    }

    /// Counters and samples. `simulation_id = None` covers every simulation.
    pub fn summary(&self, simulation_id: Option<&str>) -> SimResult<DeadLetterSummary> {
        let mut summary = DeadLetterSummary::default();
        for category in ErrorCategory::ALL {
            let n = self
                .store
                .get_i64(&keys::dlq_global_count(category.as_str()))?
                .unwrap_or(0);
            if n > 0 {
                summary.global.insert(category.as_str().to_string(), n);
            }
        }

        let simulations: Vec<String> = match simulation_id {
            Some(id) => vec![id.to_string()],
            None => {
                let mut ids: Vec<String> = self
                    .store
                    .scan_prefix(keys::DLQ_SIM_COUNT_PREFIX)?
                    .into_iter()
                    .filter_map(|(k, _)| {
                        let rest = k.strip_prefix(keys::DLQ_SIM_COUNT_PREFIX)?;
                        rest.rsplit_once(':').map(|(sim, _)| sim.to_string())
                    })
                    .collect();
                ids.dedup();
                ids
            }
        };

        for sim in simulations {
            let counts = self.counts_for(&sim)?;
            if counts.is_empty() {
                continue;
            }
            summary.samples.insert(sim.clone(), self.samples(&sim)?);
            summary.by_simulation.insert(sim, counts);
        }
        Ok(summary)
    }
}
