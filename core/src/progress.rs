//! Progress and per-simulation metrics.
//!
//! RULE: a record index counts toward progress at most once. The counted
//! marker is claimed with set-if-absent before the processed counter moves,
//! so retries, replays and duplicate deliveries never double count.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{
    error::SimResult,
    event::SimEvent,
    kv::{keys, KvStore},
    queue::JobQueue,
    store::SimStore,
    types::{RecordIndex, SimulationId},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CountOutcome {
    /// First count for this index. `completed` is true for the one call that
    /// moved the simulation to COMPLETED.
    Counted { processed: u64, completed: bool },
    AlreadyCounted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub simulation_id: SimulationId,
    pub status:        String,
    pub total_count:   u64,
    pub processed:     u64,
    pub metrics:       BTreeMap<String, i64>,
    pub job_states:    BTreeMap<String, u64>,
}

impl ProgressSnapshot {
    pub fn metric(&self, name: &str) -> i64 {
        self.metrics.get(name).copied().unwrap_or(0)
    }
}

pub struct ProgressTracker<'a> {
    store: &'a SimStore,
}

impl<'a> ProgressTracker<'a> {
    pub fn new(store: &'a SimStore) -> Self {
        Self { store }
    }

    pub fn bump(&self, simulation_id: &str, metric: &str) -> SimResult<i64> {
        self.store.incr_by(&keys::metric(simulation_id, metric), 1, None)
    }

    pub fn metric(&self, simulation_id: &str, metric: &str) -> SimResult<i64> {
        Ok(self.store.get_i64(&keys::metric(simulation_id, metric))?.unwrap_or(0))
    }

    pub fn processed(&self, simulation_id: &str) -> SimResult<u64> {
        Ok(self
            .store
            .get_i64(&keys::processed(simulation_id))?
            .unwrap_or(0)
            .max(0) as u64)
    }

    /// Count `idx` as processed and complete the simulation if it was the last.
    pub fn count(&self, simulation_id: &str, idx: RecordIndex) -> SimResult<CountOutcome> {
        if !self.store.set_nx(&keys::counted(simulation_id, idx), "1", None)? {
            return Ok(CountOutcome::AlreadyCounted);
        }
        let processed = self.store.incr_by(&keys::processed(simulation_id), 1, None)?.max(0) as u64;
        self.store.incr_by(&keys::metric(simulation_id, "processed"), 1, None)?;
        self.store.record_processed_count(simulation_id, processed)?;

        let completed = self.store.complete_simulation_if_done(simulation_id)?;
        if completed {
            self.store.append_event(&SimEvent::SimulationCompleted {
                simulation_id: simulation_id.to_string(),
                processed,
            })?;
            log::info!("Simulation {simulation_id} completed ({processed} records)");
        }
        Ok(CountOutcome::Counted { processed, completed })
    }

    pub fn snapshot(&self, simulation_id: &str) -> SimResult<ProgressSnapshot> {
        let sim = self.store.get_simulation(simulation_id)?;
        let prefix = keys::metric_prefix(simulation_id);
        let metrics = self
            .store
            .scan_prefix(&prefix)?
            .into_iter()
            .filter_map(|(k, v)| {
                let name = k.strip_prefix(&prefix)?.to_string();
                Some((name, v.parse().ok()?))
            })
            .collect();
        Ok(ProgressSnapshot {
            simulation_id: sim.simulation_id.clone(),
            status:        sim.status.to_string(),
            total_count:   sim.total_count,
            processed:     self.processed(simulation_id)?.max(sim.processed_count),
            metrics,
            job_states:    self.store.state_counts(simulation_id)?,
        })
    }
}
