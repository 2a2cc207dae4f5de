//! Lifecycle events: the durable audit trail of a simulation.
//!
//! RULE: every status transition, segment expansion, dead-lettering and
//! replay is recorded here. Per-job chatter goes to the log, not to events.

use crate::types::{OverrideVersion, SimulationId, TimestampMs};
use serde::{Deserialize, Serialize};

/// Variants are appended over time, never removed or reordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SimEvent {
    SimulationStarted {
        simulation_id:    SimulationId,
        total_count:      u64,
        segment_count:    usize,
        override_version: OverrideVersion,
        override_hash:    String,
    },
    SegmentExpanded {
        simulation_id: SimulationId,
        ordinal:       u32,
        first_idx:     u64,
        last_idx:      u64,
        jobs:          usize,
    },
    SegmentExpansionSkipped {
        simulation_id: SimulationId,
        ordinal:       u32,
        reason:        String,
    },
    SimulationCompleted {
        simulation_id: SimulationId,
        processed:     u64,
    },
    SimulationAborted {
        simulation_id: SimulationId,
        force:         bool,
        purged:        usize,
    },
    JobDeadLettered {
        simulation_id: SimulationId,
        entry_id:      String,
        job_id:        String,
        queue:         String,
        category:      String,
    },
    ReplayExecuted {
        simulation_id:     SimulationId,
        batch_id:          String,
        actor:             String,
        replayed:          usize,
        skipped_duplicate: usize,
        skipped_recent:    usize,
    },
    OverridePublished {
        scenario_id:  String,
        version:      OverrideVersion,
        content_hash: String,
    },
    SimulationFailed {
        simulation_id: SimulationId,
        reason:        String,
        purged:        usize,
    },
}

impl SimEvent {
    /// Stable name for the event_type column.
    pub fn type_name(&self) -> &'static str {
        match self {
            SimEvent::SimulationStarted { .. }       => "simulation_started",
            SimEvent::SegmentExpanded { .. }         => "segment_expanded",
            SimEvent::SegmentExpansionSkipped { .. } => "segment_expansion_skipped",
            SimEvent::SimulationCompleted { .. }     => "simulation_completed",
            SimEvent::SimulationAborted { .. }       => "simulation_aborted",
            SimEvent::JobDeadLettered { .. }         => "job_dead_lettered",
            SimEvent::ReplayExecuted { .. }          => "replay_executed",
            SimEvent::OverridePublished { .. }       => "override_published",
            SimEvent::SimulationFailed { .. }        => "simulation_failed",
        }
    }

    /// The event_log partition this event is filed under.
    pub fn subject(&self) -> String {
        match self {
            SimEvent::SimulationStarted { simulation_id, .. }
            | SimEvent::SegmentExpanded { simulation_id, .. }
            | SimEvent::SegmentExpansionSkipped { simulation_id, .. }
            | SimEvent::SimulationCompleted { simulation_id, .. }
            | SimEvent::SimulationAborted { simulation_id, .. }
            | SimEvent::JobDeadLettered { simulation_id, .. }
            | SimEvent::ReplayExecuted { simulation_id, .. }
            | SimEvent::SimulationFailed { simulation_id, .. } => simulation_id.clone(),
            SimEvent::OverridePublished { scenario_id, .. } => format!("scenario:{scenario_id}"),
        }
    }
}

/// A persisted event log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id:            Option<i64>,
    pub simulation_id: String,
    pub event_type:    String,
    pub payload:       String,
    pub created_at:    TimestampMs,
}
