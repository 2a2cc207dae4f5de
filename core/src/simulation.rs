//! The Simulation record: the durable row every other component hangs off.

use serde::{Deserialize, Serialize};

use crate::{
    distribution::DistributionMethod,
    types::{OverrideVersion, SimulationId, TimestampMs},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SimulationStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl SimulationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Aborted => "ABORTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(Self::Queued),
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "ABORTED" => Some(Self::Aborted),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }
}

impl std::fmt::Display for SimulationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the outside world hands us when it queues a simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSimulation {
    pub simulation_id:   SimulationId,
    pub owner:           String,
    pub scenario_id:     String,
    pub method:          DistributionMethod,
    pub requested_count: u64,
    pub window_start:    TimestampMs,
    pub window_end:      TimestampMs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Simulation {
    pub simulation_id:    SimulationId,
    pub owner:            String,
    pub scenario_id:      String,
    pub method:           DistributionMethod,
    pub requested_count:  u64,
    /// Record count after the lead-volume multiplier; fixed at start.
    pub total_count:      u64,
    pub window_start:     TimestampMs,
    pub window_end:       TimestampMs,
    pub status:           SimulationStatus,
    pub override_version: OverrideVersion,
    pub override_hash:    String,
    pub processed_count:  u64,
    /// Effective scenario JSON captured at start.
    pub scenario_json:    Option<String>,
    pub created_at:       TimestampMs,
    pub started_at:       Option<TimestampMs>,
    pub finished_at:      Option<TimestampMs>,
}
