use serde::{Deserialize, Serialize};

use crate::{
    replay::{ReplayOptions, ReplaySelector},
    types::SimulationId,
};

/// Operator-issued commands.
/// Variants are appended over time, never removed or reordered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum OperatorCommand {
    // ── Lifecycle ─────────────────────────────────
    Start {
        simulation_id: SimulationId,
    },
    Abort {
        simulation_id: SimulationId,
        #[serde(default)]
        force:         bool,
    },

    // ── Dead letters ──────────────────────────────
    DlqSummary {
        #[serde(default)]
        simulation_id: Option<SimulationId>,
    },
    DlqReplay {
        simulation_id: SimulationId,
        #[serde(default)]
        selector:      ReplaySelector,
        options:       ReplayOptions,
    },

    // ── Inspection ────────────────────────────────
    SegmentStatus {
        simulation_id: SimulationId,
    },
    Progress {
        simulation_id: SimulationId,
    },
}
