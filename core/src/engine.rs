//! The simulation engine: operator-facing entry points over the shared
//! worker context.
//!
//! START ORDER (fixed):
//!   1. Resolve the scenario with its latest override, stamp the version
//!   2. QUEUED -> RUNNING with the effective count and scenario snapshot
//!   3. Expand the distribution and plan segments
//!   4. Fill rate buckets and activity budgets
//!   5. Expand segment 0 only; later segments expand as earlier ones close
//!   Any failure after step 2 purges what was queued and marks it FAILED.
//!
//! RULES:
//!   - The engine never executes jobs itself. Workers do.
//!   - All state changes are recorded in the event log.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{
    activity::SecondaryScheduler,
    circuit::{CircuitBreaker, CircuitStatus},
    clock::ManualClock,
    command::OperatorCommand,
    config::{ConfigHandle, ScenarioConfig, SimConfig},
    crm::Collaborators,
    dead_letter::{DeadLetterQueue, DeadLetterSummary},
    error::{SimError, SimResult},
    event::SimEvent,
    kv::{keys, KvStore},
    overrides,
    progress::{ProgressSnapshot, ProgressTracker},
    queue::{JobQueue, ScenarioStamp},
    rate_limit::RateLimiter,
    replay::{ReplayController, ReplayOptions, ReplayReport, ReplaySelector},
    segment::{ExpansionOutcome, SegmentPlanner, SegmentReport},
    simulation::{NewSimulation, Simulation, SimulationStatus},
    store::SimStore,
    worker::{Worker, WorkerContext, WorkerPool},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartReport {
    pub simulation_id:      String,
    pub total_count:        u64,
    pub segment_count:      usize,
    pub first_segment_jobs: usize,
    pub scenario:           ScenarioStamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortReport {
    pub simulation_id: String,
    pub force:         bool,
    pub purged:        usize,
}

pub struct SimEngine {
    ctx: Arc<WorkerContext>,
}

impl SimEngine {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self { ctx }
    }

    /// Migrate the store and wire everything together.
    pub fn build(store: SimStore, config: ConfigHandle, collaborators: Collaborators) -> SimResult<Self> {
        store.migrate()?;
        config.current().validate()?;
        Ok(Self::new(Arc::new(WorkerContext::new(
            Arc::new(store),
            Arc::new(config),
            collaborators,
        ))))
    }

    /// In-memory store, test config, dry-run collaborators, manual clock.
    pub fn build_test(clock: Arc<ManualClock>) -> SimResult<Self> {
        Self::build_test_with(clock, SimConfig::default_test(), Collaborators::dry_run())
    }

    pub fn build_test_with(clock: Arc<ManualClock>, config: SimConfig, collaborators: Collaborators) -> SimResult<Self> {
        let store = SimStore::in_memory_with_clock(clock)?;
        Self::build(store, ConfigHandle::new(config), collaborators)
    }

    pub fn context(&self) -> Arc<WorkerContext> {
        self.ctx.clone()
    }

    pub fn store(&self) -> &SimStore {
        &self.ctx.store
    }

    pub fn config(&self) -> Arc<SimConfig> {
        self.ctx.config.current()
    }

    pub fn worker(&self) -> Worker {
        Worker::new(self.ctx.clone())
    }

    pub fn spawn_pool(&self, concurrency: usize) -> WorkerPool {
        WorkerPool::spawn(self.ctx.clone(), concurrency)
    }

    // ── Operator operations ────────────────────────────────────

    pub fn create_simulation(&self, new: &NewSimulation) -> SimResult<Simulation> {
        if new.window_end < new.window_start {
            return Err(SimError::InvalidConfig(format!(
                "simulation {}: window ends before it starts",
                new.simulation_id
            )));
        }
        self.config().scenario(&new.scenario_id)?;
        self.store().insert_simulation(new)?;
        log::info!(
            "Simulation {} queued: {} x {} over [{}, {}]",
            new.simulation_id,
            new.requested_count,
            new.method.as_str(),
            new.window_start,
            new.window_end
        );
        self.store().get_simulation(&new.simulation_id)
    }

    pub fn start(&self, simulation_id: &str) -> SimResult<StartReport> {
        let config = self.config();
        let store = self.store();
        let sim = store.get_simulation(simulation_id)?;
        if sim.status != SimulationStatus::Queued {
            return Err(SimError::InvalidStatus {
                id:     simulation_id.to_string(),
                actual: sim.status.to_string(),
                action: "start",
            });
        }

        let (scenario, stamp) = overrides::resolve(&config, store, &sim.scenario_id)?;
        let total = scenario.effective_count(sim.requested_count);
        let snapshot = serde_json::to_string(&scenario)?;
        if !store.mark_simulation_running(simulation_id, total, stamp.override_version, &stamp.content_hash, &snapshot)? {
            let actual = store.get_simulation(simulation_id)?.status;
            return Err(SimError::InvalidStatus {
                id:     simulation_id.to_string(),
                actual: actual.to_string(),
                action: "start",
            });
        }
        let sim = store.get_simulation(simulation_id)?;

        match self.launch(&config, &sim, &scenario, &stamp) {
            Ok(report) => Ok(report),
            Err(e) => {
                // RUNNING with nothing scheduled would never finish.
                let purged = store.purge_simulation(simulation_id)?;
                store.mark_simulation_failed(simulation_id, store.clock().now_ms())?;
                store.append_event(&SimEvent::SimulationFailed {
                    simulation_id: simulation_id.to_string(),
                    reason: e.to_string(),
                    purged,
                })?;
                log::error!("Simulation {simulation_id} failed to start: {e}");
                Err(e)
            }
        }
    }

    /// Steps 3-5 of the start order, for a simulation already RUNNING.
    fn launch(
        &self,
        config: &SimConfig,
        sim: &Simulation,
        scenario: &ScenarioConfig,
        stamp: &ScenarioStamp,
    ) -> SimResult<StartReport> {
        let store = self.store();
        let simulation_id = sim.simulation_id.as_str();
        let total = sim.total_count;
        let planner = SegmentPlanner::new(store, config);
        let segments = planner.plan_simulation(sim)?;
        let now = store.clock().now_ms();
        RateLimiter::new(store, &config.runtime, scenario).initialize(simulation_id, now)?;
        SecondaryScheduler::new(store, config, scenario).initialize_budgets(simulation_id)?;

        store.append_event(&SimEvent::SimulationStarted {
            simulation_id:    simulation_id.to_string(),
            total_count:      total,
            segment_count:    segments.len(),
            override_version: stamp.override_version,
            override_hash:    stamp.content_hash.clone(),
        })?;
        log::info!(
            "Simulation {simulation_id} running: {total} records in {} segment(s), scenario {} v{}",
            segments.len(),
            stamp.scenario_id,
            stamp.override_version
        );

        let first_segment_jobs = match segments.first() {
            Some(first) => match planner.expand(sim, first.ordinal, stamp, "start")? {
                ExpansionOutcome::Expanded { jobs } => jobs,
                _ => 0,
            },
            None => {
                // Nothing to schedule: zero records is already done.
                if store.complete_simulation_if_done(simulation_id)? {
                    store.append_event(&SimEvent::SimulationCompleted {
                        simulation_id: simulation_id.to_string(),
                        processed:     0,
                    })?;
                }
                0
            }
        };

        Ok(StartReport {
            simulation_id: simulation_id.to_string(),
            total_count: total,
            segment_count: segments.len(),
            first_segment_jobs,
            scenario: stamp.clone(),
        })
    }

    pub fn abort(&self, simulation_id: &str, force: bool) -> SimResult<AbortReport> {
        let store = self.store();
        let sim = store.get_simulation(simulation_id)?;
        if sim.status.is_terminal() || !store.abort_simulation(simulation_id)? {
            return Err(SimError::InvalidStatus {
                id:     simulation_id.to_string(),
                actual: store.get_simulation(simulation_id)?.status.to_string(),
                action: "abort",
            });
        }
        store.set(&keys::aborted(simulation_id), "1", None)?;
        let purged = if force { store.purge_simulation(simulation_id)? } else { 0 };

        store.append_event(&SimEvent::SimulationAborted {
            simulation_id: simulation_id.to_string(),
            force,
            purged,
        })?;
        log::info!(
            "Simulation {simulation_id} aborted ({}), {purged} queued job(s) purged",
            if force { "force" } else { "soft" }
        );
        Ok(AbortReport { simulation_id: simulation_id.to_string(), force, purged })
    }

    pub fn dlq_summary(&self, simulation_id: Option<&str>) -> SimResult<DeadLetterSummary> {
        let config = self.config();
        DeadLetterQueue::new(self.store(), &config.runtime.dead_letter).summary(simulation_id)
    }

    pub fn dlq_replay(
        &self,
        simulation_id: &str,
        selector: &ReplaySelector,
        options: &ReplayOptions,
    ) -> SimResult<ReplayReport> {
        self.store().get_simulation(simulation_id)?;
        let config = self.config();
        ReplayController::new(self.store(), &config).replay(simulation_id, selector, options)
    }

    pub fn segment_status(&self, simulation_id: &str) -> SimResult<SegmentReport> {
        let sim = self.store().get_simulation(simulation_id)?;
        let config = self.config();
        SegmentPlanner::new(self.store(), &config).report(&sim)
    }

    pub fn progress(&self, simulation_id: &str) -> SimResult<ProgressSnapshot> {
        ProgressTracker::new(self.store()).snapshot(simulation_id)
    }

    pub fn circuit_status(&self) -> SimResult<CircuitStatus> {
        let config = self.config();
        CircuitBreaker::new(self.store(), &config.runtime.breaker).status(self.store().clock().now_ms())
    }

    pub fn publish_override(&self, scenario_id: &str, overrides: &serde_json::Value) -> SimResult<ScenarioStamp> {
        overrides::publish(&self.config(), self.store(), scenario_id, overrides)
    }

    /// Execute one operator command and wrap the result as a JSON response.
    pub fn dispatch(&self, command: OperatorCommand) -> serde_json::Value {
        let result = match command {
            OperatorCommand::Start { simulation_id } => self.start(&simulation_id).and_then(to_json),
            OperatorCommand::Abort { simulation_id, force } => self.abort(&simulation_id, force).and_then(to_json),
            OperatorCommand::DlqSummary { simulation_id } => {
                self.dlq_summary(simulation_id.as_deref()).and_then(to_json)
            }
            OperatorCommand::DlqReplay { simulation_id, selector, options } => {
                self.dlq_replay(&simulation_id, &selector, &options).and_then(to_json)
            }
            OperatorCommand::SegmentStatus { simulation_id } => self.segment_status(&simulation_id).and_then(to_json),
            OperatorCommand::Progress { simulation_id } => self.progress(&simulation_id).and_then(to_json),
        };
        match result {
            Ok(value) => serde_json::json!({ "ok": true, "result": value }),
            Err(e) => serde_json::json!({ "ok": false, "error": e.to_string() }),
        }
    }
}

fn to_json<T: Serialize>(value: T) -> SimResult<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}
