//! Record lifecycle phases, secondary activity types, and the scheduler that
//! turns a completed phase into follow-on engagement jobs.
//!
//! Budgets and per-record caps are shared counters in the KV store.
//! Every fire decision goes through an atomic increment or
//! decrement-if-positive; nothing here keeps a local count.

use serde::{Deserialize, Serialize};

use crate::{
    circuit::CircuitBreaker,
    config::{ScenarioConfig, SimConfig, ThinningConfig},
    crm::{CrmObject, CrmOperation},
    error::SimResult,
    kv::{keys, KvStore},
    queue::{ActivityJob, JobPayload, JobQueue, NewJob, PrimaryJob, QueueName},
    rng::{RecordRng, RngSlot},
    store::SimStore,
    types::{RecordIndex, TimestampMs},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    Note,
    Call,
    Task,
    Ticket,
}

impl ActivityType {
    pub const ALL: [ActivityType; 4] = [Self::Note, Self::Call, Self::Task, Self::Ticket];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Note => "note",
            Self::Call => "call",
            Self::Task => "task",
            Self::Ticket => "ticket",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.as_str() == s)
    }

    pub fn crm_object(self) -> CrmObject {
        match self {
            Self::Note => CrmObject::Notes,
            Self::Call => CrmObject::Calls,
            Self::Task => CrmObject::Tasks,
            Self::Ticket => CrmObject::Tickets,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    ContactCreated,
    Mql,
    Regression,
    DealWon,
    DealLost,
}

impl LifecyclePhase {
    pub const ALL: [LifecyclePhase; 5] = [
        Self::ContactCreated,
        Self::Mql,
        Self::Regression,
        Self::DealWon,
        Self::DealLost,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ContactCreated => "contact_created",
            Self::Mql => "mql",
            Self::Regression => "regression",
            Self::DealWon => "deal_won",
            Self::DealLost => "deal_lost",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == s)
    }

    /// Only the record's first phase advances simulation progress.
    pub fn counts_toward_progress(self) -> bool {
        self == Self::ContactCreated
    }

    /// Idempotency key suffix. The first phase has none.
    pub fn idempotency_suffix(self) -> Option<&'static str> {
        match self {
            Self::ContactCreated => None,
            other => Some(other.as_str()),
        }
    }

    /// Salt separating each phase's random streams for the same record.
    pub fn salt(self) -> u64 {
        self as u64 + 1
    }

    pub fn crm_target(self) -> (CrmObject, CrmOperation) {
        match self {
            Self::ContactCreated => (CrmObject::Contacts, CrmOperation::Create),
            Self::Mql | Self::Regression => (CrmObject::Contacts, CrmOperation::Update),
            Self::DealWon | Self::DealLost => (CrmObject::Deals, CrmOperation::Create),
        }
    }

    /// CRM lifecycle stage written for this phase.
    pub fn lifecycle_stage(self) -> &'static str {
        match self {
            Self::ContactCreated => "lead",
            Self::Mql => "marketingqualifiedlead",
            Self::Regression => "lead",
            Self::DealWon => "customer",
            Self::DealLost => "other",
        }
    }
}

// ── Scheduling ─────────────────────────────────────────────────────

/// One activity that passed probability, cap and budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedActivity {
    pub rule_id:  String,
    pub activity: ActivityType,
    pub ordinal:  u32,
    pub delay_ms: i64,
}

/// Counts from one scheduling pass, for metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleOutcome {
    pub scheduled:        Vec<ActivityJob>,
    pub missed:           usize,
    pub capped:           usize,
    pub budget_exhausted: usize,
    pub thinned:          usize,
    pub already_marked:   usize,
}

pub struct SecondaryScheduler<'a> {
    store:    &'a SimStore,
    config:   &'a SimConfig,
    scenario: &'a ScenarioConfig,
}

impl<'a> SecondaryScheduler<'a> {
    pub fn new(store: &'a SimStore, config: &'a SimConfig, scenario: &'a ScenarioConfig) -> Self {
        Self { store, config, scenario }
    }

    /// Seed every activity budget for a simulation. Called once at start.
    pub fn initialize_budgets(&self, simulation_id: &str) -> SimResult<()> {
        for activity in ActivityType::ALL {
            let budget = self.scenario.budget_for(activity);
            self.store.set(
                &keys::budget(simulation_id, activity.as_str()),
                &budget.to_string(),
                Some(self.config.runtime.cache_ttl_ms),
            )?;
        }
        Ok(())
    }

    pub fn remaining_budget(&self, simulation_id: &str, activity: ActivityType) -> SimResult<i64> {
        Ok(self
            .store
            .get_i64(&keys::budget(simulation_id, activity.as_str()))?
            .unwrap_or(0))
    }

    /// Evaluate the phase's rules for one record, consuming cap and budget
    /// for each rule that fires. A rule already decided for this record and
    /// phase is skipped before any counter is touched, so re-running a phase
    /// never spends cap or budget twice.
    pub fn decide(
        &self,
        simulation_id: &str,
        record: RecordIndex,
        phase: LifecyclePhase,
        outcome: &mut ScheduleOutcome,
    ) -> SimResult<Vec<PlannedActivity>> {
        let mut decision_rng = RecordRng::for_phase(simulation_id, record, RngSlot::ActivityDecision, phase.salt());
        let mut delay_rng = RecordRng::for_phase(simulation_id, record, RngSlot::ActivityDelay, phase.salt());
        let mut planned = Vec::new();

        for rule in self.scenario.rules_for(phase) {
            // Draw before any counter check so the stream stays aligned.
            let draw = decision_rng.next_f64();
            let delay_draw = delay_rng.next_f64();
            if draw >= rule.probability {
                outcome.missed += 1;
                continue;
            }

            let marker = keys::activity_marker(simulation_id, record, phase.as_str(), &rule.id);
            if !self.store.set_nx(&marker, "1", Some(self.config.runtime.activity_marker_ttl_ms))? {
                outcome.already_marked += 1;
                log::debug!("{simulation_id}#{record}: {} already decided", rule.id);
                continue;
            }

            let cap = self.scenario.cap_for(rule.activity) as i64;
            let cap_key = keys::record_cap(simulation_id, record, rule.activity.as_str());
            let count = self.store.incr_by(&cap_key, 1, Some(self.config.runtime.cache_ttl_ms))?;
            if count > cap {
                self.store.incr_by(&cap_key, -1, None)?;
                outcome.capped += 1;
                log::debug!("{simulation_id}#{record}: {} capped at {cap}", rule.id);
                continue;
            }

            let budget_key = keys::budget(simulation_id, rule.activity.as_str());
            if self.store.decr_if_positive(&budget_key)?.is_none() {
                self.store.incr_by(&cap_key, -1, None)?;
                outcome.budget_exhausted += 1;
                log::debug!("{simulation_id}#{record}: {} budget exhausted", rule.id);
                continue;
            }

            planned.push(PlannedActivity {
                rule_id:  rule.id.clone(),
                activity: rule.activity,
                ordinal:  count as u32,
                delay_ms: rule.delay.resolve_ms(delay_draw),
            });
        }
        Ok(planned)
    }

    /// Retention probability for the current backlog and breaker state.
    pub fn thinning_factor(&self, now: TimestampMs) -> SimResult<f64> {
        let backlog = self.store.waiting_count(&QueueName::ALL)?;
        let breaker_tripped = CircuitBreaker::new(self.store, &self.config.runtime.breaker).is_tripped(now)?;
        Ok(thinning_factor_for(&self.scenario.thinning, backlog, breaker_tripped))
    }

    /// Decide, thin and enqueue the follow-on activities for a completed
    /// primary phase. Activities run `delay_ms` after `trigger_at`.
    pub fn schedule(&self, job: &PrimaryJob, trigger_at: TimestampMs) -> SimResult<ScheduleOutcome> {
        let sim_id = &job.simulation_id;
        let mut outcome = ScheduleOutcome::default();
        let planned = self.decide(sim_id, job.record_index, job.phase, &mut outcome)?;
        if planned.is_empty() {
            self.record_metrics(sim_id, &outcome)?;
            return Ok(outcome);
        }

        let now = self.store.clock().now_ms();
        let factor = self.thinning_factor(now)?;
        let mut thin_rng = RecordRng::for_phase(sim_id, job.record_index, RngSlot::Thinning, job.phase.salt());

        for p in planned {
            if factor < 1.0 && !thin_rng.chance(factor) {
                outcome.thinned += 1;
                log::debug!("{sim_id}#{}: {} thinned (factor {factor:.2})", job.record_index, p.rule_id);
                continue;
            }
            let activity_job = ActivityJob {
                simulation_id: sim_id.clone(),
                record_index:  job.record_index,
                activity:      p.activity,
                ordinal:       p.ordinal,
                rule_id:       p.rule_id,
                delay_ms:      p.delay_ms,
                scenario:      job.scenario.clone(),
            };
            let queue = QueueName::for_activity(p.activity);
            self.store.enqueue(&NewJob {
                queue,
                payload: JobPayload::Activity(activity_job.clone()),
                run_at: trigger_at.max(now) + p.delay_ms,
                policy: self.config.policy_for(queue),
            })?;
            outcome.scheduled.push(activity_job);
        }
        self.record_metrics(sim_id, &outcome)?;
        Ok(outcome)
    }

    fn record_metrics(&self, sim_id: &str, outcome: &ScheduleOutcome) -> SimResult<()> {
        let metrics = [
            ("activities_scheduled", outcome.scheduled.len()),
            ("activities_thinned", outcome.thinned),
            ("activities_capped", outcome.capped),
            ("activities_budget_exhausted", outcome.budget_exhausted),
        ];
        for (name, n) in metrics {
            if n > 0 {
                self.store.incr_by(&keys::metric(sim_id, name), n as i64, None)?;
            }
        }
        Ok(())
    }
}

/// Factor of the highest tier the backlog reaches, times the breaker
/// penalty while the breaker is open.
pub fn thinning_factor_for(config: &ThinningConfig, backlog: u64, breaker_tripped: bool) -> f64 {
    let base = config
        .tiers
        .iter()
        .filter(|t| backlog >= t.min_backlog)
        .max_by_key(|t| t.min_backlog)
        .map(|t| t.factor)
        .unwrap_or(1.0);
    let factor = if breaker_tripped { base * config.breaker_penalty } else { base };
    factor.clamp(0.0, 1.0)
}
