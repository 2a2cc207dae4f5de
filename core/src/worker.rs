//! Execution worker and worker pool.
//!
//! EXECUTION ORDER for a primary job (fixed):
//!   1. Idempotency claim on (simulation, override version, index[, phase]),
//!      held by this attempt of the job
//!   2. Credential lookup; none means dry-run
//!   3. Admission (cooldown, breaker, token)
//!   4. CRM call through normalizer + client, bounded by the call timeout
//!   5. Lifecycle transitions and secondary activities
//!   6. Routing: complete / retry / dead-letter
//!   7. Progress count and segment-completion check
//!
//! RULES:
//!   - Steps 1-5 run on a helper thread bounded by the job timeout. A timed
//!     out attempt is cancelled: it commits nothing after its next check.
//!   - Lifecycle and activity decisions are marked per record and phase, so
//!     a re-run phase decides nothing new.
//!   - Progress for a first-phase record advances on success, drop, dry-run
//!     and terminal failure alike. Only a retry defers it.
//!   - Failure classification comes from the CrmError variant, never text.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::{
    activity::{LifecyclePhase, SecondaryScheduler},
    circuit::CircuitBreaker,
    config::{ConfigHandle, ScenarioConfig, SimConfig},
    content::ContentContext,
    crm::{call_with_timeout, Collaborators, CrmError, CrmObject, CrmOperation, Properties},
    dead_letter::{route_failure, DeadLetterQueue, FailureRoute},
    error::{ErrorCategory, JobFailure, SimResult},
    kv::{keys, KvStore},
    overrides,
    progress::{CountOutcome, ProgressTracker},
    queue::{ActivityJob, JobPayload, JobQueue, NewJob, PrimaryJob, QueueName, QueuedJob, ScenarioStamp},
    rate_limit::{Admission, RateLimiter},
    rng::{RecordRng, RngSlot},
    segment::{ExpansionOutcome, SegmentPlanner},
    simulation::Simulation,
    store::SimStore,
    types::{JobId, RecordIndex, TimestampMs},
};

/// Shared wiring for every worker thread.
pub struct WorkerContext {
    pub store:         Arc<SimStore>,
    pub config:        Arc<ConfigHandle>,
    pub collaborators: Collaborators,
}

impl WorkerContext {
    pub fn new(store: Arc<SimStore>, config: Arc<ConfigHandle>, collaborators: Collaborators) -> Self {
        Self { store, config, collaborators }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Written { crm_id: String },
    DryRun,
    SkippedDuplicate,
    Dropped { reason: String },
    SegmentExpanded { jobs: usize },
    ExpansionSkipped { reason: String },
}

impl JobOutcome {
    /// Whether the job's record-level bookkeeping (progress) should advance.
    fn settles_record(&self) -> bool {
        matches!(self, JobOutcome::Written { .. } | JobOutcome::DryRun | JobOutcome::Dropped { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum Disposition {
    Completed { outcome: JobOutcome },
    Retried { attempt: u32, run_at: TimestampMs, category: ErrorCategory },
    DeadLettered { entry_id: String, category: ErrorCategory },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id:      JobId,
    pub queue:       QueueName,
    pub disposition: Disposition,
}

type JobResult = Result<JobOutcome, JobFailure>;

fn attempt_token(job: &QueuedJob) -> String {
    format!("{}#{}", job.id, job.current_attempt())
}

/// One run of a job: the claim token it holds and its cancel flag.
#[derive(Debug, Clone)]
pub struct Attempt {
    token:     String,
    cancelled: Arc<AtomicBool>,
}

impl Attempt {
    pub fn new(job: &QueuedJob) -> Self {
        Self {
            token:     attempt_token(job),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Checked before every side effect.
    fn ensure_live(&self) -> Result<(), JobFailure> {
        if self.is_cancelled() {
            return Err(JobFailure::timeout(format!("attempt {} cancelled after the job timeout", self.token)));
        }
        Ok(())
    }

    /// Whether `holder` is an earlier attempt of the same job.
    fn supersedes(&self, holder: &str) -> bool {
        let (Some((held_job, held)), Some((job, own))) = (holder.rsplit_once('#'), self.token.rsplit_once('#')) else {
            return false;
        };
        match (held.parse::<u32>(), own.parse::<u32>()) {
            (Ok(held), Ok(own)) => held_job == job && held < own,
            _ => false,
        }
    }
}

fn crm_failure(e: &CrmError) -> JobFailure {
    JobFailure::new(e.category(), e.to_string())
}

#[derive(Clone)]
pub struct Worker {
    ctx:    Arc<WorkerContext>,
    queues: Vec<QueueName>,
}

impl Worker {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self { ctx, queues: QueueName::ALL.to_vec() }
    }

    /// A worker that only consumes the given queues.
    pub fn for_queues(ctx: Arc<WorkerContext>, queues: &[QueueName]) -> Self {
        Self { ctx, queues: queues.to_vec() }
    }

    fn store(&self) -> &SimStore {
        &self.ctx.store
    }

    fn now(&self) -> TimestampMs {
        self.ctx.store.clock().now_ms()
    }

    /// Reserve, run and route one due job. None when nothing is due.
    pub fn poll_once(&self) -> SimResult<Option<JobReport>> {
        let lease_ms = self.ctx.config.current().runtime.job_lease_ms;
        let Some(job) = self.store().reserve(&self.queues, self.now(), lease_ms)? else {
            return Ok(None);
        };
        let result = self.process(&job);
        self.route(&job, result).map(Some)
    }

    /// Run every job that is due right now, including jobs that become due
    /// while draining. Returns how many ran.
    pub fn drain_due(&self) -> SimResult<usize> {
        let mut ran = 0;
        while self.poll_once()?.is_some() {
            ran += 1;
        }
        Ok(ran)
    }

    /// Run the job on a helper thread, bounded by the job timeout. On timeout
    /// the attempt is cancelled and counted against the circuit breaker.
    pub fn process(&self, job: &QueuedJob) -> JobResult {
        let config = self.ctx.config.current();
        let timeout = Duration::from_millis(config.runtime.job_timeout_ms);
        let attempt = Attempt::new(job);
        let (tx, rx) = mpsc::channel();
        let worker = self.clone();
        let owned = job.clone();
        let running = attempt.clone();
        std::thread::spawn(move || {
            let _ = tx.send(worker.run(&owned, &running));
        });
        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                attempt.cancel();
                log::warn!("Job {} on {} exceeded {}ms", job.id, job.queue, timeout.as_millis());
                if !matches!(job.payload, JobPayload::ExpandSegment { .. }) {
                    if let Err(e) = CircuitBreaker::new(self.store(), &config.runtime.breaker).record_failure(self.now()) {
                        log::error!("Breaker update for job {} failed: {e}", job.id);
                    }
                }
                Err(JobFailure::timeout(format!("job exceeded {}ms", timeout.as_millis())))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(JobFailure::new(ErrorCategory::Unknown, "job thread panicked"))
            }
        }
    }

    /// Run the job body with no timeout.
    pub fn execute(&self, job: &QueuedJob) -> JobResult {
        self.run(job, &Attempt::new(job))
    }

    fn run(&self, job: &QueuedJob, attempt: &Attempt) -> JobResult {
        let config = self.ctx.config.current();
        match &job.payload {
            JobPayload::Primary(primary) => self.execute_primary(&config, primary, attempt),
            JobPayload::Activity(activity) => self.execute_activity(&config, activity, attempt),
            JobPayload::ExpandSegment { simulation_id, ordinal } => {
                let sim = self.store().get_simulation(simulation_id)?;
                let stamp = ScenarioStamp {
                    scenario_id:      sim.scenario_id.clone(),
                    override_version: sim.override_version,
                    content_hash:     sim.override_hash.clone(),
                };
                attempt.ensure_live()?;
                let outcome = SegmentPlanner::new(self.store(), &config).expand(&sim, *ordinal, &stamp, &job.id)?;
                match outcome {
                    ExpansionOutcome::Expanded { jobs } => Ok(JobOutcome::SegmentExpanded { jobs }),
                    // Not expanded yet and held by someone else: look again later.
                    ExpansionOutcome::AlreadyClaimed => Err(JobFailure::new(
                        ErrorCategory::Unknown,
                        format!("segment {ordinal} of {simulation_id} is claimed by another expansion"),
                    )),
                    other => Ok(JobOutcome::ExpansionSkipped { reason: format!("{other:?}") }),
                }
            }
        }
    }

    // ── Shared steps ───────────────────────────────────────────

    fn load(&self, simulation_id: &str) -> Result<(Simulation, ScenarioConfig), JobFailure> {
        let Some(sim) = self.store().find_simulation(simulation_id)? else {
            return Err(JobFailure::new(
                ErrorCategory::Validation,
                format!("simulation {simulation_id} does not exist"),
            ));
        };
        let Some(json) = sim.scenario_json.as_deref() else {
            return Err(JobFailure::new(
                ErrorCategory::Validation,
                format!("simulation {simulation_id} has no scenario snapshot"),
            ));
        };
        let scenario = serde_json::from_str(json).map_err(|e| {
            JobFailure::new(ErrorCategory::Validation, format!("bad scenario snapshot: {e}"))
        })?;
        Ok((sim, scenario))
    }

    fn note_if_stale(&self, sim: &Simulation, stamp: &ScenarioStamp) -> SimResult<()> {
        let current = overrides::current_stamp(self.store(), &stamp.scenario_id)?;
        if current.override_version > stamp.override_version {
            log::warn!(
                "Job for {} runs under scenario {} v{} but v{} is current",
                sim.simulation_id,
                stamp.scenario_id,
                stamp.override_version,
                current.override_version
            );
            self.metric(&sim.simulation_id, "stale_override")?;
        }
        Ok(())
    }

    fn metric(&self, simulation_id: &str, name: &str) -> SimResult<()> {
        ProgressTracker::new(self.store()).bump(simulation_id, name)?;
        Ok(())
    }

    /// Claim `key` for this attempt. A key held by this attempt counts as
    /// claimed; a key held by an earlier attempt of the same job is taken over.
    fn claim(&self, key: &str, attempt: &Attempt, ttl_ms: i64) -> SimResult<bool> {
        if self.store().set_nx(key, &attempt.token, Some(ttl_ms))? {
            return Ok(true);
        }
        match self.store().get(key)? {
            Some(holder) if holder == attempt.token => Ok(true),
            Some(holder) if attempt.supersedes(&holder) => {
                log::info!("{key}: attempt {} takes over from {holder}", attempt.token);
                self.store().set(key, &attempt.token, Some(ttl_ms))?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn admit(&self, sim: &Simulation, scenario: &ScenarioConfig, config: &SimConfig, object: CrmObject) -> SimResult<Admission> {
        let limiter = RateLimiter::new(self.store(), &config.runtime, scenario);
        let admission = limiter.admit(&sim.simulation_id, object, self.now())?;
        if let Some(metric) = admission.drop_metric() {
            log::debug!("{}: {} call dropped ({metric})", sim.simulation_id, object.as_str());
            self.metric(&sim.simulation_id, metric)?;
        }
        Ok(admission)
    }

    /// Make the call and fold a failure back into cooldown and breaker state.
    /// A cancelled attempt drops the result, whatever it was.
    #[allow(clippy::too_many_arguments)]
    fn call(
        &self,
        config: &SimConfig,
        scenario: &ScenarioConfig,
        attempt: &Attempt,
        token: &str,
        object: CrmObject,
        operation: CrmOperation,
        properties: Properties,
    ) -> JobResult {
        let collab = &self.ctx.collaborators;
        let properties = collab.normalizer.normalize(object, properties);
        let timeout = Duration::from_millis(config.runtime.call_timeout_ms);
        attempt.ensure_live()?;
        let result = call_with_timeout(&collab.client, token, object, operation, properties, timeout);
        attempt.ensure_live()?;
        match result {
            Ok(record) => Ok(JobOutcome::Written { crm_id: record.id }),
            Err(e) => {
                let now = self.now();
                if let CrmError::RateLimited { retry_after_ms, .. } = &e {
                    RateLimiter::new(self.store(), &config.runtime, scenario).start_cooldown(now, *retry_after_ms)?;
                }
                CircuitBreaker::new(self.store(), &config.runtime.breaker).record_failure(now)?;
                Err(crm_failure(&e))
            }
        }
    }

    // ── Primary jobs ───────────────────────────────────────────

    fn execute_primary(&self, config: &SimConfig, primary: &PrimaryJob, attempt: &Attempt) -> JobResult {
        let (sim, scenario) = self.load(&primary.simulation_id)?;
        self.note_if_stale(&sim, &primary.scenario)?;

        let idem = primary_idempotency_key(primary);
        if !self.claim(&idem, attempt, config.runtime.idempotency_ttl_ms)? {
            log::debug!("{}#{} {} already claimed", sim.simulation_id, primary.record_index, primary.phase.as_str());
            self.metric(&sim.simulation_id, "skipped_duplicate")?;
            return Ok(JobOutcome::SkippedDuplicate);
        }

        let outcome = match self.ctx.collaborators.credentials.token_for(&sim.owner) {
            None => {
                self.metric(&sim.simulation_id, "dry_run")?;
                JobOutcome::DryRun
            }
            Some(token) => {
                let (object, operation) = primary.phase.crm_target();
                attempt.ensure_live()?;
                let admission = self.admit(&sim, &scenario, config, object)?;
                if !admission.is_admitted() {
                    return Ok(JobOutcome::Dropped {
                        reason: admission.drop_metric().unwrap_or("dropped").to_string(),
                    });
                }
                let properties = self.primary_properties(&sim, primary)?;
                let outcome = self.call(config, &scenario, attempt, &token, object, operation, properties)?;
                if let JobOutcome::Written { crm_id } = &outcome {
                    if primary.phase == LifecyclePhase::ContactCreated {
                        self.store().set(
                            &keys::crm_id(&sim.simulation_id, primary.record_index),
                            crm_id,
                            Some(config.runtime.cache_ttl_ms),
                        )?;
                    }
                    self.metric(&sim.simulation_id, "crm_written")?;
                }
                outcome
            }
        };

        attempt.ensure_live()?;
        let trigger_at = self.now().max(primary.scheduled_at);
        self.advance_lifecycle(config, &scenario, primary, trigger_at)?;
        SecondaryScheduler::new(self.store(), config, &scenario).schedule(primary, trigger_at)?;
        Ok(outcome)
    }

    fn primary_properties(&self, sim: &Simulation, primary: &PrimaryJob) -> SimResult<Properties> {
        let ctx = ContentContext {
            simulation_id: &sim.simulation_id,
            record_index:  primary.record_index,
            scenario_id:   &sim.scenario_id,
            occurred_at:   primary.scheduled_at,
        };
        let content = &self.ctx.collaborators.content;
        let contact_id = self.contact_id(&sim.simulation_id, primary.record_index)?;
        Ok(match primary.phase {
            LifecyclePhase::ContactCreated => content.contact(&ctx),
            LifecyclePhase::Mql | LifecyclePhase::Regression => {
                let mut props = Properties::new();
                if let Some(id) = contact_id {
                    props.insert("id".into(), id.into());
                }
                props.insert("lifecyclestage".into(), primary.phase.lifecycle_stage().into());
                props
            }
            LifecyclePhase::DealWon | LifecyclePhase::DealLost => {
                let mut props = content.deal(&ctx, primary.phase);
                if let Some(id) = contact_id {
                    props.insert("associated_contact_id".into(), id.into());
                }
                props
            }
        })
    }

    fn contact_id(&self, simulation_id: &str, idx: RecordIndex) -> SimResult<Option<String>> {
        self.store().get(&keys::crm_id(simulation_id, idx))
    }

    /// At most one transition fires per completed phase: transitions out of a
    /// phase split the unit interval in configuration order. The decision is
    /// taken once per record and phase.
    fn advance_lifecycle(
        &self,
        config: &SimConfig,
        scenario: &ScenarioConfig,
        primary: &PrimaryJob,
        trigger_at: TimestampMs,
    ) -> SimResult<Option<LifecyclePhase>> {
        let decided = keys::lifecycle_decided(&primary.simulation_id, primary.record_index, primary.phase.as_str());
        if !self.store().set_nx(&decided, "1", Some(config.runtime.idempotency_ttl_ms))? {
            log::debug!("{}#{}: {} already advanced", primary.simulation_id, primary.record_index, primary.phase.as_str());
            return Ok(None);
        }
        let mut rng = RecordRng::for_phase(
            &primary.simulation_id,
            primary.record_index,
            RngSlot::Lifecycle,
            primary.phase.salt(),
        );
        let draw = rng.next_f64();
        let delay_draw = rng.next_f64();

        let mut bound = 0.0;
        for transition in scenario.transitions_from(primary.phase) {
            bound += transition.probability;
            if draw >= bound {
                continue;
            }
            let run_at = trigger_at + transition.delay.resolve_ms(delay_draw);
            self.store().enqueue(&NewJob {
                queue:   QueueName::Primary,
                payload: JobPayload::Primary(PrimaryJob {
                    simulation_id: primary.simulation_id.clone(),
                    record_index:  primary.record_index,
                    phase:         transition.to,
                    scheduled_at:  run_at,
                    scenario:      primary.scenario.clone(),
                }),
                run_at,
                policy:  config.policy_for(QueueName::Primary),
            })?;
            log::debug!(
                "{}#{}: {} -> {} at {run_at}",
                primary.simulation_id,
                primary.record_index,
                primary.phase.as_str(),
                transition.to.as_str()
            );
            return Ok(Some(transition.to));
        }
        Ok(None)
    }

    // ── Activity jobs ──────────────────────────────────────────

    fn execute_activity(&self, config: &SimConfig, activity: &ActivityJob, attempt: &Attempt) -> JobResult {
        let (sim, scenario) = self.load(&activity.simulation_id)?;
        self.note_if_stale(&sim, &activity.scenario)?;

        let idem = activity_idempotency_key(activity);
        if !self.claim(&idem, attempt, config.runtime.idempotency_ttl_ms)? {
            self.metric(&sim.simulation_id, "skipped_duplicate")?;
            return Ok(JobOutcome::SkippedDuplicate);
        }

        let Some(token) = self.ctx.collaborators.credentials.token_for(&sim.owner) else {
            self.metric(&sim.simulation_id, "dry_run")?;
            return Ok(JobOutcome::DryRun);
        };
        let object = activity.activity.crm_object();
        attempt.ensure_live()?;
        let admission = self.admit(&sim, &scenario, config, object)?;
        if !admission.is_admitted() {
            return Ok(JobOutcome::Dropped {
                reason: admission.drop_metric().unwrap_or("dropped").to_string(),
            });
        }

        let ctx = ContentContext {
            simulation_id: &sim.simulation_id,
            record_index:  activity.record_index,
            scenario_id:   &sim.scenario_id,
            occurred_at:   self.now(),
        };
        let mut properties = self
            .ctx
            .collaborators
            .content
            .engagement(&ctx, activity.activity, activity.ordinal);
        if let Some(id) = self.contact_id(&sim.simulation_id, activity.record_index)? {
            properties.insert("associated_contact_id".into(), id.into());
        }
        let outcome = self.call(config, &scenario, attempt, &token, object, CrmOperation::Create, properties)?;
        self.metric(&sim.simulation_id, "crm_written")?;
        Ok(outcome)
    }

    // ── Routing ────────────────────────────────────────────────

    /// Settle a finished job with the queue and every shared counter.
    pub fn route(&self, job: &QueuedJob, result: JobResult) -> SimResult<JobReport> {
        let config = self.ctx.config.current();
        let disposition = match result {
            Ok(outcome) => {
                self.store().complete(&job.id)?;
                if outcome.settles_record() {
                    self.settle_record(&config, job)?;
                }
                Disposition::Completed { outcome }
            }
            Err(failure) => {
                let sim_id = job.payload.simulation_id();
                self.metric(sim_id, &format!("failed_{}", failure.category))?;
                match route_failure(job, &failure, self.now()) {
                    FailureRoute::Retry { run_at, attempt } => {
                        self.release_claim(job)?;
                        self.store().retry(&job.id, run_at, &failure.to_string())?;
                        log::debug!("Job {} retry #{attempt} at {run_at}: {failure}", job.id);
                        Disposition::Retried { attempt, run_at, category: failure.category }
                    }
                    FailureRoute::DeadLetter => {
                        let entry = DeadLetterQueue::new(self.store(), &config.runtime.dead_letter).record(job, &failure)?;
                        self.release_claim(job)?;
                        self.settle_record(&config, job)?;
                        Disposition::DeadLettered { entry_id: entry.entry_id, category: failure.category }
                    }
                }
            }
        };
        Ok(JobReport { job_id: job.id.clone(), queue: job.queue, disposition })
    }

    fn release_claim(&self, job: &QueuedJob) -> SimResult<()> {
        let key = match &job.payload {
            JobPayload::Primary(p) => primary_idempotency_key(p),
            JobPayload::Activity(a) => activity_idempotency_key(a),
            JobPayload::ExpandSegment { .. } => return Ok(()),
        };
        if self.store().get(&key)?.as_deref() == Some(attempt_token(job).as_str()) {
            self.store().del(&key)?;
        }
        Ok(())
    }

    /// Count a first-phase record and, if it closed its segment, queue the
    /// next segment's expansion.
    fn settle_record(&self, config: &SimConfig, job: &QueuedJob) -> SimResult<()> {
        let JobPayload::Primary(primary) = &job.payload else {
            return Ok(());
        };
        if !primary.phase.counts_toward_progress() {
            return Ok(());
        }
        let sim_id = &primary.simulation_id;
        if let CountOutcome::AlreadyCounted = ProgressTracker::new(self.store()).count(sim_id, primary.record_index)? {
            return Ok(());
        }

        let Some(sim) = self.store().find_simulation(sim_id)? else {
            return Ok(());
        };
        let planner = SegmentPlanner::new(self.store(), config);
        let Some(segment) = planner.segment_ending_at(&sim, primary.record_index)? else {
            return Ok(());
        };
        let next = segment.ordinal + 1;
        if planner.segments(&sim)?.iter().any(|s| s.ordinal == next) {
            self.store().enqueue(&NewJob {
                queue:   QueueName::Control,
                payload: JobPayload::ExpandSegment { simulation_id: sim_id.clone(), ordinal: next },
                run_at:  self.now(),
                policy:  config.policy_for(QueueName::Control),
            })?;
            log::debug!("Segment {} of {sim_id} closed; expansion of {next} queued", segment.ordinal);
        }
        Ok(())
    }
}

pub fn primary_idempotency_key(job: &PrimaryJob) -> String {
    keys::idempotency(
        &job.simulation_id,
        job.scenario.override_version,
        job.record_index,
        job.phase.idempotency_suffix(),
    )
}

pub fn activity_idempotency_key(job: &ActivityJob) -> String {
    keys::activity_idempotency(&job.simulation_id, job.record_index, job.activity.as_str(), job.ordinal)
}

// ── Pool ───────────────────────────────────────────────────────────

/// N polling threads over one shared context.
pub struct WorkerPool {
    stop:    Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(ctx: Arc<WorkerContext>, concurrency: usize) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let poll = Duration::from_millis(ctx.config.current().runtime.poll_interval_ms.max(1));
        let handles = (0..concurrency.max(1))
            .map(|n| {
                let worker = Worker::new(ctx.clone());
                let stop = stop.clone();
                std::thread::spawn(move || {
                    log::debug!("Worker {n} started");
                    while !stop.load(Ordering::SeqCst) {
                        match worker.poll_once() {
                            Ok(Some(_)) => {}
                            Ok(None) => std::thread::sleep(poll),
                            Err(e) => {
                                log::error!("Worker {n}: {e}");
                                std::thread::sleep(poll);
                            }
                        }
                    }
                    log::debug!("Worker {n} stopped");
                })
            })
            .collect();
        Self { stop, handles }
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Signal every thread and wait for them to finish their current job.
    pub fn shutdown(self) {
        self.stop.store(true, Ordering::SeqCst);
        for handle in self.handles {
            if handle.join().is_err() {
                log::error!("Worker thread panicked");
            }
        }
    }
}
