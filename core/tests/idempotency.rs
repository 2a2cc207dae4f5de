//! A record's side effects happen once, however many times its job is
//! delivered.

use crmsim_core::{
    activity::{ActivityType, LifecyclePhase},
    clock::ManualClock,
    config::{ConfigHandle, DelaySpec, InteractionRule, SimConfig, TimeUnit},
    crm::{Collaborators, CrmClient, CrmError, CrmObject, CrmOperation, CrmRecord, Properties, StaticCredentials},
    distribution::DistributionMethod,
    engine::SimEngine,
    error::ErrorCategory,
    kv::{keys, KvStore},
    queue::{JobPayload, JobQueue, NewJob, PrimaryJob, QueueName, ScenarioStamp},
    simulation::NewSimulation,
    store::SimStore,
    worker::{Disposition, JobOutcome},
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const T0: i64 = 1_767_225_600_000;
const HOUR: i64 = 3_600_000;
/// The only timestamp of a one-record linear schedule over an hour.
const ONLY_TS: i64 = T0 + HOUR / 2;

fn one_record(id: &str) -> NewSimulation {
    NewSimulation {
        simulation_id:   id.into(),
        owner:           "ops".into(),
        scenario_id:     "baseline".into(),
        method:          DistributionMethod::Linear,
        requested_count: 1,
        window_start:    T0,
        window_end:      T0 + HOUR,
    }
}

fn duplicate_of_record_zero(sim: &str, stamp: &ScenarioStamp) -> NewJob {
    NewJob {
        queue:   QueueName::Primary,
        payload: JobPayload::Primary(PrimaryJob {
            simulation_id: sim.into(),
            record_index:  0,
            phase:         LifecyclePhase::ContactCreated,
            scheduled_at:  ONLY_TS,
            scenario:      stamp.clone(),
        }),
        run_at:  ONLY_TS,
        policy:  SimConfig::default_test().policy_for(QueueName::Primary),
    }
}

#[test]
fn duplicate_delivery_counts_once() {
    let clock = Arc::new(ManualClock::new(T0));
    let engine = SimEngine::build_test(clock.clone()).unwrap();
    engine.create_simulation(&one_record("dup")).unwrap();
    let started = engine.start("dup").unwrap();
    engine.store().enqueue(&duplicate_of_record_zero("dup", &started.scenario)).unwrap();

    clock.set(ONLY_TS);
    engine.worker().drain_due().unwrap();

    let progress = engine.progress("dup").unwrap();
    assert_eq!(progress.processed, 1);
    assert_eq!(progress.metric("skipped_duplicate"), 1);
    assert_eq!(progress.metric("dry_run"), 1);
    assert_eq!(progress.status, "COMPLETED");
    assert_eq!(engine.store().event_count("dup", "simulation_completed").unwrap(), 1);
}

#[test]
fn a_retried_job_reenters_its_own_claim() {
    let clock = Arc::new(ManualClock::new(ONLY_TS));
    let engine = SimEngine::build_test(clock.clone()).unwrap();
    engine.create_simulation(&one_record("retry")).unwrap();
    let started = engine.start("retry").unwrap();
    let worker = engine.worker();

    let job = engine.store().reserve(&[QueueName::Primary], ONLY_TS, 60_000).unwrap().expect("job due");
    // Running the same attempt again must not see its own claim as a duplicate.
    assert_eq!(worker.execute(&job), Ok(JobOutcome::DryRun));
    assert_eq!(worker.execute(&job), Ok(JobOutcome::DryRun));

    // A different delivery of the same record is a duplicate.
    engine.store().enqueue(&duplicate_of_record_zero("retry", &started.scenario)).unwrap();
    let other = engine.store().reserve(&[QueueName::Primary], ONLY_TS, 60_000).unwrap().expect("duplicate due");
    assert_ne!(other.id, job.id);
    assert_eq!(worker.execute(&other), Ok(JobOutcome::SkippedDuplicate));
}

#[test]
fn concurrent_workers_on_separate_connections_count_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sim.db");
    let path = path.to_str().unwrap();
    let clock = Arc::new(ManualClock::new(T0));

    let store_a = SimStore::open_with_clock(path, clock.clone()).unwrap();
    let store_b = store_a.reopen().unwrap();
    let engine_a = SimEngine::build(
        store_a,
        ConfigHandle::new(SimConfig::default_test()),
        Collaborators::dry_run(),
    )
    .unwrap();
    let engine_b = SimEngine::build(
        store_b,
        ConfigHandle::new(SimConfig::default_test()),
        Collaborators::dry_run(),
    )
    .unwrap();

    engine_a.create_simulation(&one_record("race")).unwrap();
    let started = engine_a.start("race").unwrap();
    for _ in 0..5 {
        engine_b.store().enqueue(&duplicate_of_record_zero("race", &started.scenario)).unwrap();
    }
    clock.set(ONLY_TS);

    let worker_a = engine_a.worker();
    let worker_b = engine_b.worker();
    let a = std::thread::spawn(move || worker_a.drain_due().unwrap());
    let b = std::thread::spawn(move || worker_b.drain_due().unwrap());
    let ran = a.join().unwrap() + b.join().unwrap();
    assert_eq!(ran, 6, "every delivery runs exactly once");

    let progress = engine_a.progress("race").unwrap();
    assert_eq!(progress.processed, 1);
    assert_eq!(progress.metric("skipped_duplicate"), 5);
    assert_eq!(progress.status, "COMPLETED");
    assert_eq!(engine_b.store().event_count("race", "simulation_completed").unwrap(), 1);
}

/// Stalls on its first call, then answers at once.
struct StallsOnce {
    calls: AtomicUsize,
    stall: Duration,
}

impl CrmClient for StallsOnce {
    fn call(&self, _: &str, object: CrmObject, _: CrmOperation, _: &Properties) -> Result<CrmRecord, CrmError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n == 0 {
            std::thread::sleep(self.stall);
        }
        Ok(CrmRecord { id: format!("{}-{n}", object.as_str()), raw: serde_json::Value::Null })
    }
}

#[test]
fn a_timed_out_attempt_that_finishes_late_commits_nothing() {
    let mut config = SimConfig::default_test();
    config.runtime.job_timeout_ms = 100;
    let baseline = config.scenarios.get_mut("baseline").unwrap();
    baseline.interactions = vec![InteractionRule {
        id:          "welcome_note".into(),
        phase:       LifecyclePhase::ContactCreated,
        activity:    ActivityType::Note,
        probability: 1.0,
        delay:       DelaySpec::MeanJitter { mean: 1.0, jitter: 0.0, unit: TimeUnit::Hours },
    }];
    let client = Arc::new(StallsOnce { calls: AtomicUsize::new(0), stall: Duration::from_millis(400) });
    let collaborators = Collaborators::with_client(client.clone(), Arc::new(StaticCredentials::none().with("ops", "token")));

    let clock = Arc::new(ManualClock::new(T0));
    let engine = SimEngine::build_test_with(clock.clone(), config, collaborators).unwrap();
    engine.create_simulation(&one_record("slow")).unwrap();
    engine.start("slow").unwrap();
    let worker = engine.worker();

    clock.set(ONLY_TS);
    let first = worker.poll_once().unwrap().expect("record due");
    assert!(matches!(first.disposition, Disposition::Retried { category: ErrorCategory::Timeout, .. }));
    assert_eq!(engine.circuit_status().unwrap().failures_in_window, 1);

    // Let the abandoned attempt finish its call.
    std::thread::sleep(Duration::from_millis(600));
    assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    let progress = engine.progress("slow").unwrap();
    assert_eq!(progress.metric("crm_written"), 0);
    assert_eq!(progress.metric("activities_scheduled"), 0);
    assert_eq!(engine.store().get(&keys::crm_id("slow", 0)).unwrap(), None);
    assert_eq!(engine.store().waiting_count(&[QueueName::Notes]).unwrap(), 0);

    clock.set(ONLY_TS + 1_000);
    let second = worker.poll_once().unwrap().expect("retry due");
    assert_eq!(
        second.disposition,
        Disposition::Completed { outcome: JobOutcome::Written { crm_id: "contacts-1".into() } }
    );

    let progress = engine.progress("slow").unwrap();
    assert_eq!(progress.processed, 1);
    assert_eq!(progress.metric("crm_written"), 1);
    assert_eq!(progress.metric("activities_scheduled"), 1);
    assert_eq!(engine.store().waiting_count(&[QueueName::Notes]).unwrap(), 1);
}

#[test]
fn a_reservation_abandoned_mid_run_is_delivered_again() {
    let clock = Arc::new(ManualClock::new(ONLY_TS));
    let engine = SimEngine::build_test(clock.clone()).unwrap();
    engine.create_simulation(&one_record("lost")).unwrap();
    engine.start("lost").unwrap();
    let worker = engine.worker();

    // The worker claims and runs the record, then dies before routing it.
    let job = engine.store().reserve(&[QueueName::Primary], ONLY_TS, 60_000).unwrap().expect("job due");
    assert_eq!(worker.execute(&job), Ok(JobOutcome::DryRun));

    assert_eq!(worker.drain_due().unwrap(), 0);
    assert_eq!(engine.progress("lost").unwrap().processed, 0);
    assert_eq!(engine.store().next_due_at(&[QueueName::Primary]).unwrap(), Some(ONLY_TS + 60_000));

    clock.set(ONLY_TS + 60_000);
    let redelivered = worker.poll_once().unwrap().expect("lease ran out");
    assert_eq!(redelivered.job_id, job.id);
    assert_eq!(redelivered.disposition, Disposition::Completed { outcome: JobOutcome::DryRun });

    let progress = engine.progress("lost").unwrap();
    assert_eq!(progress.processed, 1);
    assert_eq!(progress.metric("skipped_duplicate"), 0);
    assert_eq!(progress.status, "COMPLETED");
}
