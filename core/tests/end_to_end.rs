//! Whole-pipeline tests: create, start, fast-forward, complete.

use crmsim_core::{
    clock::ManualClock,
    distribution::DistributionMethod,
    engine::SimEngine,
    error::SimError,
    kv::{keys, KvStore},
    queue::{JobQueue, QueueName},
    simulation::{NewSimulation, SimulationStatus},
    worker::{Disposition, JobOutcome},
};
use std::sync::Arc;

const T0: i64 = 1_767_225_600_000; // 2026-01-01T00:00:00Z
const HOUR: i64 = 3_600_000;

fn new_sim(id: &str, n: u64, hours: i64) -> NewSimulation {
    NewSimulation {
        simulation_id:   id.into(),
        owner:           "ops".into(),
        scenario_id:     "baseline".into(),
        method:          DistributionMethod::Linear,
        requested_count: n,
        window_start:    T0,
        window_end:      T0 + hours * HOUR,
    }
}

fn run_until_idle(engine: &SimEngine, clock: &ManualClock) {
    let worker = engine.worker();
    for _ in 0..50_000 {
        worker.drain_due().unwrap();
        match engine.store().next_due_at(&QueueName::ALL).unwrap() {
            Some(t) => {
                clock.advance_to(t);
            }
            None => return,
        }
    }
    panic!("queue never drained");
}

#[test]
fn hundred_linear_records_complete_in_dry_run() {
    let clock = Arc::new(ManualClock::new(T0));
    let engine = SimEngine::build_test(clock.clone()).unwrap();
    engine.create_simulation(&new_sim("e2e", 100, 1)).unwrap();

    let started = engine.start("e2e").unwrap();
    assert_eq!(started.total_count, 100);
    assert_eq!(started.segment_count, 1);
    assert_eq!(started.first_segment_jobs, 100);

    run_until_idle(&engine, &clock);

    let progress = engine.progress("e2e").unwrap();
    assert_eq!(progress.status, "COMPLETED");
    assert_eq!(progress.processed, 100);
    assert_eq!(progress.metric("processed"), 100);
    assert!(progress.metric("dry_run") >= 100);
    assert_eq!(progress.metric("crm_written"), 0);

    let sim = engine.store().get_simulation("e2e").unwrap();
    assert_eq!(sim.status, SimulationStatus::Completed);
    assert_eq!(sim.processed_count, 100);
    assert_eq!(engine.store().event_count("e2e", "simulation_completed").unwrap(), 1);
}

#[test]
fn first_job_is_due_at_its_scheduled_timestamp() {
    let clock = Arc::new(ManualClock::new(T0));
    let engine = SimEngine::build_test(clock.clone()).unwrap();
    engine.create_simulation(&new_sim("due", 100, 1)).unwrap();
    engine.start("due").unwrap();
    let worker = engine.worker();

    clock.set(T0 + 17_999);
    assert!(worker.poll_once().unwrap().is_none(), "nothing is due before t0+18s");

    clock.set(T0 + 18_000);
    let report = worker.poll_once().unwrap().expect("first record due");
    assert_eq!(report.queue, QueueName::Primary);
    assert_eq!(report.disposition, Disposition::Completed { outcome: JobOutcome::DryRun });
    assert_eq!(engine.progress("due").unwrap().processed, 1);

    // The second record is 36s later.
    assert!(worker.poll_once().unwrap().is_none());
    clock.set(T0 + 54_000);
    assert!(worker.poll_once().unwrap().is_some());
}

#[test]
fn zero_records_completes_at_start() {
    let clock = Arc::new(ManualClock::new(T0));
    let engine = SimEngine::build_test(clock).unwrap();
    engine.create_simulation(&new_sim("empty", 0, 1)).unwrap();

    let started = engine.start("empty").unwrap();
    assert_eq!(started.segment_count, 0);
    assert_eq!(engine.store().get_simulation("empty").unwrap().status, SimulationStatus::Completed);
}

#[test]
fn starting_twice_is_rejected() {
    let clock = Arc::new(ManualClock::new(T0));
    let engine = SimEngine::build_test(clock).unwrap();
    engine.create_simulation(&new_sim("twice", 10, 1)).unwrap();
    engine.start("twice").unwrap();

    let err = engine.start("twice").unwrap_err();
    assert!(matches!(err, SimError::InvalidStatus { action: "start", .. }), "got {err}");
}

#[test]
fn unknown_scenario_and_simulation_are_errors() {
    let clock = Arc::new(ManualClock::new(T0));
    let engine = SimEngine::build_test(clock).unwrap();

    let mut sim = new_sim("nope", 10, 1);
    sim.scenario_id = "does-not-exist".into();
    assert!(matches!(engine.create_simulation(&sim), Err(SimError::UnknownScenario { .. })));
    assert!(matches!(engine.start("ghost"), Err(SimError::SimulationNotFound { .. })));
}

#[test]
fn soft_abort_lets_queued_work_drain_but_stops_expansion() {
    let clock = Arc::new(ManualClock::new(T0));
    let engine = SimEngine::build_test(clock.clone()).unwrap();
    engine.create_simulation(&new_sim("soft", 30, 3)).unwrap();
    engine.start("soft").unwrap();

    let report = engine.abort("soft", false).unwrap();
    assert_eq!(report.purged, 0);
    assert_eq!(engine.store().get(&keys::aborted("soft")).unwrap().as_deref(), Some("1"));

    run_until_idle(&engine, &clock);

    let status = engine.segment_status("soft").unwrap();
    assert_eq!(status.segments.len(), 3);
    assert!(status.segments[0].expanded);
    assert!(!status.segments[1].expanded);
    assert!(!status.segments[2].expanded);
    assert_eq!(status.processed, 10);
    assert_eq!(engine.store().event_count("soft", "segment_expansion_skipped").unwrap(), 1);
    assert_eq!(engine.store().get_simulation("soft").unwrap().status, SimulationStatus::Aborted);
}

#[test]
fn force_abort_purges_waiting_jobs() {
    let clock = Arc::new(ManualClock::new(T0));
    let engine = SimEngine::build_test(clock).unwrap();
    engine.create_simulation(&new_sim("force", 30, 3)).unwrap();
    engine.start("force").unwrap();

    let report = engine.abort("force", true).unwrap();
    assert!(report.force);
    assert_eq!(report.purged, 10);
    assert_eq!(engine.store().waiting_count(&QueueName::ALL).unwrap(), 0);
}

#[test]
fn aborting_a_finished_simulation_is_rejected() {
    let clock = Arc::new(ManualClock::new(T0));
    let engine = SimEngine::build_test(clock.clone()).unwrap();
    engine.create_simulation(&new_sim("done", 5, 1)).unwrap();
    engine.start("done").unwrap();
    run_until_idle(&engine, &clock);

    assert!(matches!(engine.abort("done", false), Err(SimError::InvalidStatus { action: "abort", .. })));

    engine.create_simulation(&new_sim("aborted", 5, 1)).unwrap();
    engine.abort("aborted", false).unwrap();
    assert!(engine.abort("aborted", true).is_err());
}

#[test]
fn dispatch_wraps_results_and_errors() {
    use crmsim_core::command::OperatorCommand;

    let clock = Arc::new(ManualClock::new(T0));
    let engine = SimEngine::build_test(clock).unwrap();
    engine.create_simulation(&new_sim("ipc", 10, 1)).unwrap();

    let cmd: OperatorCommand = serde_json::from_str(r#"{"cmd":"start","simulation_id":"ipc"}"#).unwrap();
    let ok = engine.dispatch(cmd);
    assert_eq!(ok["ok"], true);
    assert_eq!(ok["result"]["total_count"], 10);

    let cmd: OperatorCommand = serde_json::from_str(r#"{"cmd":"segment_status","simulation_id":"ipc"}"#).unwrap();
    let status = engine.dispatch(cmd);
    assert_eq!(status["result"]["segments"].as_array().map(|s| s.len()), Some(1));

    let err = engine.dispatch(OperatorCommand::Progress { simulation_id: "missing".into() });
    assert_eq!(err["ok"], false);
    assert!(err["error"].as_str().unwrap().contains("missing"));
}

#[test]
fn a_start_that_cannot_queue_records_fails_the_simulation() {
    let clock = Arc::new(ManualClock::new(T0));
    let engine = SimEngine::build_test(clock.clone()).unwrap();
    engine.create_simulation(&new_sim("broken", 10, 1)).unwrap();
    engine
        .store()
        .run_script("CREATE TRIGGER reject_jobs BEFORE INSERT ON job BEGIN SELECT RAISE(ABORT, 'queue unavailable'); END;")
        .unwrap();

    assert!(engine.start("broken").is_err());
    assert_eq!(engine.store().get_simulation("broken").unwrap().status, SimulationStatus::Failed);
    assert_eq!(engine.store().event_count("broken", "simulation_failed").unwrap(), 1);
    assert_eq!(engine.store().state_counts("broken").unwrap().get("waiting").copied(), None);
    assert_eq!(engine.store().get(&keys::segment_claim("broken", 0)).unwrap(), None);

    // FAILED is terminal.
    assert!(engine.abort("broken", true).is_err());
}
