use crmsim_core::{
    clock::{Clock, ManualClock},
    config::{RetryPolicy, SimConfig},
    crm::{Collaborators, CrmClient, CrmError, CrmObject, CrmOperation, CrmRecord, Properties, StaticCredentials},
    distribution::DistributionMethod,
    engine::SimEngine,
    error::{ErrorCategory, SimError},
    kv::{keys, KvStore},
    queue::{JobQueue, QueueName},
    replay::{ReplayItemStatus, ReplayOptions, ReplayOrder, ReplaySelector},
    simulation::NewSimulation,
    store::DeadLetterFilter,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

const T0: i64 = 1_767_225_600_000;
const HOUR: i64 = 3_600_000;

/// Fails calls with scripted errors in order, then succeeds.
struct ScriptedClient {
    script: Mutex<VecDeque<CrmError>>,
}

impl CrmClient for ScriptedClient {
    fn call(&self, _: &str, object: CrmObject, _: CrmOperation, _: &Properties) -> Result<CrmRecord, CrmError> {
        match self.script.lock().unwrap().pop_front() {
            Some(e) => Err(e),
            None => Ok(CrmRecord { id: format!("{}-ok", object.as_str()), raw: serde_json::Value::Null }),
        }
    }
}

/// Three records over an hour whose first calls fail with `errors`, one
/// dead-letter entry each, oldest first.
fn dead_lettered(errors: Vec<CrmError>) -> (SimEngine, Arc<ManualClock>, Vec<String>) {
    let clock = Arc::new(ManualClock::new(T0));
    let collaborators = Collaborators::with_client(
        Arc::new(ScriptedClient { script: Mutex::new(errors.into()) }),
        Arc::new(StaticCredentials::none().with("ops", "token")),
    );
    let engine = SimEngine::build_test_with(clock.clone(), SimConfig::default_test(), collaborators).unwrap();
    engine
        .create_simulation(&NewSimulation {
            simulation_id:   "rp".into(),
            owner:           "ops".into(),
            scenario_id:     "baseline".into(),
            method:          DistributionMethod::Linear,
            requested_count: 3,
            window_start:    T0,
            window_end:      T0 + HOUR,
        })
        .unwrap();
    engine.start("rp").unwrap();
    let worker = engine.worker();
    for minute in [10, 30, 50] {
        clock.set(T0 + minute * 60_000);
        worker.drain_due().unwrap();
    }

    let mut entries = engine
        .store()
        .dead_letters(&DeadLetterFilter { simulation_id: "rp".into(), ..Default::default() })
        .unwrap();
    entries.sort_by_key(|e| e.failed_at);
    let ids = entries.into_iter().map(|e| e.entry_id).collect::<Vec<_>>();
    assert_eq!(ids.len(), 3);
    (engine, clock, ids)
}

fn validation() -> CrmError {
    CrmError::Validation("bad email".into())
}

fn ids(ids: &[&String]) -> ReplaySelector {
    ReplaySelector { ids: ids.iter().map(|s| s.to_string()).collect(), categories: vec![] }
}

#[test]
fn same_entry_twice_in_one_batch_replays_once() {
    let (engine, _clock, entries) = dead_lettered(vec![validation(), validation(), validation()]);
    let report = engine
        .dlq_replay("rp", &ids(&[&entries[0], &entries[0]]), &ReplayOptions::live("alice"))
        .unwrap();

    assert_eq!(report.selected, 2);
    assert_eq!(report.replayed, 1);
    assert_eq!(report.skipped_duplicate, 1);
    assert_eq!(report.items[1].status, ReplayItemStatus::SkippedDuplicate);
    assert_eq!(engine.store().waiting_count(&[QueueName::Primary]).unwrap(), 1);
}

#[test]
fn rapid_repeat_is_skipped_as_recent() {
    let (engine, _clock, entries) = dead_lettered(vec![validation(), validation(), validation()]);
    let selector = ids(&[&entries[1]]);

    let first = engine.dlq_replay("rp", &selector, &ReplayOptions::live("alice")).unwrap();
    assert_eq!(first.replayed, 1);
    let second = engine.dlq_replay("rp", &selector, &ReplayOptions::live("bob")).unwrap();
    assert_eq!(second.replayed, 0);
    assert_eq!(second.skipped_recent, 1);
    assert_eq!(engine.store().waiting_count(&[QueueName::Primary]).unwrap(), 1);
}

#[test]
fn dry_run_writes_nothing() {
    let (engine, _clock, _entries) = dead_lettered(vec![validation(), validation(), validation()]);
    let report = engine
        .dlq_replay("rp", &ReplaySelector::default(), &ReplayOptions::dry_run("alice"))
        .unwrap();

    assert!(report.dry_run);
    assert_eq!(report.replayed, 3);
    assert!(report.items.iter().all(|i| i.status == ReplayItemStatus::WouldReplay && i.new_job_id.is_none()));
    assert_eq!(engine.store().waiting_count(&QueueName::ALL).unwrap(), 0);
    assert!(engine.store().replay_audits("rp").unwrap().is_empty());
    assert_eq!(engine.store().event_count("rp", "replay_executed").unwrap(), 0);

    // Nothing was marked, so a live run still finds every entry.
    let live = engine.dlq_replay("rp", &ReplaySelector::default(), &ReplayOptions::live("alice")).unwrap();
    assert_eq!(live.replayed, 3);
}

#[test]
fn live_replay_resubmits_once_and_is_audited() {
    let (engine, clock, _entries) = dead_lettered(vec![validation(), validation(), validation()]);
    let report = engine.dlq_replay("rp", &ReplaySelector::default(), &ReplayOptions::live("alice")).unwrap();
    assert_eq!(report.replayed, 3);
    assert!(report.items.iter().all(|i| i.new_job_id.is_some()));

    let audits = engine.store().replay_audits("rp").unwrap();
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].actor, "alice");
    assert_eq!(audits[0].replayed, 3);
    assert_eq!(engine.store().event_count("rp", "replay_executed").unwrap(), 1);

    let unreplayed = engine
        .store()
        .dead_letters(&DeadLetterFilter { simulation_id: "rp".into(), ..Default::default() })
        .unwrap();
    assert!(unreplayed.is_empty());

    let job = engine
        .store()
        .reserve(&[QueueName::Primary], clock.now_ms(), 60_000)
        .unwrap()
        .expect("replayed job is due now");
    assert_eq!(job.policy, RetryPolicy::single_attempt());
}

#[test]
fn replayed_records_write_without_double_counting() {
    let (engine, _clock, _entries) = dead_lettered(vec![validation(), validation(), validation()]);
    assert_eq!(engine.progress("rp").unwrap().processed, 3);

    engine.dlq_replay("rp", &ReplaySelector::default(), &ReplayOptions::live("alice")).unwrap();
    engine.worker().drain_due().unwrap();

    let progress = engine.progress("rp").unwrap();
    assert_eq!(progress.processed, 3);
    assert!(progress.metric("crm_written") >= 3);
    assert_eq!(progress.metric("skipped_duplicate"), 0);
}

#[test]
fn full_retry_policy_uses_the_queue_policy() {
    let (engine, clock, entries) = dead_lettered(vec![validation(), validation(), validation()]);
    let options = ReplayOptions { full_retry_policy: true, ..ReplayOptions::live("alice") };
    engine.dlq_replay("rp", &ids(&[&entries[0]]), &options).unwrap();

    let job = engine.store().reserve(&[QueueName::Primary], clock.now_ms(), 60_000).unwrap().expect("job");
    assert_eq!(job.policy, SimConfig::default_test().policy_for(QueueName::Primary));
}

#[test]
fn selection_order_cap_and_filters() {
    let auth = CrmError::Auth("revoked".into());
    let (engine, _clock, entries) = dead_lettered(vec![validation(), auth, validation()]);

    let capped = ReplayOptions { per_category_cap: Some(1), ..ReplayOptions::dry_run("alice") };
    let report = engine.dlq_replay("rp", &ReplaySelector::default(), &capped).unwrap();
    let picked: Vec<_> = report.items.iter().map(|i| i.entry_id.clone()).collect();
    assert_eq!(picked, vec![entries[0].clone(), entries[1].clone()]);

    let auth_only = ReplaySelector { ids: vec![], categories: vec![ErrorCategory::Auth] };
    let report = engine.dlq_replay("rp", &auth_only, &ReplayOptions::dry_run("alice")).unwrap();
    assert_eq!(report.selected, 1);
    assert_eq!(report.items[0].category, ErrorCategory::Auth);

    let newest = ReplayOptions { order: ReplayOrder::NewestFirst, limit: Some(1), ..ReplayOptions::dry_run("alice") };
    let report = engine.dlq_replay("rp", &ReplaySelector::default(), &newest).unwrap();
    assert_eq!(report.items[0].entry_id, entries[2]);

    let random = ReplayOptions { order: ReplayOrder::Random, ..ReplayOptions::dry_run("alice") };
    let report = engine.dlq_replay("rp", &ReplaySelector::default(), &random).unwrap();
    let mut shuffled: Vec<_> = report.items.iter().map(|i| i.entry_id.clone()).collect();
    shuffled.sort();
    let mut all = entries.clone();
    all.sort();
    assert_eq!(shuffled, all);
}

#[test]
fn explicit_ids_accept_job_ids_and_report_unknowns() {
    let (engine, _clock, entries) = dead_lettered(vec![validation(), validation(), validation()]);
    let entry = engine.store().find_dead_letter("rp", &entries[0]).unwrap().expect("entry");

    let selector = ReplaySelector { ids: vec![entry.job_id.clone(), "nope".into()], categories: vec![] };
    let report = engine.dlq_replay("rp", &selector, &ReplayOptions::dry_run("alice")).unwrap();
    assert_eq!(report.selected, 1);
    assert_eq!(report.items[0].entry_id, entries[0]);
    assert_eq!(report.not_found, vec!["nope".to_string()]);
}

#[test]
fn operator_rate_limit_per_window() {
    let (engine, clock, _entries) = dead_lettered(vec![validation(), validation(), validation()]);
    let selector = ReplaySelector::default();
    for _ in 0..5 {
        engine.dlq_replay("rp", &selector, &ReplayOptions::dry_run("alice")).unwrap();
    }
    let err = engine.dlq_replay("rp", &selector, &ReplayOptions::dry_run("alice")).unwrap_err();
    assert!(matches!(err, SimError::ReplayRateLimited { max: 5, .. }), "got {err}");

    // Limits are per operator.
    engine.dlq_replay("rp", &selector, &ReplayOptions::dry_run("bob")).unwrap();

    clock.advance(60_000);
    engine.dlq_replay("rp", &selector, &ReplayOptions::dry_run("alice")).unwrap();
}

#[test]
fn replay_of_unknown_simulation_fails() {
    let (engine, _clock, _entries) = dead_lettered(vec![validation(), validation(), validation()]);
    let err = engine
        .dlq_replay("missing", &ReplaySelector::default(), &ReplayOptions::live("alice"))
        .unwrap_err();
    assert!(matches!(err, SimError::SimulationNotFound { .. }));
}

#[test]
fn a_replay_that_fails_midway_audits_what_it_resubmitted() {
    let (engine, _clock, entries) = dead_lettered(vec![validation(), validation(), validation()]);
    engine
        .store()
        .run_script(
            r#"CREATE TRIGGER reject_record_1 BEFORE INSERT ON job
               WHEN NEW.queue = 'primary' AND NEW.payload LIKE '%"record_index":1,%'
               BEGIN SELECT RAISE(ABORT, 'queue unavailable'); END;"#,
        )
        .unwrap();

    let options = ReplayOptions { order: ReplayOrder::OldestFirst, ..ReplayOptions::live("alice") };
    assert!(engine.dlq_replay("rp", &ReplaySelector::default(), &options).is_err());

    let audits = engine.store().replay_audits("rp").unwrap();
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].replayed, 1);
    assert!(engine.store().get(&keys::replay_recent(&entries[0])).unwrap().is_some());
    assert_eq!(engine.store().get(&keys::replay_recent(&entries[1])).unwrap(), None);
    assert_eq!(engine.store().waiting_count(&[QueueName::Primary]).unwrap(), 1);

    engine.store().run_script("DROP TRIGGER reject_record_1;").unwrap();
    let report = engine.dlq_replay("rp", &ReplaySelector::default(), &options).unwrap();
    assert_eq!(report.replayed, 2);
    assert_eq!(engine.store().waiting_count(&[QueueName::Primary]).unwrap(), 3);
    assert_eq!(engine.store().replay_audits("rp").unwrap().len(), 2);
}
