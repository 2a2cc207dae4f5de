use crmsim_core::{
    activity::{thinning_factor_for, ActivityType, LifecyclePhase, ScheduleOutcome, SecondaryScheduler},
    circuit::CircuitBreaker,
    clock::ManualClock,
    config::{DelaySpec, InteractionRule, ScenarioConfig, SimConfig, ThinningConfig, TimeUnit},
    kv::{keys, KvStore},
    queue::{JobQueue, PrimaryJob, QueueName, ScenarioStamp},
    store::SimStore,
};
use std::sync::Arc;

const T0: i64 = 1_767_225_600_000;

fn store() -> SimStore {
    let store = SimStore::in_memory_with_clock(Arc::new(ManualClock::new(T0))).unwrap();
    store.migrate().unwrap();
    store
}

fn rule(id: &str, activity: ActivityType, probability: f64) -> InteractionRule {
    InteractionRule {
        id: id.into(),
        phase: LifecyclePhase::ContactCreated,
        activity,
        probability,
        delay: DelaySpec::MeanJitter { mean: 1.0, jitter: 0.0, unit: TimeUnit::Hours },
    }
}

fn scenario(rules: Vec<InteractionRule>, cap: u32, budget: u64) -> ScenarioConfig {
    let mut s = SimConfig::default_test().scenarios["baseline"].clone();
    s.interactions = rules;
    s.per_record_caps.clear();
    s.budgets.clear();
    for activity in ActivityType::ALL {
        s.per_record_caps.insert(activity, cap);
        s.budgets.insert(activity, budget);
    }
    s
}

fn primary(sim: &str, idx: u64) -> PrimaryJob {
    PrimaryJob {
        simulation_id: sim.into(),
        record_index:  idx,
        phase:         LifecyclePhase::ContactCreated,
        scheduled_at:  T0,
        scenario:      ScenarioStamp {
            scenario_id:      "baseline".into(),
            override_version: 0,
            content_hash:     String::new(),
        },
    }
}

#[test]
fn budget_bounds_activities_across_records() {
    let store = store();
    let config = SimConfig::default_test();
    let scenario = scenario(vec![rule("note", ActivityType::Note, 1.0)], 5, 5);
    let scheduler = SecondaryScheduler::new(&store, &config, &scenario);
    scheduler.initialize_budgets("budget").unwrap();

    let mut total = ScheduleOutcome::default();
    for idx in 0..6 {
        let outcome = scheduler.schedule(&primary("budget", idx), T0).unwrap();
        total.scheduled.extend(outcome.scheduled);
        total.budget_exhausted += outcome.budget_exhausted;
    }
    assert_eq!(total.scheduled.len(), 5);
    assert_eq!(total.budget_exhausted, 1);
    assert_eq!(scheduler.remaining_budget("budget", ActivityType::Note).unwrap(), 0);
    // The record that hit the empty budget gave its cap slot back.
    assert_eq!(store.get_i64(&keys::record_cap("budget", 5, "note")).unwrap(), Some(0));
    assert_eq!(store.waiting_count(&[QueueName::Notes]).unwrap(), 5);
    assert_eq!(store.get_i64(&keys::metric("budget", "activities_scheduled")).unwrap(), Some(5));
}

#[test]
fn per_record_cap_holds_across_rules() {
    let store = store();
    let config = SimConfig::default_test();
    let rules = vec![
        rule("call-a", ActivityType::Call, 1.0),
        rule("call-b", ActivityType::Call, 1.0),
        rule("call-c", ActivityType::Call, 1.0),
    ];
    let scenario = scenario(rules, 1, 100);
    let scheduler = SecondaryScheduler::new(&store, &config, &scenario);
    scheduler.initialize_budgets("cap").unwrap();

    let outcome = scheduler.schedule(&primary("cap", 0), T0).unwrap();
    assert_eq!(outcome.scheduled.len(), 1);
    assert_eq!(outcome.capped, 2);
    assert_eq!(store.get_i64(&keys::record_cap("cap", 0, "call")).unwrap(), Some(1));
    assert_eq!(scheduler.remaining_budget("cap", ActivityType::Call).unwrap(), 99);
}

#[test]
fn a_repeated_trigger_schedules_nothing_new() {
    let store = store();
    let config = SimConfig::default_test();
    let scenario = scenario(vec![rule("note", ActivityType::Note, 1.0)], 3, 10);
    let scheduler = SecondaryScheduler::new(&store, &config, &scenario);
    scheduler.initialize_budgets("again").unwrap();

    let first = scheduler.schedule(&primary("again", 0), T0).unwrap();
    assert_eq!(first.scheduled.len(), 1);

    let second = scheduler.schedule(&primary("again", 0), T0).unwrap();
    assert!(second.scheduled.is_empty());
    assert_eq!(second.already_marked, 1);
    assert_eq!(second.capped, 0);

    assert_eq!(scheduler.remaining_budget("again", ActivityType::Note).unwrap(), 9);
    assert_eq!(store.get_i64(&keys::record_cap("again", 0, "note")).unwrap(), Some(1));
    assert_eq!(store.waiting_count(&[QueueName::Notes]).unwrap(), 1);
}

#[test]
fn scheduled_activity_runs_after_its_delay() {
    let store = store();
    let config = SimConfig::default_test();
    let scenario = scenario(vec![rule("note", ActivityType::Note, 1.0)], 3, 10);
    let scheduler = SecondaryScheduler::new(&store, &config, &scenario);
    scheduler.initialize_budgets("delay").unwrap();

    let outcome = scheduler.schedule(&primary("delay", 0), T0).unwrap();
    assert_eq!(outcome.scheduled.len(), 1);
    assert_eq!(outcome.scheduled[0].delay_ms, 3_600_000);
    assert_eq!(outcome.scheduled[0].ordinal, 1);
    assert_eq!(store.next_due_at(&[QueueName::Notes]).unwrap(), Some(T0 + 3_600_000));
}

#[test]
fn zero_probability_never_fires() {
    let store = store();
    let config = SimConfig::default_test();
    let scenario = scenario(vec![rule("never", ActivityType::Task, 0.0)], 5, 5);
    let scheduler = SecondaryScheduler::new(&store, &config, &scenario);
    scheduler.initialize_budgets("never").unwrap();

    for idx in 0..20 {
        let outcome = scheduler.schedule(&primary("never", idx), T0).unwrap();
        assert!(outcome.scheduled.is_empty());
        assert_eq!(outcome.missed, 1);
    }
    assert_eq!(scheduler.remaining_budget("never", ActivityType::Task).unwrap(), 5);
}

#[test]
fn decisions_are_reproducible_for_a_record() {
    let config = SimConfig::default_test();
    let scenario = scenario(
        vec![
            rule("a", ActivityType::Note, 0.5),
            rule("b", ActivityType::Call, 0.5),
            rule("c", ActivityType::Task, 0.5),
        ],
        5,
        1_000,
    );

    let run = || {
        let store = store();
        let scheduler = SecondaryScheduler::new(&store, &config, &scenario);
        scheduler.initialize_budgets("repro").unwrap();
        (0..25)
            .map(|idx| {
                let mut outcome = ScheduleOutcome::default();
                scheduler.decide("repro", idx, LifecyclePhase::ContactCreated, &mut outcome).unwrap()
            })
            .collect::<Vec<_>>()
    };
    assert_eq!(run(), run());
}

#[test]
fn open_breaker_with_zero_penalty_thins_everything() {
    let store = store();
    let config = SimConfig::default_test();
    let mut scenario = scenario(vec![rule("note", ActivityType::Note, 1.0)], 5, 5);
    scenario.thinning = ThinningConfig { tiers: vec![], breaker_penalty: 0.0 };
    let scheduler = SecondaryScheduler::new(&store, &config, &scenario);
    scheduler.initialize_budgets("thin").unwrap();

    let breaker = CircuitBreaker::new(&store, &config.runtime.breaker);
    for _ in 0..config.runtime.breaker.threshold {
        breaker.record_failure(T0).unwrap();
    }

    let outcome = scheduler.schedule(&primary("thin", 0), T0).unwrap();
    assert!(outcome.scheduled.is_empty());
    assert_eq!(outcome.thinned, 1);
    assert_eq!(store.waiting_count(&QueueName::ALL).unwrap(), 0);
    assert_eq!(store.get_i64(&keys::metric("thin", "activities_thinned")).unwrap(), Some(1));
}

#[test]
fn thinning_tiers_and_breaker_penalty() {
    let thinning = ThinningConfig::default();
    assert_eq!(thinning_factor_for(&thinning, 0, false), 1.0);
    assert_eq!(thinning_factor_for(&thinning, 499, false), 1.0);
    assert_eq!(thinning_factor_for(&thinning, 500, false), 0.85);
    assert_eq!(thinning_factor_for(&thinning, 2_500, false), 0.70);
    assert_eq!(thinning_factor_for(&thinning, 6_000, false), 0.50);
    assert_eq!(thinning_factor_for(&thinning, 6_000, true), 0.25);
    assert_eq!(thinning_factor_for(&thinning, 10, true), 0.5);
}

#[test]
fn delay_specs_resolve_to_milliseconds() {
    let hours = DelaySpec::MeanJitter { mean: 2.0, jitter: 1.0, unit: TimeUnit::Hours };
    assert_eq!(hours.resolve_ms(0.5), 7_200_000);
    assert_eq!(hours.resolve_ms(0.0), 3_600_000);

    let days = DelaySpec::Uniform { min: 1.0, max: 3.0, unit: TimeUnit::Days };
    assert_eq!(days.resolve_ms(0.5), 2 * 86_400_000);

    let clamped = DelaySpec::MeanJitter { mean: 0.5, jitter: 2.0, unit: TimeUnit::Hours };
    assert_eq!(clamped.resolve_ms(0.0), 0);
}
