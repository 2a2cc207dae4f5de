use crate::{
    activity::{ActivityType, LifecyclePhase},
    error::{SimError, SimResult},
    queue::QueueName,
    types::{MS_PER_DAY, MS_PER_HOUR, MS_PER_MINUTE},
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// ── Runtime settings ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub window_ms:   i64,
    pub threshold:   u32,
    pub cooldown_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterConfig {
    pub sample_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    pub recent_ttl_ms:          i64,
    pub max_replays_per_window: u32,
    pub operator_window_ms:     i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub segment_duration_ms:            i64,
    pub job_timeout_ms:                 u64,
    /// How long a reserved job stays invisible before it is handed out again.
    pub job_lease_ms:                   i64,
    pub call_timeout_ms:                u64,
    pub worker_concurrency:             usize,
    pub poll_interval_ms:               u64,
    pub default_bucket_capacity:        u64,
    pub default_rate_limit_cooldown_ms: i64,
    pub idempotency_ttl_ms:             i64,
    pub segment_claim_ttl_ms:           i64,
    pub activity_marker_ttl_ms:         i64,
    pub cache_ttl_ms:                   i64,
    pub breaker:                        BreakerConfig,
    pub dead_letter:                    DeadLetterConfig,
    pub replay:                         ReplayConfig,
}

/// Attempt ceiling and backoff schedule for one queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff_ms:   Vec<i64>,
}

impl RetryPolicy {
    pub fn single_attempt() -> Self {
        Self { max_attempts: 1, backoff_ms: Vec::new() }
    }

    /// Delay before retry number `attempt` (1-based). Reuses the last step
    /// once the schedule runs out.
    pub fn backoff_for(&self, attempt: u32) -> i64 {
        if self.backoff_ms.is_empty() {
            return 0;
        }
        let idx = (attempt.saturating_sub(1) as usize).min(self.backoff_ms.len() - 1);
        self.backoff_ms[idx].max(0)
    }
}

// ── Scenario ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    pub fn ms(self) -> i64 {
        match self {
            Self::Minutes => MS_PER_MINUTE,
            Self::Hours => MS_PER_HOUR,
            Self::Days => MS_PER_DAY,
        }
    }
}

/// How long after its trigger a follow-on job runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DelaySpec {
    MeanJitter { mean: f64, jitter: f64, unit: TimeUnit },
    Uniform { min: f64, max: f64, unit: TimeUnit },
}

impl DelaySpec {
    /// Resolve to milliseconds given a uniform draw `r` in [0,1).
    pub fn resolve_ms(&self, r: f64) -> i64 {
        let (units, unit) = match *self {
            DelaySpec::MeanJitter { mean, jitter, unit } => (mean + jitter * (2.0 * r - 1.0), unit),
            DelaySpec::Uniform { min, max, unit } => (min + (max - min).max(0.0) * r, unit),
        };
        (units.max(0.0) * unit.ms() as f64).round() as i64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Capacity per CRM object type ("contacts", "notes", ...).
    #[serde(default)]
    pub capacities:         BTreeMap<String, u64>,
    pub refill_interval_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleTransition {
    pub from:        LifecyclePhase,
    pub to:          LifecyclePhase,
    pub probability: f64,
    pub delay:       DelaySpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionRule {
    pub id:          String,
    pub phase:       LifecyclePhase,
    pub activity:    ActivityType,
    pub probability: f64,
    pub delay:       DelaySpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinningTier {
    pub min_backlog: u64,
    pub factor:      f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinningConfig {
    #[serde(default)]
    pub tiers:           Vec<ThinningTier>,
    pub breaker_penalty: f64,
}

impl Default for ThinningConfig {
    fn default() -> Self {
        Self {
            tiers: vec![
                ThinningTier { min_backlog: 500, factor: 0.85 },
                ThinningTier { min_backlog: 2_000, factor: 0.70 },
                ThinningTier { min_backlog: 5_000, factor: 0.50 },
            ],
            breaker_penalty: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub scenario_id:            String,
    #[serde(default)]
    pub label:                  String,
    #[serde(default = "default_multiplier")]
    pub lead_volume_multiplier: f64,
    pub rate_limits:            RateLimitConfig,
    #[serde(default)]
    pub lifecycle:              Vec<LifecycleTransition>,
    #[serde(default)]
    pub interactions:           Vec<InteractionRule>,
    #[serde(default)]
    pub per_record_caps:        BTreeMap<ActivityType, u32>,
    #[serde(default)]
    pub budgets:                BTreeMap<ActivityType, u64>,
    #[serde(default)]
    pub thinning:               ThinningConfig,
}

fn default_multiplier() -> f64 {
    1.0
}

impl ScenarioConfig {
    pub fn rules_for(&self, phase: LifecyclePhase) -> impl Iterator<Item = &InteractionRule> {
        self.interactions.iter().filter(move |r| r.phase == phase)
    }

    pub fn transitions_from(&self, phase: LifecyclePhase) -> impl Iterator<Item = &LifecycleTransition> {
        self.lifecycle.iter().filter(move |t| t.from == phase)
    }

    pub fn cap_for(&self, activity: ActivityType) -> u32 {
        self.per_record_caps.get(&activity).copied().unwrap_or(0)
    }

    pub fn budget_for(&self, activity: ActivityType) -> u64 {
        self.budgets.get(&activity).copied().unwrap_or(0)
    }

    /// Apply the lead-volume multiplier to a requested record count.
    pub fn effective_count(&self, requested: u64) -> u64 {
        if requested == 0 {
            return 0;
        }
        ((requested as f64) * self.lead_volume_multiplier.max(0.0)).round().max(1.0) as u64
    }
}

// ── Files on disk ──────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
struct PoliciesFile {
    policies: BTreeMap<QueueName, RetryPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    pub runtime:   RuntimeConfig,
    pub policies:  BTreeMap<QueueName, RetryPolicy>,
    pub scenarios: BTreeMap<String, ScenarioConfig>,
}

impl SimConfig {
    /// Load from the data/ directory.
    /// In tests, use SimConfig::default_test().
    pub fn load(data_dir: &str) -> anyhow::Result<Self> {
        let runtime_path = format!("{data_dir}/runtime.json");
        let runtime_content = std::fs::read_to_string(&runtime_path)
            .map_err(|e| anyhow::anyhow!("Cannot read {runtime_path}: {e}"))?;
        let runtime: RuntimeConfig = serde_json::from_str(&runtime_content)?;

        let policy_path = format!("{data_dir}/activity_policies.json");
        let policy_content = std::fs::read_to_string(&policy_path)
            .map_err(|e| anyhow::anyhow!("Cannot read {policy_path}: {e}"))?;
        let policy_file: PoliciesFile = serde_json::from_str(&policy_content)?;

        let scenario_dir = format!("{data_dir}/scenarios");
        let mut scenarios = BTreeMap::new();
        let entries = std::fs::read_dir(&scenario_dir)
            .map_err(|e| anyhow::anyhow!("Cannot read {scenario_dir}: {e}"))?;
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = std::fs::read_to_string(&path)
                .map_err(|e| anyhow::anyhow!("Cannot read {}: {e}", path.display()))?;
            let scenario: ScenarioConfig = serde_json::from_str(&content)
                .map_err(|e| anyhow::anyhow!("Bad scenario {}: {e}", path.display()))?;
            scenarios.insert(scenario.scenario_id.clone(), scenario);
        }

        let config = Self {
            runtime,
            policies: policy_file.policies,
            scenarios,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would make the engine misbehave.
    pub fn validate(&self) -> SimResult<()> {
        if self.runtime.segment_duration_ms <= 0 {
            return Err(SimError::InvalidConfig("segment_duration_ms must be > 0".into()));
        }
        if self.runtime.job_lease_ms <= self.runtime.job_timeout_ms as i64 {
            return Err(SimError::InvalidConfig("job_lease_ms must exceed job_timeout_ms".into()));
        }
        if self.runtime.breaker.threshold == 0 {
            return Err(SimError::InvalidConfig("breaker.threshold must be > 0".into()));
        }
        for (queue, policy) in &self.policies {
            if policy.max_attempts == 0 {
                return Err(SimError::InvalidConfig(format!(
                    "policy for {queue} must allow at least one attempt"
                )));
            }
        }
        for s in self.scenarios.values() {
            if s.rate_limits.refill_interval_ms <= 0 {
                return Err(SimError::InvalidConfig(format!(
                    "scenario {}: refill_interval_ms must be > 0",
                    s.scenario_id
                )));
            }
            for phase in LifecyclePhase::ALL {
                let total: f64 = s.transitions_from(phase).map(|t| t.probability).sum();
                if total > 1.0 + f64::EPSILON {
                    return Err(SimError::InvalidConfig(format!(
                        "scenario {}: transitions out of {} sum to {total}",
                        s.scenario_id,
                        phase.as_str()
                    )));
                }
            }
            let mut seen = std::collections::BTreeSet::new();
            for rule in &s.interactions {
                if !seen.insert((rule.phase.as_str(), rule.id.as_str())) {
                    return Err(SimError::InvalidConfig(format!(
                        "scenario {}: rule {} repeated for phase {}",
                        s.scenario_id,
                        rule.id,
                        rule.phase.as_str()
                    )));
                }
                if !(0.0..=1.0).contains(&rule.probability) {
                    return Err(SimError::InvalidConfig(format!(
                        "scenario {}: rule {} probability out of range",
                        s.scenario_id, rule.id
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn scenario(&self, scenario_id: &str) -> SimResult<&ScenarioConfig> {
        self.scenarios
            .get(scenario_id)
            .ok_or_else(|| SimError::UnknownScenario { id: scenario_id.to_string() })
    }

    /// Retry policy for a queue; a queue without one gets a single attempt.
    pub fn policy_for(&self, queue: QueueName) -> RetryPolicy {
        self.policies
            .get(&queue)
            .cloned()
            .unwrap_or_else(RetryPolicy::single_attempt)
    }

    pub fn default_test() -> Self {
        let runtime = RuntimeConfig {
            segment_duration_ms:            MS_PER_HOUR,
            job_timeout_ms:                 5_000,
            job_lease_ms:                   60_000,
            call_timeout_ms:                2_000,
            worker_concurrency:             4,
            poll_interval_ms:               10,
            default_bucket_capacity:        100,
            default_rate_limit_cooldown_ms: 10_000,
            idempotency_ttl_ms:             7 * MS_PER_DAY,
            segment_claim_ttl_ms:           5 * MS_PER_MINUTE,
            activity_marker_ttl_ms:         MS_PER_DAY,
            cache_ttl_ms:                   7 * MS_PER_DAY,
            breaker: BreakerConfig {
                window_ms:   60_000,
                threshold:   5,
                cooldown_ms: 30_000,
            },
            dead_letter: DeadLetterConfig { sample_size: 50 },
            replay: ReplayConfig {
                recent_ttl_ms:          10 * MS_PER_MINUTE,
                max_replays_per_window: 5,
                operator_window_ms:     MS_PER_MINUTE,
            },
        };

        let mut policies = BTreeMap::new();
        policies.insert(QueueName::Primary, RetryPolicy { max_attempts: 3, backoff_ms: vec![1_000, 5_000] });
        policies.insert(QueueName::Notes, RetryPolicy { max_attempts: 3, backoff_ms: vec![2_000] });
        policies.insert(QueueName::Calls, RetryPolicy { max_attempts: 3, backoff_ms: vec![2_000] });
        policies.insert(QueueName::Tasks, RetryPolicy { max_attempts: 2, backoff_ms: vec![2_000] });
        policies.insert(QueueName::Tickets, RetryPolicy { max_attempts: 2, backoff_ms: vec![2_000] });
        policies.insert(QueueName::Control, RetryPolicy { max_attempts: 5, backoff_ms: vec![500] });

        let mut scenarios = BTreeMap::new();
        scenarios.insert("baseline".to_string(), Self::baseline_scenario());

        Self { runtime, policies, scenarios }
    }

    fn baseline_scenario() -> ScenarioConfig {
        let mut capacities = BTreeMap::new();
        for object in ["contacts", "deals", "notes", "calls", "tasks", "tickets"] {
            capacities.insert(object.to_string(), 1_000);
        }

        let mut per_record_caps = BTreeMap::new();
        per_record_caps.insert(ActivityType::Note, 3);
        per_record_caps.insert(ActivityType::Call, 1);
        per_record_caps.insert(ActivityType::Task, 2);
        per_record_caps.insert(ActivityType::Ticket, 1);

        let mut budgets = BTreeMap::new();
        budgets.insert(ActivityType::Note, 500);
        budgets.insert(ActivityType::Call, 200);
        budgets.insert(ActivityType::Task, 200);
        budgets.insert(ActivityType::Ticket, 50);

        let hours = |mean: f64, jitter: f64| DelaySpec::MeanJitter { mean, jitter, unit: TimeUnit::Hours };

        ScenarioConfig {
            scenario_id: "baseline".into(),
            label: "Baseline B2B funnel".into(),
            lead_volume_multiplier: 1.0,
            rate_limits: RateLimitConfig {
                capacities,
                refill_interval_ms: 10_000,
            },
            lifecycle: vec![
                LifecycleTransition {
                    from: LifecyclePhase::ContactCreated,
                    to: LifecyclePhase::Mql,
                    probability: 0.30,
                    delay: DelaySpec::Uniform { min: 1.0, max: 3.0, unit: TimeUnit::Days },
                },
                LifecycleTransition {
                    from: LifecyclePhase::Mql,
                    to: LifecyclePhase::DealWon,
                    probability: 0.25,
                    delay: DelaySpec::Uniform { min: 5.0, max: 14.0, unit: TimeUnit::Days },
                },
                LifecycleTransition {
                    from: LifecyclePhase::Mql,
                    to: LifecyclePhase::Regression,
                    probability: 0.15,
                    delay: DelaySpec::Uniform { min: 3.0, max: 10.0, unit: TimeUnit::Days },
                },
            ],
            interactions: vec![
                InteractionRule {
                    id: "initial_note".into(),
                    phase: LifecyclePhase::ContactCreated,
                    activity: ActivityType::Note,
                    probability: 0.60,
                    delay: hours(2.0, 1.0),
                },
                InteractionRule {
                    id: "intro_call".into(),
                    phase: LifecyclePhase::ContactCreated,
                    activity: ActivityType::Call,
                    probability: 0.25,
                    delay: hours(24.0, 8.0),
                },
                InteractionRule {
                    id: "mql_follow_up".into(),
                    phase: LifecyclePhase::Mql,
                    activity: ActivityType::Task,
                    probability: 0.80,
                    delay: hours(4.0, 2.0),
                },
                InteractionRule {
                    id: "won_handoff_note".into(),
                    phase: LifecyclePhase::DealWon,
                    activity: ActivityType::Note,
                    probability: 0.90,
                    delay: hours(1.0, 0.5),
                },
                InteractionRule {
                    id: "onboarding_ticket".into(),
                    phase: LifecyclePhase::DealWon,
                    activity: ActivityType::Ticket,
                    probability: 0.40,
                    delay: hours(48.0, 12.0),
                },
                InteractionRule {
                    id: "lost_debrief".into(),
                    phase: LifecyclePhase::DealLost,
                    activity: ActivityType::Task,
                    probability: 0.50,
                    delay: hours(24.0, 6.0),
                },
            ],
            per_record_caps,
            budgets,
            thinning: ThinningConfig::default(),
        }
    }
}

/// Hot-reloadable handle to the current configuration.
///
/// Readers take a cheap `Arc` snapshot; a reload swaps the whole snapshot,
/// so no reader ever sees half of an old config and half of a new one.
pub struct ConfigHandle {
    current:  RwLock<Arc<SimConfig>>,
    data_dir: Option<String>,
}

impl ConfigHandle {
    pub fn new(config: SimConfig) -> Self {
        Self { current: RwLock::new(Arc::new(config)), data_dir: None }
    }

    pub fn from_dir(data_dir: &str) -> anyhow::Result<Self> {
        let config = SimConfig::load(data_dir)?;
        Ok(Self {
            current:  RwLock::new(Arc::new(config)),
            data_dir: Some(data_dir.to_string()),
        })
    }

    pub fn current(&self) -> Arc<SimConfig> {
        self.current.read().clone()
    }

    /// Re-read the data directory. A broken file leaves the old config live.
    pub fn reload(&self) -> anyhow::Result<()> {
        let Some(dir) = &self.data_dir else {
            return Ok(());
        };
        let fresh = SimConfig::load(dir)?;
        *self.current.write() = Arc::new(fresh);
        log::info!("Configuration reloaded from {dir}");
        Ok(())
    }

    pub fn replace(&self, config: SimConfig) {
        *self.current.write() = Arc::new(config);
    }
}
