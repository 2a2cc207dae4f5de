//! sim-runner: headless runner for the CRM lifecycle simulation engine.
//!
//! Usage:
//!   sim-runner --count 500 --method bell_curve --window-hours 6 --fail-rate 0.05
//!   sim-runner --count 200 --realtime --workers 4 --db run.db
//!   sim-runner --count 50 --start 2026-01-05T09:00:00Z --dry-run
//!   sim-runner --ipc-mode

use anyhow::{anyhow, Result};
use crmsim_core::{
    clock::{format_ms, Clock, ManualClock, SystemClock},
    command::OperatorCommand,
    config::{ConfigHandle, SimConfig},
    crm::{Collaborators, CrmClient, CrmError, CrmObject, CrmOperation, CrmRecord, Properties, StaticCredentials},
    distribution::DistributionMethod,
    engine::SimEngine,
    queue::{JobQueue, QueueName},
    simulation::NewSimulation,
    store::SimStore,
    types::MS_PER_HOUR,
};
use std::env;
use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const OWNER: &str = "runner";

#[derive(serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum IpcCommand {
    Create { simulation: NewSimulation },
    Operator { command: OperatorCommand },
    /// Fast-forward until the queue is empty or `max_steps` clock jumps.
    Drain { #[serde(default)] max_steps: Option<u64> },
    Quit,
}

/// In-process CRM stand-in with a configurable failure mix.
struct SimulatedCrmClient {
    fail_rate: f64,
    calls:     AtomicU64,
}

impl SimulatedCrmClient {
    fn new(fail_rate: f64) -> Self {
        Self { fail_rate: fail_rate.clamp(0.0, 1.0), calls: AtomicU64::new(0) }
    }

    /// splitmix64 over the call counter: stable failure pattern per run.
    fn roll(&self) -> (f64, u64) {
        let mut z = self.calls.fetch_add(1, Ordering::SeqCst).wrapping_add(0x9e37_79b9_7f4a_7c15);
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^= z >> 31;
        ((z >> 11) as f64 / (1u64 << 53) as f64, z)
    }
}

impl CrmClient for SimulatedCrmClient {
    fn call(
        &self,
        _token: &str,
        object: CrmObject,
        operation: CrmOperation,
        properties: &Properties,
    ) -> Result<CrmRecord, CrmError> {
        let (r, bits) = self.roll();
        if r < self.fail_rate {
            return Err(match bits % 4 {
                0 => CrmError::RateLimited { retry_after_ms: Some(2_000), message: "429 from CRM".into() },
                1 => CrmError::Network("connection reset".into()),
                2 => CrmError::Validation(format!("{} property rejected", object.as_str())),
                _ => CrmError::Unknown("502 bad gateway".into()),
            });
        }
        let id = match (operation, properties.get("id").and_then(|v| v.as_str())) {
            (CrmOperation::Update, Some(id)) => id.to_string(),
            _ => format!("{}-{bits:016x}", object.as_str()),
        };
        Ok(CrmRecord {
            id,
            raw: serde_json::Value::Object(properties.clone()),
        })
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let count = parse_arg(&args, "--count", 100u64);
    let window_hours = parse_arg(&args, "--window-hours", 1i64);
    let fail_rate = parse_arg(&args, "--fail-rate", 0.0f64);
    let workers = parse_arg(&args, "--workers", 0usize);
    let ipc_mode = args.iter().any(|a| a == "--ipc-mode");
    let realtime = args.iter().any(|a| a == "--realtime");
    let dry_run = args.iter().any(|a| a == "--dry-run");
    let method_name = str_arg(&args, "--method").unwrap_or("linear");
    let scenario = str_arg(&args, "--scenario").unwrap_or("baseline");
    let db = str_arg(&args, "--db").unwrap_or(":memory:");
    let data_dir = str_arg(&args, "--data-dir").unwrap_or("./data");

    let method = DistributionMethod::parse(method_name)
        .ok_or_else(|| anyhow!("unknown distribution method '{method_name}'"))?;

    let config = match ConfigHandle::from_dir(data_dir) {
        Ok(handle) => handle,
        Err(e) => {
            log::warn!("No usable config in {data_dir} ({e}); using built-in defaults");
            ConfigHandle::new(SimConfig::default_test())
        }
    };

    let start_ms = match str_arg(&args, "--start") {
        Some(text) => chrono::DateTime::parse_from_rfc3339(text)
            .map_err(|e| anyhow!("bad --start '{text}': {e}"))?
            .timestamp_millis(),
        None => SystemClock.now_ms(),
    };
    let manual = Arc::new(ManualClock::new(start_ms));
    let clock: Arc<dyn Clock> = if realtime { Arc::new(SystemClock) } else { manual.clone() };
    let store = if db == ":memory:" {
        SimStore::in_memory_with_clock(clock)?
    } else {
        SimStore::open_with_clock(db, clock)?
    };

    let credentials = if dry_run {
        StaticCredentials::none()
    } else {
        StaticCredentials::none().with(OWNER, "runner-token")
    };
    let collaborators = Collaborators::with_client(Arc::new(SimulatedCrmClient::new(fail_rate)), Arc::new(credentials));
    let engine = SimEngine::build(store, config, collaborators)?;

    if ipc_mode {
        return run_ipc_loop(&engine, &manual);
    }

    let simulation_id = format!("sim-{}", uuid::Uuid::new_v4().simple());
    println!("CRM lifecycle simulation: sim-runner");
    println!("  simulation: {simulation_id}");
    println!("  records:    {count} ({})", method.as_str());
    println!("  window:     {} + {window_hours}h", format_ms(start_ms));
    println!("  scenario:   {scenario}");
    println!("  fail rate:  {fail_rate}");
    println!("  mode:       {}", if realtime { "realtime" } else { "fast-forward" });
    println!();

    engine.create_simulation(&NewSimulation {
        simulation_id:   simulation_id.clone(),
        owner:           OWNER.into(),
        scenario_id:     scenario.into(),
        method,
        requested_count: count,
        window_start:    start_ms,
        window_end:      start_ms + window_hours * MS_PER_HOUR,
    })?;
    let started = engine.start(&simulation_id)?;
    log::info!("Started: {}", serde_json::to_string(&started)?);

    if realtime {
        run_realtime(&engine, &simulation_id, workers)?;
    } else {
        let steps = fast_forward(&engine, &manual, None)?;
        log::info!("Fast-forward finished after {steps} clock jump(s)");
    }

    print_summary(&engine, &simulation_id)
}

/// Drain due jobs, then jump the manual clock to the next due job. Stops
/// when the queue is empty.
fn fast_forward(engine: &SimEngine, clock: &ManualClock, max_steps: Option<u64>) -> Result<u64> {
    let worker = engine.worker();
    let mut steps = 0;
    loop {
        worker.drain_due()?;
        let Some(next) = engine.store().next_due_at(&QueueName::ALL)? else {
            break;
        };
        if max_steps.is_some_and(|max| steps >= max) {
            break;
        }
        clock.advance_to(next);
        steps += 1;
    }
    Ok(steps)
}

fn run_realtime(engine: &SimEngine, simulation_id: &str, workers: usize) -> Result<()> {
    let concurrency = if workers == 0 { engine.config().runtime.worker_concurrency } else { workers };
    let pool = engine.spawn_pool(concurrency);
    loop {
        std::thread::sleep(Duration::from_secs(1));
        let progress = engine.progress(simulation_id)?;
        println!("  {} / {} processed ({})", progress.processed, progress.total_count, progress.status);
        if progress.status != "RUNNING" {
            break;
        }
    }
    pool.shutdown();
    Ok(())
}

fn run_ipc_loop(engine: &SimEngine, clock: &ManualClock) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut handle = stdin.lock();
    let mut buffer = String::new();

    loop {
        buffer.clear();
        let bytes_read = handle.read_line(&mut buffer)?;
        if bytes_read == 0 {
            break; // EOF
        }

        let cmd: IpcCommand = match serde_json::from_str(&buffer) {
            Ok(c) => c,
            Err(e) => {
                writeln!(stdout, "{}", serde_json::json!({ "ok": false, "error": e.to_string() }))?;
                stdout.flush()?;
                continue;
            }
        };

        let response = match cmd {
            IpcCommand::Quit => break,
            IpcCommand::Operator { command } => engine.dispatch(command),
            IpcCommand::Create { simulation } => match engine.create_simulation(&simulation) {
                Ok(sim) => serde_json::json!({ "ok": true, "result": sim }),
                Err(e) => serde_json::json!({ "ok": false, "error": e.to_string() }),
            },
            IpcCommand::Drain { max_steps } => match fast_forward(engine, clock, max_steps) {
                Ok(steps) => serde_json::json!({ "ok": true, "result": { "steps": steps, "now": clock.now_ms() } }),
                Err(e) => serde_json::json!({ "ok": false, "error": e.to_string() }),
            },
        };
        writeln!(stdout, "{response}")?;
        stdout.flush()?;
    }
    Ok(())
}

fn print_summary(engine: &SimEngine, simulation_id: &str) -> Result<()> {
    let progress = engine.progress(simulation_id)?;
    let segments = engine.segment_status(simulation_id)?;
    let dlq = engine.dlq_summary(Some(simulation_id))?;

    println!("=== RUN SUMMARY ===");
    println!("  status:      {}", progress.status);
    println!("  processed:   {} / {}", progress.processed, progress.total_count);
    println!(
        "  segments:    {} ({} expanded)",
        segments.segments.len(),
        segments.segments.iter().filter(|s| s.expanded).count()
    );
    println!();
    println!("=== METRICS ===");
    for (name, value) in &progress.metrics {
        println!("  {name:<30} {value}");
    }
    println!();
    println!("=== DEAD LETTERS ===");
    match dlq.by_simulation.get(simulation_id) {
        Some(counts) => {
            for (category, n) in counts {
                println!("  {category:<12} {n}");
            }
        }
        None => println!("  (none)"),
    }
    Ok(())
}

fn str_arg<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2).find(|w| w[0] == flag).map(|w| w[1].as_str())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}
