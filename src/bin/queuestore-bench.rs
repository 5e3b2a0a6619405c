//! Purpose: Throughput harness for the queue storage core.
//! Role: Times store/traverse/delete cycles per backend and payload size.
//! Invariants: JSON goes to stdout, the human-readable table to stderr.
//! Invariants: Runs in a scratch directory that is removed unless `--keep` is given.
//! Invariants: Priorities come from a seeded generator so runs can be repeated.
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use clap::{Parser, ValueEnum, ValueHint};
use getrandom::fill as fill_random;
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

use queuestore::api::{
    AsyncTaskManager, Error, ErrorKind, Message, StoreConfig, StoreMode, SyncBarrier,
    TaskManagerConfig, open_queue_store, to_exit_code,
};

const COMMIT_EVERY: u64 = 100;

#[derive(Parser)]
#[command(
    name = "queuestore-bench",
    version,
    about = "Time store, traverse, and delete cycles against each store backend"
)]
struct Cli {
    #[arg(long, help = "Scratch directory (default: .scratch/queuestore-bench-<pid>-<ts>)", value_hint = ValueHint::DirPath)]
    dir: Option<PathBuf>,
    #[arg(long, help = "Store config JSON; data_dir is replaced by the scratch directory", value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,
    #[arg(long, default_value_t = 10_000)]
    messages: u64,
    #[arg(long = "payload-bytes", value_delimiter = ',', default_values_t = [64usize, 1024])]
    payload_bytes: Vec<usize>,
    #[arg(long, value_enum, value_delimiter = ',', default_values_t = [Backend::Journaled, Backend::Block, Backend::Memory])]
    backend: Vec<Backend>,
    #[arg(long, help = "Priority generator seed (default: random)")]
    seed: Option<u64>,
    #[arg(long, value_enum, default_value = "both")]
    format: BenchFormat,
    #[arg(long, help = "Keep the scratch directory after the run")]
    keep: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Backend {
    Journaled,
    Block,
    Memory,
}

impl Backend {
    fn label(self) -> &'static str {
        match self {
            Backend::Journaled => "journaled",
            Backend::Block => "block",
            Backend::Memory => "memory",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum BenchFormat {
    Json,
    Table,
    Both,
}

fn main() {
    init_tracing();
    let exit_code = match run(Cli::parse()) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("queuestore-bench: {err}");
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn run(cli: Cli) -> Result<(), Error> {
    let work_dir = cli.dir.clone().unwrap_or_else(default_work_dir);
    let base = match &cli.config {
        Some(path) => StoreConfig::from_json_path(path)?,
        None => StoreConfig::default(),
    };
    let config = StoreConfig {
        data_dir: work_dir.clone(),
        max_volatile_messages: base
            .max_volatile_messages
            .max(u32::try_from(cli.messages).unwrap_or(u32::MAX)),
        ..base
    };
    config.validate()?;
    let seed = match cli.seed {
        Some(seed) => seed,
        None => random_seed()?,
    };
    let tasks = Arc::new(AsyncTaskManager::new(TaskManagerConfig::default())?);
    let started_at = rfc3339_now(SystemTime::now());

    let mut results = Vec::new();
    for backend in &cli.backend {
        for payload_bytes in &cli.payload_bytes {
            let name = format!("bench-{}-{payload_bytes}", backend.label());
            results.extend(bench_cycle(
                &config,
                &name,
                *backend,
                *payload_bytes,
                cli.messages,
                seed,
                &tasks,
            )?);
        }
    }
    tasks.shutdown();

    let report = json!({
        "bench": "queuestore",
        "version": env!("CARGO_PKG_VERSION"),
        "started_at": started_at,
        "seed": seed,
        "work_dir": work_dir.display().to_string(),
        "system": system_json(),
        "results": results,
    });
    emit_bench_output(&report, cli.format)?;

    if !cli.keep {
        match std::fs::remove_dir_all(&work_dir) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(Error::new(ErrorKind::Io).with_path(&work_dir).with_source(err)),
        }
    }
    Ok(())
}

fn bench_cycle(
    config: &StoreConfig,
    name: &str,
    backend: Backend,
    payload_bytes: usize,
    messages: u64,
    seed: u64,
    tasks: &Arc<AsyncTaskManager>,
) -> Result<Vec<Value>, Error> {
    let (mode, config) = match backend {
        Backend::Journaled => (StoreMode::Persistent, config.clone()),
        Backend::Block => (
            StoreMode::Persistent,
            StoreConfig {
                journal_enabled: false,
                ..config.clone()
            },
        ),
        Backend::Memory => (StoreMode::NonPersistent, config.clone()),
    };
    let mut store = open_queue_store(&config, name, mode, Some(Arc::clone(tasks)))?;
    let mut rng = XorShift64::new(seed);
    let body = vec![0x5au8; payload_bytes];
    let mut entries = Vec::new();

    let barrier = SyncBarrier::new();
    let start = Instant::now();
    let mut stored = 0u64;
    for i in 0..messages {
        let priority = (rng.next() % 10) as u8;
        let message = Message::new(priority, body.clone()).with_id(format!("ID:{i}"));
        if store.store(&message)?.is_none() {
            break;
        }
        stored += 1;
        if stored % COMMIT_EVERY == 0 {
            store.commit_changes_async(&barrier)?;
        }
    }
    store.commit_changes_async(&barrier)?;
    barrier.wait()?;
    let notes = (stored < messages).then_some("store full");
    entries.push(result_entry("store", backend, payload_bytes, stored, start.elapsed(), notes));

    let start = Instant::now();
    let mut seen = 0u64;
    let mut last_priority = u8::MAX;
    let mut cursor = store.first()?;
    while let Some(handle) = cursor {
        let message = store.retrieve(handle)?;
        if message.priority > last_priority {
            return Err(Error::new(ErrorKind::Internal)
                .with_message("traversal out of priority order")
                .with_handle(handle));
        }
        last_priority = message.priority;
        seen += 1;
        cursor = store.next(handle)?;
    }
    entries.push(result_entry("traverse", backend, payload_bytes, seen, start.elapsed(), None));

    let start = Instant::now();
    let mut deleted = 0u64;
    while let Some(handle) = store.first()? {
        store.delete(handle)?;
        deleted += 1;
        if deleted % COMMIT_EVERY == 0 {
            store.commit_changes()?;
        }
    }
    store.commit_changes()?;
    entries.push(result_entry("delete", backend, payload_bytes, deleted, start.elapsed(), None));

    store.destroy()?;
    Ok(entries)
}

fn emit_bench_output(value: &Value, format: BenchFormat) -> Result<(), Error> {
    if matches!(format, BenchFormat::Json | BenchFormat::Both) {
        let text = serde_json::to_string_pretty(value).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode bench json")
                .with_source(err)
        })?;
        println!("{text}");
    }
    if matches!(format, BenchFormat::Table | BenchFormat::Both) {
        emit_table(value)?;
    }
    Ok(())
}

fn emit_table(value: &Value) -> Result<(), Error> {
    let write_err = |err: io::Error| {
        Error::new(ErrorKind::Io)
            .with_message("failed to write bench table")
            .with_source(err)
    };
    let results = value
        .get("results")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::new(ErrorKind::Internal).with_message("bench results missing"))?;

    let mut stderr = io::stderr().lock();
    writeln!(
        stderr,
        "{:>10}  {:>10}  {:>8}  {:>8}  {:>12}  {}",
        "bench", "backend", "payload", "msgs", "msgs/sec", "notes"
    )
    .map_err(write_err)?;
    for item in results {
        let field = |key: &str| item.get(key).and_then(Value::as_str).unwrap_or("");
        writeln!(
            stderr,
            "{:>10}  {:>10}  {:>8}  {:>8}  {:>12.0}  {}",
            field("bench"),
            field("backend"),
            item.get("payload_bytes").and_then(Value::as_u64).unwrap_or(0),
            item.get("messages").and_then(Value::as_u64).unwrap_or(0),
            item.get("msgs_per_sec").and_then(Value::as_f64).unwrap_or(f64::NAN),
            field("notes"),
        )
        .map_err(write_err)?;
    }
    Ok(())
}

fn result_entry(
    bench: &str,
    backend: Backend,
    payload_bytes: usize,
    messages: u64,
    duration: Duration,
    notes: Option<&str>,
) -> Value {
    let secs = duration.as_secs_f64().max(1e-9);
    let mut map = BTreeMap::new();
    map.insert("bench".to_string(), json!(bench));
    map.insert("backend".to_string(), json!(backend.label()));
    map.insert("payload_bytes".to_string(), json!(payload_bytes));
    map.insert("messages".to_string(), json!(messages));
    map.insert("duration_ms".to_string(), json!(duration.as_secs_f64() * 1000.0));
    map.insert("msgs_per_sec".to_string(), json!(messages as f64 / secs));
    if let Some(notes) = notes {
        map.insert("notes".to_string(), json!(notes));
    }
    Value::Object(map.into_iter().collect())
}

fn system_json() -> Value {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    json!({
        "os": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "cpus": cpus,
    })
}

fn default_work_dir() -> PathBuf {
    let pid = std::process::id();
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    PathBuf::from(".scratch").join(format!("queuestore-bench-{pid}-{ts}"))
}

fn random_seed() -> Result<u64, Error> {
    let mut bytes = [0u8; 8];
    fill_random(&mut bytes).map_err(|err| {
        Error::new(ErrorKind::Internal).with_message(format!("failed to seed generator: {err}"))
    })?;
    Ok(u64::from_le_bytes(bytes))
}

fn rfc3339_now(ts: SystemTime) -> String {
    let dur = ts.duration_since(UNIX_EPOCH).unwrap_or_default();
    let tm = time::OffsetDateTime::from_unix_timestamp(dur.as_secs() as i64)
        .unwrap_or(time::OffsetDateTime::UNIX_EPOCH);
    let tm = tm.replace_nanosecond(dur.subsec_nanos()).unwrap_or(tm);
    tm.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

struct XorShift64(u64);

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}
