use clap::{Args, Parser, Subcommand};
use std::fmt::Display;
use std::time::Duration;
use veristate::specs::bounded_buffer::BoundedBuffer;
use veristate::specs::counter_ring::CounterRing;
use veristate::specs::token_ring::TokenRing;
use veristate::storage::queue::QueueDiscipline;
use veristate::system::parse_cpu_list;
use veristate::{EngineConfig, SearchResult, Spec, ViolationKind, run_spec};

/// Parse human-readable byte sizes like "200GB", "10GiB", "512MB".
fn parse_byte_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if let Ok(n) = s.parse::<u64>() {
        return Ok(n);
    }
    let (num_part, unit_part) = s
        .char_indices()
        .find(|(_, c)| c.is_alphabetic())
        .map(|(i, _)| s.split_at(i))
        .ok_or_else(|| format!("invalid byte size: {s}"))?;
    let num: f64 = num_part
        .trim()
        .parse()
        .map_err(|_| format!("invalid number in byte size: {num_part}"))?;
    let multiplier: u64 = match unit_part.to_uppercase().as_str() {
        "B" => 1,
        "KB" => 1_000,
        "KIB" => 1_024,
        "MB" => 1_000_000,
        "MIB" => 1_048_576,
        "GB" => 1_000_000_000,
        "GIB" => 1_073_741_824,
        "TB" => 1_000_000_000_000,
        "TIB" => 1_099_511_627_776,
        _ => return Err(format!("unknown unit: {unit_part}")),
    };
    Ok((num * multiplier as f64) as u64)
}

fn parse_discipline(s: &str) -> Result<QueueDiscipline, String> {
    match s.to_lowercase().as_str() {
        "bfs" | "breadth" | "fifo" => Ok(QueueDiscipline::BreadthFirst),
        "dfs" | "depth" | "lifo" => Ok(QueueDiscipline::DepthFirst),
        other => Err(format!("unknown discipline '{other}' (expected bfs or dfs)")),
    }
}

#[derive(Parser, Debug)]
#[command(name = "veristate")]
#[command(about = "Explicit-state model checker: parallel reachability with liveness checking", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Clone, Debug)]
struct RuntimeArgs {
    #[arg(long, default_value_t = 0, help = "Worker threads (0 = auto, cgroup-aware)")]
    workers: usize,
    #[arg(long, help = "CPU IDs/ranges for workers, e.g. 0-3,8")]
    core_ids: Option<String>,
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    enforce_cgroups: bool,
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set)]
    pin_workers: bool,
    #[arg(
        long,
        value_parser = parse_byte_size,
        help = "Hard memory ceiling (units: 200GB, 10GiB, 512MB, ...)"
    )]
    memory_max_bytes: Option<u64>,
    #[arg(long, default_value_t = 256, help = "Estimated bytes per in-memory state")]
    estimated_state_bytes: usize,
    #[arg(long, default_value = "./.veristate")]
    work_dir: std::path::PathBuf,
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    clean_work_dir: bool,
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set)]
    resume: bool,
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    checkpoint_on_exit: bool,
    #[arg(
        long,
        default_value = "bfs",
        value_parser = parse_discipline,
        help = "Exploration order: bfs (fifo) or dfs (lifo)"
    )]
    discipline: QueueDiscipline,
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    check_deadlock: bool,
    #[arg(long, help = "Interrupt after this many distinct states")]
    max_states: Option<u64>,
    #[arg(long, help = "Interrupt after this many seconds")]
    time_budget_secs: Option<u64>,
    #[arg(long, default_value_t = 10)]
    progress_interval_secs: u64,
    #[arg(long, help = "Run advisory liveness passes at this cadence (seconds)")]
    liveness_cadence_secs: Option<u64>,
}

#[derive(Args, Clone, Debug)]
struct StorageArgs {
    #[arg(long, default_value_t = 64)]
    fp_shards: usize,
    #[arg(long, default_value_t = 10_000_000)]
    fp_expected_items: usize,
    #[arg(long, default_value_t = 0.01)]
    fp_fpr: f64,
    #[arg(long, default_value_t = 100_000)]
    fp_hot_entries: usize,
    #[arg(long, default_value_t = 268_435_456)]
    fp_cache_bytes: u64,
    #[arg(long, default_value_t = 10_000)]
    fp_flush_every_ms: u64,
    #[arg(long, default_value_t = 1_000_000)]
    queue_inmem_limit: usize,
    #[arg(long, default_value_t = 25_000)]
    queue_spill_batch: usize,
    #[arg(long, default_value_t = 64)]
    queue_spill_channel_bound: usize,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Modulo-N counter; the concrete regression scenario.
    CheckCounterRing {
        #[arg(long, default_value_t = 1_000)]
        n: u64,
        #[arg(long, help = "Invariant bound (defaults to n, i.e. no violation)")]
        bound: Option<u64>,
        #[command(flatten)]
        runtime: RuntimeArgs,
        #[command(flatten)]
        storage: StorageArgs,
    },
    /// Token-passing ring with a liveness property.
    CheckTokenRing {
        #[arg(long, default_value_t = 5)]
        processes: i64,
        #[arg(long, help = "Process at which the token can be dropped")]
        lossy_at: Option<i64>,
        #[command(flatten)]
        runtime: RuntimeArgs,
        #[command(flatten)]
        storage: StorageArgs,
    },
    /// Producer/consumer bounded buffer with a deadlock variant.
    CheckBoundedBuffer {
        #[arg(long, default_value_t = 3)]
        capacity: usize,
        #[arg(long, default_value_t = 6)]
        items: i64,
        #[arg(long, help = "Consumer quits after this many items")]
        consumer_limit: Option<i64>,
        #[command(flatten)]
        runtime: RuntimeArgs,
        #[command(flatten)]
        storage: StorageArgs,
    },
}

fn engine_config(runtime: &RuntimeArgs, storage: &StorageArgs) -> anyhow::Result<EngineConfig> {
    let core_ids = runtime
        .core_ids
        .as_deref()
        .map(parse_cpu_list)
        .transpose()?;
    Ok(EngineConfig {
        workers: runtime.workers,
        core_ids,
        enforce_cgroups: runtime.enforce_cgroups,
        pin_workers: runtime.pin_workers,
        memory_max_bytes: runtime.memory_max_bytes,
        estimated_state_bytes: runtime.estimated_state_bytes,
        work_dir: runtime.work_dir.clone(),
        clean_work_dir: runtime.clean_work_dir,
        resume: runtime.resume,
        checkpoint_on_exit: runtime.checkpoint_on_exit,
        discipline: runtime.discipline,
        check_deadlock: runtime.check_deadlock,
        max_states: runtime.max_states,
        time_budget: runtime.time_budget_secs.map(Duration::from_secs),
        progress_interval_secs: runtime.progress_interval_secs,
        liveness_cadence_secs: runtime.liveness_cadence_secs,
        fp_shards: storage.fp_shards,
        fp_expected_items: storage.fp_expected_items,
        fp_false_positive_rate: storage.fp_fpr,
        fp_hot_entries_per_shard: storage.fp_hot_entries,
        fp_cache_capacity_bytes: storage.fp_cache_bytes,
        fp_flush_every_ms: Some(storage.fp_flush_every_ms),
        queue_inmem_limit: storage.queue_inmem_limit,
        queue_spill_batch: storage.queue_spill_batch,
        queue_spill_channel_bound: storage.queue_spill_channel_bound,
        cancel_flag: None,
    })
}

fn report<S: Display>(outcome: &SearchResult<S>) -> i32 {
    let stats = outcome.stats();
    match outcome {
        SearchResult::Completed { .. } => {
            println!(
                "Model checking completed: {} distinct states ({} generated) in {:.2?}, no violation.",
                stats.distinct_fingerprints, stats.states_generated, stats.duration
            );
            0
        }
        SearchResult::Failed { witness, .. } => {
            match &witness.kind {
                ViolationKind::Invariant { name } => {
                    println!("Invariant {name} is violated.");
                }
                ViolationKind::Deadlock => {
                    println!("Deadlock reached: no enabled transition.");
                }
                ViolationKind::Liveness { property } => {
                    println!(
                        "Temporal property {property} is violated; the trace suffix repeats forever."
                    );
                }
            }
            println!("The behavior up to this point:");
            for (idx, state) in witness.trace.iter().enumerate() {
                println!("State {}: {}", idx + 1, state);
            }
            println!(
                "({} distinct states explored in {:.2?})",
                stats.distinct_fingerprints, stats.duration
            );
            12
        }
        SearchResult::Interrupted { .. } => {
            println!(
                "Search interrupted: {} distinct states explored in {:.2?}; result is not a verdict.",
                stats.distinct_fingerprints, stats.duration
            );
            3
        }
    }
}

fn check<P>(spec: P, runtime: &RuntimeArgs, storage: &StorageArgs) -> anyhow::Result<i32>
where
    P: Spec,
    P::State: Display,
{
    let config = engine_config(runtime, storage)?;
    let outcome = run_spec(spec, config)?;
    Ok(report(&outcome))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match &cli.command {
        Command::CheckCounterRing {
            n,
            bound,
            runtime,
            storage,
        } => {
            let spec = match bound {
                Some(bound) => CounterRing::with_bound(*n, *bound),
                None => CounterRing::new(*n),
            };
            check(spec, runtime, storage)?
        }
        Command::CheckTokenRing {
            processes,
            lossy_at,
            runtime,
            storage,
        } => {
            let spec = match lossy_at {
                Some(drop_at) => TokenRing::lossy(*processes, *drop_at),
                None => TokenRing::new(*processes),
            };
            check(spec, runtime, storage)?
        }
        Command::CheckBoundedBuffer {
            capacity,
            items,
            consumer_limit,
            runtime,
            storage,
        } => {
            let spec = match consumer_limit {
                Some(limit) => BoundedBuffer::with_consumer_limit(*capacity, *items, *limit),
                None => BoundedBuffer::new(*capacity, *items),
            };
            check(spec, runtime, storage)?
        }
    };
    std::process::exit(code);
}
