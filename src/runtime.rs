use crate::error::{CheckError, StorageError};
use crate::fingerprint::Fingerprint;
use crate::graph::{GraphStoreConfig, StateGraphStore, StateRecord};
use crate::liveness::{LivenessChecker, LivenessViolation};
use crate::spec::Spec;
use crate::storage::fingerprint_store::{
    FingerprintStats, FingerprintStore, FingerprintStoreConfig,
};
use crate::storage::queue::{FrontierConfig, FrontierQueue, QueueDiscipline, QueueStats};
use crate::system::{
    WorkerPlanRequest, build_worker_plan, cgroup_memory_max_bytes, pin_current_thread_to_cpu,
};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Worker threads; 0 = one per allowed CPU.
    pub workers: usize,
    pub core_ids: Option<Vec<usize>>,
    pub enforce_cgroups: bool,
    pub pin_workers: bool,
    pub memory_max_bytes: Option<u64>,
    pub estimated_state_bytes: usize,
    pub work_dir: PathBuf,
    pub clean_work_dir: bool,
    pub resume: bool,
    pub checkpoint_on_exit: bool,
    pub discipline: QueueDiscipline,
    pub check_deadlock: bool,
    /// Stop and report Interrupted once this many distinct states exist.
    pub max_states: Option<u64>,
    pub time_budget: Option<Duration>,
    /// External cancellation: when the caller sets this flag, the search
    /// drains exactly as on a budget overrun and reports Interrupted.
    pub cancel_flag: Option<Arc<AtomicBool>>,
    pub progress_interval_secs: u64,
    /// Advisory early liveness passes; the mandatory pass at exhaustion
    /// always runs.
    pub liveness_cadence_secs: Option<u64>,
    pub fp_shards: usize,
    pub fp_expected_items: usize,
    pub fp_false_positive_rate: f64,
    pub fp_hot_entries_per_shard: usize,
    pub fp_cache_capacity_bytes: u64,
    pub fp_flush_every_ms: Option<u64>,
    pub queue_inmem_limit: usize,
    pub queue_spill_batch: usize,
    pub queue_spill_channel_bound: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            core_ids: None,
            enforce_cgroups: true,
            pin_workers: false,
            memory_max_bytes: None,
            estimated_state_bytes: 256,
            work_dir: PathBuf::from("./.veristate"),
            clean_work_dir: true,
            resume: false,
            checkpoint_on_exit: true,
            discipline: QueueDiscipline::BreadthFirst,
            check_deadlock: true,
            max_states: None,
            time_budget: None,
            cancel_flag: None,
            progress_interval_secs: 10,
            liveness_cadence_secs: None,
            fp_shards: 64,
            fp_expected_items: 10_000_000,
            fp_false_positive_rate: 0.01,
            fp_hot_entries_per_shard: 100_000,
            fp_cache_capacity_bytes: 256 * 1024 * 1024,
            fp_flush_every_ms: Some(10_000),
            queue_inmem_limit: 1_000_000,
            queue_spill_batch: 25_000,
            queue_spill_channel_bound: 64,
        }
    }
}

/// The kind of well-formed search failure a witness documents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ViolationKind {
    Invariant { name: String },
    Deadlock,
    Liveness { property: String },
}

/// A confirmed failure plus the concrete behavior reaching it. For liveness
/// violations the trace suffix is the cycle, with the entry state repeated
/// at the end to close the loop.
#[derive(Debug)]
pub struct ErrorWitness<S> {
    pub kind: ViolationKind,
    pub trace: Vec<S>,
}

#[derive(Clone, Debug)]
pub struct SearchStats {
    pub duration: Duration,
    pub states_generated: u64,
    pub states_processed: u64,
    pub distinct_fingerprints: u64,
    pub duplicates: u64,
    pub enqueued: u64,
    pub configured_workers: usize,
    pub actual_workers: usize,
    pub resumed_from_checkpoint: bool,
    pub queue: QueueStats,
    pub fingerprints: FingerprintStats,
}

#[derive(Debug)]
pub enum SearchResult<S> {
    Completed { stats: SearchStats },
    Failed { witness: ErrorWitness<S>, stats: SearchStats },
    Interrupted { stats: SearchStats },
}

impl<S> SearchResult<S> {
    pub fn stats(&self) -> &SearchStats {
        match self {
            SearchResult::Completed { stats }
            | SearchResult::Failed { stats, .. }
            | SearchResult::Interrupted { stats } => stats,
        }
    }

    pub fn witness(&self) -> Option<&ErrorWitness<S>> {
        match self {
            SearchResult::Failed { witness, .. } => Some(witness),
            _ => None,
        }
    }
}

/// A discovered-but-unexpanded state. Its `StateRecord` is written before
/// the entry becomes visible to any worker; consumers rely on that ordering.
#[derive(Debug, Serialize, Deserialize)]
#[serde(bound(
    serialize = "S: Serialize",
    deserialize = "S: serde::de::DeserializeOwned"
))]
pub struct FrontierEntry<S> {
    pub state: S,
    pub fp: Fingerprint,
}

#[derive(Default)]
struct AtomicRunStats {
    generated: AtomicU64,
    processed: AtomicU64,
    distinct: AtomicU64,
    duplicates: AtomicU64,
    enqueued: AtomicU64,
}

/// Violation as first observed by a worker; the concrete trace is
/// reconstructed by the coordinator after the pool drains.
enum PendingViolation {
    Invariant { name: String, fp: Fingerprint },
    Deadlock { fp: Fingerprint },
    Liveness(LivenessViolation),
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointManifest {
    version: u32,
    spec: String,
    created_unix_secs: u64,
    duration_millis: u64,
    states_generated: u64,
    states_processed: u64,
    distinct_fingerprints: u64,
    duplicates: u64,
    enqueued: u64,
    configured_workers: usize,
    actual_workers: usize,
    resumed_from_checkpoint: bool,
    queue: QueueStats,
    fingerprints: FingerprintStats,
}

fn write_manifest(path: &Path, manifest: &CheckpointManifest) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed creating checkpoint dir {}", parent.display()))
            .map_err(StorageError::Frontier)?;
    }
    let tmp = path.with_extension("tmp");
    let bytes = serde_json::to_vec_pretty(manifest)
        .context("failed serializing checkpoint manifest")
        .map_err(StorageError::Frontier)?;
    std::fs::write(&tmp, bytes)
        .with_context(|| format!("failed writing checkpoint temp file {}", tmp.display()))
        .map_err(StorageError::Frontier)?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed moving checkpoint into place at {}", path.display()))
        .map_err(StorageError::Frontier)?;
    Ok(())
}

fn effective_memory_max(config: &EngineConfig) -> Option<u64> {
    let cgroup = if config.enforce_cgroups {
        cgroup_memory_max_bytes()
    } else {
        None
    };
    match (config.memory_max_bytes, cgroup) {
        (Some(user), Some(limit)) => Some(user.min(limit)),
        (Some(user), None) => Some(user),
        (None, Some(limit)) => Some(limit),
        (None, None) => None,
    }
}

/// Split the memory ceiling between the fingerprint cache and the resident
/// frontier: roughly 60% to the former, 30% to the latter, the remainder to
/// everything else.
fn apply_memory_budget(config: &EngineConfig, memory_max: Option<u64>) -> (u64, usize) {
    let mut fp_cache = config.fp_cache_capacity_bytes;
    let mut queue_limit = config.queue_inmem_limit;
    if let Some(memory_max) = memory_max {
        fp_cache = fp_cache.min((memory_max.saturating_mul(60) / 100).max(32 * 1024 * 1024));
        let state_bytes = config.estimated_state_bytes.max(1) as u64;
        let budget_items = ((memory_max.saturating_mul(30) / 100) / state_bytes).max(10_000);
        queue_limit = queue_limit.min(budget_items as usize);
    }
    (fp_cache, queue_limit)
}

/// Replay a fingerprint path into concrete states by walking the next-state
/// relation from the matching initial state. Used for witness traces so the
/// reported behavior is an exact sequence of real transitions.
fn replay_path<P: Spec>(
    spec: &P,
    initial: &[(Fingerprint, P::State)],
    path: &[Fingerprint],
) -> Result<Vec<P::State>, CheckError> {
    let Some(first) = path.first() else {
        return Ok(Vec::new());
    };
    let mut current = initial
        .iter()
        .find(|(fp, _)| fp == first)
        .map(|(_, state)| state.clone())
        .ok_or_else(|| {
            CheckError::Engine(format!("trace head {first} is not an initial state"))
        })?;
    let mut trace = vec![current.clone()];
    let mut successors = Vec::new();
    for target in &path[1..] {
        successors.clear();
        spec.next_states(&current, &mut successors)?;
        let next = successors
            .drain(..)
            .find(|s| spec.fingerprint(s) == *target)
            .ok_or_else(|| {
                CheckError::Engine(format!("no transition to {target} during trace replay"))
            })?;
        trace.push(next.clone());
        current = next;
    }
    Ok(trace)
}

fn build_witness<P: Spec>(
    spec: &P,
    graph: &StateGraphStore,
    initial: &[(Fingerprint, P::State)],
    pending: PendingViolation,
) -> Result<ErrorWitness<P::State>, CheckError> {
    match pending {
        PendingViolation::Invariant { name, fp } => {
            let path = graph.chain_to_initial(fp)?;
            Ok(ErrorWitness {
                kind: ViolationKind::Invariant { name },
                trace: replay_path(spec, initial, &path)?,
            })
        }
        PendingViolation::Deadlock { fp } => {
            let path = graph.chain_to_initial(fp)?;
            Ok(ErrorWitness {
                kind: ViolationKind::Deadlock,
                trace: replay_path(spec, initial, &path)?,
            })
        }
        PendingViolation::Liveness(violation) => {
            let mut path = violation.prefix.clone();
            path.extend(violation.cycle.iter().skip(1).copied());
            if let Some(entry) = violation.cycle.first() {
                path.push(*entry);
            }
            Ok(ErrorWitness {
                kind: ViolationKind::Liveness {
                    property: violation.property,
                },
                trace: replay_path(spec, initial, &path)?,
            })
        }
    }
}

/// Run the search to a verdict.
///
/// The coordinator moves through Idle -> Seeding -> Running and ends in one
/// of the three result variants. Fatal faults (`EvalError`, `StorageError`)
/// surface as `Err`; invariant/deadlock/liveness violations are well-formed
/// `Failed` outcomes with a reconstructed witness.
pub fn run_spec<P: Spec>(
    spec: P,
    config: EngineConfig,
) -> Result<SearchResult<P::State>, CheckError> {
    let spec = Arc::new(spec);
    let started_at = Instant::now();

    if config.clean_work_dir && !config.resume && config.work_dir.exists() {
        std::fs::remove_dir_all(&config.work_dir)
            .with_context(|| format!("failed removing work dir {}", config.work_dir.display()))
            .map_err(StorageError::Frontier)?;
    }
    std::fs::create_dir_all(&config.work_dir)
        .with_context(|| format!("failed creating work dir {}", config.work_dir.display()))
        .map_err(StorageError::Frontier)?;

    let memory_max = effective_memory_max(&config);
    let (fp_cache_capacity_bytes, queue_inmem_limit) = apply_memory_budget(&config, memory_max);

    let plan = build_worker_plan(WorkerPlanRequest {
        requested_workers: config.workers,
        enforce_cgroups: config.enforce_cgroups,
        pin_workers: config.pin_workers,
        requested_core_ids: config.core_ids.clone(),
    });
    debug!(
        workers = plan.worker_count,
        allowed_cpus = plan.allowed_cpus.len(),
        "worker plan built"
    );

    let checker = Arc::new(LivenessChecker::new(spec.temporal_properties()));
    let fp_store = Arc::new(FingerprintStore::open(FingerprintStoreConfig {
        path: config.work_dir.join("fingerprints"),
        shard_count: config.fp_shards,
        expected_items: config.fp_expected_items,
        false_positive_rate: config.fp_false_positive_rate,
        hot_entries_per_shard: config.fp_hot_entries_per_shard,
        cache_capacity_bytes: fp_cache_capacity_bytes,
        flush_every_ms: config.fp_flush_every_ms,
    })?);
    let graph = Arc::new(StateGraphStore::open(GraphStoreConfig {
        path: config.work_dir.join("graph"),
        track_edges: !checker.is_empty(),
        cache_capacity_bytes: 64 * 1024 * 1024,
    })?);
    let queue = Arc::new(FrontierQueue::<FrontierEntry<P::State>>::new(
        FrontierConfig {
            spill_dir: config.work_dir.join("frontier"),
            discipline: config.discipline,
            inmem_limit: queue_inmem_limit,
            spill_batch: config.queue_spill_batch,
            spill_channel_bound: config.queue_spill_channel_bound,
            load_existing_segments: config.resume,
        },
    )?);

    let run_stats = Arc::new(AtomicRunStats::default());
    let stop = Arc::new(AtomicBool::new(false));
    let interrupted = Arc::new(AtomicBool::new(false));
    let (violation_tx, violation_rx) = crossbeam_channel::bounded::<PendingViolation>(1);
    let (error_tx, error_rx) = crossbeam_channel::bounded::<CheckError>(1);

    // Seeding: evaluate the initial predicate, deduplicate, record, enqueue.
    // On resume the persisted frontier and fingerprint set stand in for this;
    // the initial set is still evaluated because liveness and trace replay
    // anchor on it.
    debug!(spec = spec.name(), "seeding initial states");
    let resumed = config.resume && queue.has_pending_work();
    let mut initial_pairs: Vec<(Fingerprint, P::State)> = Vec::new();
    {
        let states = spec.initial_states()?;
        let mut seen = HashSet::with_capacity(states.len().max(16));
        for state in states {
            if !resumed {
                run_stats.generated.fetch_add(1, Ordering::Relaxed);
            }
            let fp = spec.fingerprint(&state);
            if !seen.insert(fp.raw()) {
                if !resumed {
                    run_stats.duplicates.fetch_add(1, Ordering::Relaxed);
                }
                continue;
            }
            initial_pairs.push((fp, state));
        }
    }
    if !resumed {
        for (fp, state) in &initial_pairs {
            if !fp_store.insert_if_absent(*fp)? {
                run_stats.duplicates.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            run_stats.distinct.fetch_add(1, Ordering::Relaxed);
            graph.insert_record(
                *fp,
                &StateRecord {
                    predecessor: None,
                    labels: checker.labels_for_state(state),
                },
            )?;
            if let Err(name) = spec.check_invariants(state) {
                let _ = violation_tx.try_send(PendingViolation::Invariant { name, fp: *fp });
                stop.store(true, Ordering::Release);
                queue.close();
                break;
            }
            queue.push(FrontierEntry {
                state: state.clone(),
                fp: *fp,
            })?;
            run_stats.enqueued.fetch_add(1, Ordering::Relaxed);
        }
        info!(
            spec = spec.name(),
            initial = initial_pairs.len(),
            "finished computing initial states"
        );
    } else {
        info!(spec = spec.name(), "resuming from persisted frontier");
    }
    let initial_fps: Vec<Fingerprint> = initial_pairs.iter().map(|(fp, _)| *fp).collect();

    // Budget / progress / periodic-liveness monitor.
    let monitor = {
        let stop = Arc::clone(&stop);
        let interrupted = Arc::clone(&interrupted);
        let queue = Arc::clone(&queue);
        let run_stats = Arc::clone(&run_stats);
        let checker = Arc::clone(&checker);
        let graph = Arc::clone(&graph);
        let violation_tx = violation_tx.clone();
        let error_tx = error_tx.clone();
        let init_fps = initial_fps.clone();
        let max_states = config.max_states;
        let time_budget = config.time_budget;
        let cancel_flag = config.cancel_flag.clone();
        let progress_interval = Duration::from_secs(config.progress_interval_secs.max(1));
        let liveness_cadence = config.liveness_cadence_secs.map(Duration::from_secs);
        std::thread::Builder::new()
            .name("veristate-monitor".to_string())
            .spawn(move || {
                let mut last_progress = Instant::now();
                let mut last_liveness = Instant::now();
                let mut last_generated = 0u64;
                loop {
                    std::thread::sleep(Duration::from_millis(25));
                    if stop.load(Ordering::Acquire) {
                        return;
                    }

                    let cancelled = cancel_flag
                        .as_ref()
                        .is_some_and(|flag| flag.load(Ordering::Acquire));
                    let over_time =
                        time_budget.is_some_and(|budget| started_at.elapsed() >= budget);
                    let over_states = max_states
                        .is_some_and(|max| run_stats.distinct.load(Ordering::Relaxed) >= max);
                    if cancelled || over_time || over_states {
                        info!(
                            cancelled,
                            over_time, over_states, "search stopping before exhaustion"
                        );
                        interrupted.store(true, Ordering::Release);
                        stop.store(true, Ordering::Release);
                        queue.close();
                        return;
                    }

                    if last_progress.elapsed() >= progress_interval {
                        let generated = run_stats.generated.load(Ordering::Relaxed);
                        let rate = (generated - last_generated) as f64
                            / last_progress.elapsed().as_secs_f64();
                        info!(
                            states_generated = generated,
                            distinct = run_stats.distinct.load(Ordering::Relaxed),
                            queue_len = queue.len(),
                            per_sec = rate as u64,
                            "progress"
                        );
                        last_generated = generated;
                        last_progress = Instant::now();
                    }

                    if let Some(cadence) = liveness_cadence
                        && !checker.is_empty()
                        && last_liveness.elapsed() >= cadence
                    {
                        // Advisory pass on the partial graph: a cycle found
                        // now is genuine, "nothing yet" proves nothing.
                        match checker.check(&graph, &init_fps) {
                            Ok(Some(violation)) => {
                                let _ = violation_tx
                                    .try_send(PendingViolation::Liveness(violation));
                                stop.store(true, Ordering::Release);
                                queue.close();
                                return;
                            }
                            Ok(None) => {}
                            Err(err) => {
                                let _ = error_tx.try_send(CheckError::Storage(err));
                                stop.store(true, Ordering::Release);
                                queue.close();
                                return;
                            }
                        }
                        last_liveness = Instant::now();
                    }
                }
            })
            .map_err(|err| CheckError::Engine(format!("failed to spawn monitor: {err}")))?
    };

    // Running: the worker pool drains the frontier.
    debug!(workers = plan.worker_count, "spawning workers");
    let mut workers = Vec::with_capacity(plan.worker_count);
    for worker_id in 0..plan.worker_count {
        let worker_spec = Arc::clone(&spec);
        let worker_fp_store = Arc::clone(&fp_store);
        let worker_graph = Arc::clone(&graph);
        let worker_queue = Arc::clone(&queue);
        let worker_checker = Arc::clone(&checker);
        let worker_stats = Arc::clone(&run_stats);
        let worker_stop = Arc::clone(&stop);
        let worker_violation_tx = violation_tx.clone();
        let worker_error_tx = error_tx.clone();
        let worker_check_deadlock = config.check_deadlock;
        let worker_cpu = plan.assigned_cpus.get(worker_id).copied().flatten();

        let handle = std::thread::Builder::new()
            .name(format!("veristate-worker-{worker_id}"))
            .spawn(move || {
                if let Some(cpu) = worker_cpu
                    && let Err(err) = pin_current_thread_to_cpu(cpu)
                {
                    warn!(worker_id, cpu, %err, "cpu pinning failed, continuing unpinned");
                }

                let mut successors: Vec<P::State> = Vec::with_capacity(64);
                let mut all_succ_fps: Vec<Fingerprint> = Vec::with_capacity(64);
                let mut batch_states: Vec<P::State> = Vec::with_capacity(64);
                let mut batch_fps: Vec<Fingerprint> = Vec::with_capacity(64);
                let mut fresh: Vec<bool> = Vec::with_capacity(64);
                let mut local_dedup: HashSet<u64> = HashSet::with_capacity(128);

                loop {
                    if worker_stop.load(Ordering::Acquire) {
                        break;
                    }
                    let entry = match worker_queue.pop() {
                        Ok(Some(entry)) => entry,
                        Ok(None) => break,
                        Err(err) => {
                            let _ = worker_error_tx.try_send(CheckError::Storage(err));
                            worker_stop.store(true, Ordering::Release);
                            worker_queue.close();
                            break;
                        }
                    };

                    let outcome: Result<(), CheckError> = (|| {
                        successors.clear();
                        worker_spec.next_states(&entry.state, &mut successors)?;
                        worker_stats
                            .generated
                            .fetch_add(successors.len() as u64, Ordering::Relaxed);
                        worker_stats.processed.fetch_add(1, Ordering::Relaxed);

                        if successors.is_empty() {
                            if worker_check_deadlock && !worker_spec.is_terminal(&entry.state) {
                                let _ = worker_violation_tx
                                    .try_send(PendingViolation::Deadlock { fp: entry.fp });
                                worker_stop.store(true, Ordering::Release);
                                worker_queue.close();
                            }
                            return Ok(());
                        }

                        all_succ_fps.clear();
                        batch_states.clear();
                        batch_fps.clear();
                        local_dedup.clear();
                        for succ in successors.drain(..) {
                            let fp = worker_spec.fingerprint(&succ);
                            all_succ_fps.push(fp);
                            if local_dedup.insert(fp.raw()) {
                                batch_fps.push(fp);
                                batch_states.push(succ);
                            } else {
                                worker_stats.duplicates.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        // Edges feed the tableau product graph; duplicates
                        // matter there even though they are not re-expanded.
                        worker_graph.record_edges(entry.fp, &all_succ_fps)?;

                        worker_fp_store.insert_if_absent_batch(&batch_fps, &mut fresh)?;
                        for (idx, succ) in batch_states.drain(..).enumerate() {
                            if worker_stop.load(Ordering::Acquire) {
                                return Ok(());
                            }
                            if !fresh[idx] {
                                worker_stats.duplicates.fetch_add(1, Ordering::Relaxed);
                                continue;
                            }
                            let fp = batch_fps[idx];
                            worker_stats.distinct.fetch_add(1, Ordering::Relaxed);
                            // The record write must complete before the
                            // entry is pushed; other components read the
                            // record as soon as the entry is visible.
                            worker_graph.insert_record(
                                fp,
                                &StateRecord {
                                    predecessor: Some(entry.fp),
                                    labels: worker_checker.labels_for_state(&succ),
                                },
                            )?;
                            if let Err(name) = worker_spec.check_invariants(&succ) {
                                let _ = worker_violation_tx
                                    .try_send(PendingViolation::Invariant { name, fp });
                                worker_stop.store(true, Ordering::Release);
                                worker_queue.close();
                                return Ok(());
                            }
                            worker_queue.push(FrontierEntry { state: succ, fp })?;
                            worker_stats.enqueued.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(())
                    })();

                    if let Err(err) = outcome {
                        let _ = worker_error_tx.try_send(err);
                        worker_stop.store(true, Ordering::Release);
                        worker_queue.close();
                    }
                    worker_queue.task_done();
                }
            })
            .map_err(|err| CheckError::Engine(format!("failed to spawn worker: {err}")))?;
        workers.push(handle);
    }

    let mut worker_panics = 0usize;
    for handle in workers {
        if handle.join().is_err() {
            worker_panics += 1;
        }
    }
    stop.store(true, Ordering::Release);
    queue.close();
    let _ = monitor.join();

    if worker_panics > 0 {
        return Err(CheckError::Engine(format!(
            "{worker_panics} worker thread(s) panicked; search incomplete"
        )));
    }
    if let Ok(err) = error_rx.try_recv() {
        return Err(err);
    }

    let mut pending = violation_rx.try_recv().ok();
    let was_interrupted = interrupted.load(Ordering::Acquire);

    // Mandatory final liveness pass: only authoritative now that the state
    // graph is fully explored.
    if pending.is_none() && !was_interrupted && !checker.is_empty() {
        debug!("running final liveness pass over the complete state graph");
        if let Some(violation) = checker.check(&graph, &initial_fps)? {
            pending = Some(PendingViolation::Liveness(violation));
        }
    }

    if config.checkpoint_on_exit {
        if was_interrupted {
            // Persist the remaining frontier so a resume sees an equivalent
            // pending set.
            queue.checkpoint_flush()?;
        }
        fp_store.flush()?;
        graph.flush()?;
    }

    let stats = SearchStats {
        duration: started_at.elapsed(),
        states_generated: run_stats.generated.load(Ordering::Relaxed),
        states_processed: run_stats.processed.load(Ordering::Relaxed),
        distinct_fingerprints: run_stats.distinct.load(Ordering::Relaxed),
        duplicates: run_stats.duplicates.load(Ordering::Relaxed),
        enqueued: run_stats.enqueued.load(Ordering::Relaxed),
        configured_workers: config.workers,
        actual_workers: plan.worker_count,
        resumed_from_checkpoint: resumed,
        queue: queue.stats(),
        fingerprints: fp_store.stats(),
    };

    if config.checkpoint_on_exit {
        let manifest = CheckpointManifest {
            version: 1,
            spec: spec.name().to_string(),
            created_unix_secs: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            duration_millis: stats.duration.as_millis() as u64,
            states_generated: stats.states_generated,
            states_processed: stats.states_processed,
            distinct_fingerprints: stats.distinct_fingerprints,
            duplicates: stats.duplicates,
            enqueued: stats.enqueued,
            configured_workers: stats.configured_workers,
            actual_workers: stats.actual_workers,
            resumed_from_checkpoint: stats.resumed_from_checkpoint,
            queue: stats.queue,
            fingerprints: stats.fingerprints,
        };
        let manifest_path = config.work_dir.join("checkpoints").join("latest.json");
        if let Err(err) = write_manifest(&manifest_path, &manifest) {
            warn!(%err, "failed to write checkpoint manifest");
        }
    }

    queue.shutdown()?;

    match pending {
        Some(pending) => {
            let witness = build_witness(spec.as_ref(), &graph, &initial_pairs, pending)?;
            info!(kind = ?witness.kind, trace_len = witness.trace.len(), "violation found");
            Ok(SearchResult::Failed { witness, stats })
        }
        None if was_interrupted => {
            info!(
                distinct = stats.distinct_fingerprints,
                "search interrupted before exhaustion"
            );
            Ok(SearchResult::Interrupted { stats })
        }
        None => {
            info!(
                distinct = stats.distinct_fingerprints,
                generated = stats.states_generated,
                "state space exhausted, no violation"
            );
            Ok(SearchResult::Completed { stats })
        }
    }
}
