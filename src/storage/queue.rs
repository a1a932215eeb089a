use crate::error::StorageError;
use anyhow::{Context, anyhow};
use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

/// Exploration order. Affects which counterexample is found first on graphs
/// with several violations, never soundness.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueDiscipline {
    /// FIFO: breadth-first, shortest counterexamples first.
    BreadthFirst,
    /// LIFO: depth-first, lower resident frontier on deep graphs.
    DepthFirst,
}

#[derive(Clone, Debug)]
pub struct FrontierConfig {
    pub spill_dir: PathBuf,
    pub discipline: QueueDiscipline,
    pub inmem_limit: usize,
    pub spill_batch: usize,
    pub spill_channel_bound: usize,
    pub load_existing_segments: bool,
}

impl Default for FrontierConfig {
    fn default() -> Self {
        Self {
            spill_dir: PathBuf::from("./.veristate/frontier"),
            discipline: QueueDiscipline::BreadthFirst,
            inmem_limit: 1_000_000,
            spill_batch: 25_000,
            spill_channel_bound: 64,
            load_existing_segments: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub pushed: u64,
    pub popped: u64,
    pub spilled_items: u64,
    pub spill_batches: u64,
    pub loaded_segments: u64,
    pub loaded_items: u64,
    pub max_inmem_len: u64,
}

#[derive(Default)]
struct QueueStatsAtomic {
    pushed: AtomicU64,
    popped: AtomicU64,
    spilled_items: AtomicU64,
    spill_batches: AtomicU64,
    loaded_segments: AtomicU64,
    loaded_items: AtomicU64,
    max_inmem_len: AtomicU64,
}

struct Inner<T> {
    buf: VecDeque<T>,
    /// Entries popped but not yet acknowledged via `task_done`. While any
    /// task is active, new work may still arrive, so idle poppers must wait
    /// rather than conclude the search is over.
    active: usize,
}

/// Concurrent work queue of not-yet-expanded states with disk overflow.
///
/// `pop` blocks while the queue is transiently empty and peers are still
/// active, and returns `None` only once no queued, spilled, in-flight, or
/// active work remains anywhere (or the queue has been closed by
/// cancellation). A popped entry must be acknowledged with `task_done` after
/// all successor pushes for it are complete; that ordering is what makes the
/// emptiness check above a sound termination barrier.
pub struct FrontierQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    discipline: QueueDiscipline,
    inmem_limit: usize,
    spill_batch: usize,
    spill_tx: Mutex<Option<Sender<Vec<T>>>>,
    segments: Arc<Mutex<VecDeque<PathBuf>>>,
    spill_inflight: Arc<AtomicUsize>,
    spilled_pending: AtomicU64,
    load_lock: Mutex<()>,
    writer_handle: Mutex<Option<JoinHandle<()>>>,
    error: Arc<Mutex<Option<String>>>,
    closed: AtomicBool,
    stats: QueueStatsAtomic,
}

impl<T> FrontierQueue<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    pub fn new(config: FrontierConfig) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&config.spill_dir)
            .with_context(|| {
                format!(
                    "failed to create frontier spill dir {}",
                    config.spill_dir.display()
                )
            })
            .map_err(StorageError::Frontier)?;

        let mut existing: Vec<(u64, PathBuf)> = Vec::new();
        if config.load_existing_segments {
            let entries = std::fs::read_dir(&config.spill_dir)
                .with_context(|| {
                    format!(
                        "failed reading frontier spill dir {}",
                        config.spill_dir.display()
                    )
                })
                .map_err(StorageError::Frontier)?;
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if !(name.starts_with("segment-") && name.ends_with(".bin")) {
                    continue;
                }
                let raw = name.trim_start_matches("segment-").trim_end_matches(".bin");
                if let Ok(id) = raw.parse::<u64>() {
                    existing.push((id, path));
                }
            }
            existing.sort_by_key(|(id, _)| *id);
        }

        let (spill_tx, spill_rx) =
            crossbeam_channel::bounded::<Vec<T>>(config.spill_channel_bound.max(1));
        let segments = Arc::new(Mutex::new(
            existing
                .iter()
                .map(|(_, path)| path.clone())
                .collect::<VecDeque<_>>(),
        ));
        let spill_inflight = Arc::new(AtomicUsize::new(0));
        let error: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        let writer_segments = Arc::clone(&segments);
        let writer_inflight = Arc::clone(&spill_inflight);
        let writer_error = Arc::clone(&error);
        let writer_dir = config.spill_dir.clone();
        let mut next_segment_id = existing.last().map(|(id, _)| id + 1).unwrap_or(0);
        let writer_handle = std::thread::Builder::new()
            .name("veristate-frontier-spill".to_string())
            .spawn(move || {
                while let Ok(batch) = spill_rx.recv() {
                    let path = writer_dir.join(format!("segment-{next_segment_id:016}.bin"));
                    next_segment_id += 1;
                    match bincode::serialize(&batch) {
                        Ok(bytes) => {
                            if let Err(err) = std::fs::write(&path, &bytes) {
                                let mut guard = writer_error.lock();
                                if guard.is_none() {
                                    *guard = Some(format!(
                                        "failed writing frontier segment {}: {err}",
                                        path.display()
                                    ));
                                }
                            } else {
                                writer_segments.lock().push_back(path);
                            }
                        }
                        Err(err) => {
                            let mut guard = writer_error.lock();
                            if guard.is_none() {
                                *guard =
                                    Some(format!("failed serializing frontier batch: {err}"));
                            }
                        }
                    }
                    writer_inflight.fetch_sub(1, Ordering::Release);
                }
            })
            .context("failed to spawn frontier spill writer")
            .map_err(StorageError::Frontier)?;

        // Size estimate for resumed segments; corrected as they load.
        let spilled_pending = existing.len() as u64 * config.spill_batch.max(1) as u64;
        Ok(Self {
            inner: Mutex::new(Inner {
                buf: VecDeque::with_capacity(config.inmem_limit.min(65_536)),
                active: 0,
            }),
            not_empty: Condvar::new(),
            discipline: config.discipline,
            inmem_limit: config.inmem_limit.max(64),
            spill_batch: config.spill_batch.max(16),
            spill_tx: Mutex::new(Some(spill_tx)),
            segments,
            spill_inflight,
            spilled_pending: AtomicU64::new(spilled_pending),
            load_lock: Mutex::new(()),
            writer_handle: Mutex::new(Some(writer_handle)),
            error,
            closed: AtomicBool::new(false),
            stats: QueueStatsAtomic::default(),
        })
    }

    fn check_error(&self) -> Result<(), StorageError> {
        if let Some(msg) = self.error.lock().as_ref() {
            return Err(StorageError::Frontier(anyhow!(msg.clone())));
        }
        Ok(())
    }

    fn update_max_inmem(&self, len: usize) {
        let max = &self.stats.max_inmem_len;
        let mut seen = max.load(Ordering::Relaxed);
        while (len as u64) > seen {
            match max.compare_exchange(
                seen,
                len as u64,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(next) => seen = next,
            }
        }
    }

    fn spill_now(&self, batch: Vec<T>) -> Result<(), StorageError> {
        let sender = self
            .spill_tx
            .lock()
            .as_ref()
            .cloned()
            .ok_or_else(|| StorageError::Frontier(anyhow!("spill writer already shut down")))?;
        self.spill_inflight.fetch_add(1, Ordering::Release);
        self.spilled_pending
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        self.stats
            .spilled_items
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        self.stats.spill_batches.fetch_add(1, Ordering::Relaxed);
        sender.send(batch).map_err(|err| {
            self.spill_inflight.fetch_sub(1, Ordering::Release);
            StorageError::Frontier(anyhow!("failed sending spill batch to writer: {err}"))
        })?;
        Ok(())
    }

    /// Pushes must happen either before the worker pool starts (seeding) or
    /// between a `pop` and its `task_done`; the termination barrier depends
    /// on it.
    pub fn push(&self, item: T) -> Result<(), StorageError> {
        self.check_error()?;
        self.stats.pushed.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.lock();
        if inner.buf.len() < self.inmem_limit {
            inner.buf.push_back(item);
            let len = inner.buf.len();
            drop(inner);
            self.update_max_inmem(len);
            self.not_empty.notify_one();
            return Ok(());
        }

        // Overflow: spill a batch from the cold end of the buffer, keeping
        // the end the discipline dequeues from resident.
        let mut batch = Vec::with_capacity(self.spill_batch);
        batch.push(item);
        while batch.len() < self.spill_batch {
            let cold = match self.discipline {
                QueueDiscipline::BreadthFirst => inner.buf.pop_back(),
                QueueDiscipline::DepthFirst => inner.buf.pop_front(),
            };
            match cold {
                Some(old) => batch.push(old),
                None => break,
            }
        }
        drop(inner);
        self.spill_now(batch)?;
        self.not_empty.notify_one();
        Ok(())
    }

    fn take(&self, inner: &mut Inner<T>) -> Option<T> {
        match self.discipline {
            QueueDiscipline::BreadthFirst => inner.buf.pop_front(),
            QueueDiscipline::DepthFirst => inner.buf.pop_back(),
        }
    }

    fn has_spilled_work(&self) -> bool {
        self.spill_inflight.load(Ordering::Acquire) != 0 || !self.segments.lock().is_empty()
    }

    /// Blocking pop. Returns `None` only when the search is over: either the
    /// queue was closed (cancellation/violation) or no work remains anywhere
    /// and no task is active that could still produce more.
    pub fn pop(&self) -> Result<Option<T>, StorageError> {
        let mut inner = self.inner.lock();
        loop {
            self.check_error()?;

            if self.closed.load(Ordering::Acquire) {
                return Ok(None);
            }

            if let Some(item) = self.take(&mut inner) {
                inner.active += 1;
                self.stats.popped.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(item));
            }

            if self.has_spilled_work() {
                // Reload outside the buffer lock so peers keep draining. An
                // empty reload means the writer has a batch in flight; wait
                // briefly instead of spinning on it.
                let loaded = MutexGuard::unlocked(&mut inner, || self.load_one_segment())?;
                if !loaded {
                    self.not_empty.wait_for(&mut inner, Duration::from_millis(1));
                }
                continue;
            }

            if inner.active == 0 {
                // Frontier empty, nothing spilled, nobody active: done.
                // The re-check of the buffer at the top of the loop after
                // every wake-up is what closes the push-after-observed-idle
                // race.
                self.closed.store(true, Ordering::Release);
                self.not_empty.notify_all();
                return Ok(None);
            }

            self.not_empty
                .wait_for(&mut inner, Duration::from_millis(10));
        }
    }

    /// Non-blocking variant used by the seeding path and tests.
    pub fn try_pop(&self) -> Result<Option<T>, StorageError> {
        self.check_error()?;
        let mut inner = self.inner.lock();
        if let Some(item) = self.take(&mut inner) {
            inner.active += 1;
            self.stats.popped.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(item));
        }
        drop(inner);
        if self.has_spilled_work() {
            let _ = self.load_one_segment()?;
            let mut inner = self.inner.lock();
            if let Some(item) = self.take(&mut inner) {
                inner.active += 1;
                self.stats.popped.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    /// Acknowledge a popped entry once every successor push for it is done.
    pub fn task_done(&self) {
        let mut inner = self.inner.lock();
        inner.active = inner.active.saturating_sub(1);
        if inner.active == 0 && inner.buf.is_empty() {
            // Wake idle poppers so one of them can run the termination check.
            drop(inner);
            self.not_empty.notify_all();
        }
    }

    /// Returns true iff a segment was appended to the buffer.
    fn load_one_segment(&self) -> Result<bool, StorageError> {
        let Some(_guard) = self.load_lock.try_lock() else {
            // A peer is already loading; let the caller re-check the buffer.
            std::thread::yield_now();
            return Ok(true);
        };

        let Some(path) = self.segments.lock().pop_front() else {
            return Ok(false);
        };

        let bytes = std::fs::read(&path)
            .with_context(|| format!("failed reading frontier segment {}", path.display()))
            .map_err(StorageError::Frontier)?;
        let batch: Vec<T> = bincode::deserialize(&bytes)
            .with_context(|| format!("corrupt frontier segment {}", path.display()))
            .map_err(StorageError::Frontier)?;
        std::fs::remove_file(&path)
            .with_context(|| format!("failed removing frontier segment {}", path.display()))
            .map_err(StorageError::Frontier)?;

        let loaded = batch.len() as u64;
        {
            let mut inner = self.inner.lock();
            inner.buf.extend(batch);
            let len = inner.buf.len();
            drop(inner);
            self.update_max_inmem(len);
        }
        let _ = self
            .spilled_pending
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(loaded))
            });
        self.stats.loaded_segments.fetch_add(1, Ordering::Relaxed);
        self.stats.loaded_items.fetch_add(loaded, Ordering::Relaxed);
        self.not_empty.notify_all();
        Ok(true)
    }

    /// Advisory size for progress reporting only; racy by design.
    pub fn len(&self) -> u64 {
        self.inner.lock().buf.len() as u64 + self.spilled_pending.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().buf.is_empty() && !self.has_spilled_work()
    }

    pub fn has_pending_work(&self) -> bool {
        !self.is_empty()
    }

    /// Cancellation: wake everyone; subsequent pops return `None` even if
    /// entries remain.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.not_empty.notify_all();
    }

    /// Spill every resident entry to disk and wait for the writer to drain,
    /// so on-disk segments plus the manifest capture the full frontier.
    pub fn checkpoint_flush(&self) -> Result<(), StorageError> {
        self.check_error()?;
        let mut inner = self.inner.lock();
        while !inner.buf.is_empty() {
            let take = inner.buf.len().min(self.spill_batch);
            let batch: Vec<T> = inner.buf.drain(..take).collect();
            MutexGuard::unlocked(&mut inner, || self.spill_now(batch))?;
        }
        drop(inner);
        while self.spill_inflight.load(Ordering::Acquire) != 0 {
            self.check_error()?;
            std::thread::sleep(Duration::from_millis(1));
        }
        self.check_error()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pushed: self.stats.pushed.load(Ordering::Relaxed),
            popped: self.stats.popped.load(Ordering::Relaxed),
            spilled_items: self.stats.spilled_items.load(Ordering::Relaxed),
            spill_batches: self.stats.spill_batches.load(Ordering::Relaxed),
            loaded_segments: self.stats.loaded_segments.load(Ordering::Relaxed),
            loaded_items: self.stats.loaded_items.load(Ordering::Relaxed),
            max_inmem_len: self.stats.max_inmem_len.load(Ordering::Relaxed),
        }
    }

    pub fn shutdown(&self) -> Result<(), StorageError> {
        self.close();
        self.spill_tx.lock().take();
        if let Some(handle) = self.writer_handle.lock().take() {
            let _ = handle.join();
        }
        self.check_error()
    }
}

#[cfg(test)]
mod tests {
    use super::{FrontierConfig, FrontierQueue, QueueDiscipline};
    use std::sync::Arc;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_path(prefix: &str) -> std::path::PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!("veristate-{prefix}-{nanos}-{}", std::process::id()))
    }

    fn config(dir: &std::path::Path, discipline: QueueDiscipline) -> FrontierConfig {
        FrontierConfig {
            spill_dir: dir.to_path_buf(),
            discipline,
            inmem_limit: 64,
            spill_batch: 16,
            spill_channel_bound: 8,
            load_existing_segments: false,
        }
    }

    #[test]
    fn breadth_first_is_fifo() {
        let dir = temp_path("queue-fifo");
        let queue =
            FrontierQueue::<u64>::new(config(&dir, QueueDiscipline::BreadthFirst)).unwrap();
        for i in 0..10u64 {
            queue.push(i).unwrap();
        }
        for i in 0..10u64 {
            assert_eq!(queue.try_pop().unwrap(), Some(i));
            queue.task_done();
        }
        queue.shutdown().unwrap();
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn depth_first_is_lifo() {
        let dir = temp_path("queue-lifo");
        let queue = FrontierQueue::<u64>::new(config(&dir, QueueDiscipline::DepthFirst)).unwrap();
        for i in 0..10u64 {
            queue.push(i).unwrap();
        }
        for i in (0..10u64).rev() {
            assert_eq!(queue.try_pop().unwrap(), Some(i));
            queue.task_done();
        }
        queue.shutdown().unwrap();
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn spills_and_reloads_everything() {
        let dir = temp_path("queue-spill");
        let queue =
            FrontierQueue::<u64>::new(config(&dir, QueueDiscipline::BreadthFirst)).unwrap();
        for i in 0..1_000u64 {
            queue.push(i).unwrap();
        }

        let mut out = Vec::with_capacity(1_000);
        while let Some(v) = queue.try_pop().unwrap() {
            out.push(v);
            queue.task_done();
            if out.len() > 2_000 {
                break;
            }
        }
        // The writer thread may still be flushing the last batch.
        while queue.has_pending_work() {
            if let Some(v) = queue.try_pop().unwrap() {
                out.push(v);
                queue.task_done();
            } else {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        }

        out.sort_unstable();
        assert_eq!(out.len(), 1_000);
        assert_eq!(out[0], 0);
        assert_eq!(out[999], 999);
        let stats = queue.stats();
        assert!(stats.spill_batches > 0);
        assert!(stats.loaded_segments > 0);

        queue.shutdown().unwrap();
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn blocking_pop_terminates_when_all_workers_idle() {
        let dir = temp_path("queue-term");
        let queue = Arc::new(
            FrontierQueue::<u64>::new(config(&dir, QueueDiscipline::BreadthFirst)).unwrap(),
        );
        for i in 0..500u64 {
            queue.push(i).unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            handles.push(std::thread::spawn(move || {
                let mut popped = 0u64;
                while let Some(item) = queue.pop().unwrap() {
                    // Each early item seeds one extra piece of work, so
                    // termination requires the active-task accounting.
                    if item < 100 {
                        queue.push(item + 10_000).unwrap();
                    }
                    popped += 1;
                    queue.task_done();
                }
                popped
            }));
        }
        let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 600);

        queue.shutdown().unwrap();
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn checkpoint_flush_then_resume_restores_frontier() {
        let dir = temp_path("queue-resume");
        let queue =
            FrontierQueue::<u64>::new(config(&dir, QueueDiscipline::BreadthFirst)).unwrap();
        for i in 0..200u64 {
            queue.push(i).unwrap();
        }
        queue.checkpoint_flush().unwrap();
        queue.shutdown().unwrap();

        let mut resume_config = config(&dir, QueueDiscipline::BreadthFirst);
        resume_config.load_existing_segments = true;
        let resumed = FrontierQueue::<u64>::new(resume_config).unwrap();
        assert!(resumed.has_pending_work());

        let mut out = Vec::new();
        while let Some(v) = resumed.try_pop().unwrap() {
            out.push(v);
            resumed.task_done();
        }
        out.sort_unstable();
        assert_eq!(out.len(), 200);
        assert_eq!(out[199], 199);

        resumed.shutdown().unwrap();
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn close_unblocks_waiting_workers() {
        let dir = temp_path("queue-close");
        let queue = Arc::new(
            FrontierQueue::<u64>::new(config(&dir, QueueDiscipline::BreadthFirst)).unwrap(),
        );
        queue.push(1).unwrap();
        let _held = queue.pop().unwrap();
        // One task stays active, so a second popper would block forever
        // without the close.
        let waiter = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.pop().unwrap())
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        queue.close();
        assert_eq!(waiter.join().unwrap(), None);
        queue.shutdown().unwrap();
        let _ = std::fs::remove_dir_all(dir);
    }
}
