//! Purpose: Bounded worker pool that runs flush/commit work off the caller's thread.
//! Exports: `AsyncTaskManager`, `Task`, `FlushRequest`, `Flushable`, `TaskStats`.
//! Role: Process-wide runtime piece handed to journaling stores for async commits.
//! Invariants: At most one queued task per merge key; merging keeps every waiter's barrier.
//! Invariants: Queued tasks run FIFO; workers drain the queue before shutting down.
use std::collections::{HashSet, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

use crate::core::barrier::SyncBarrier;
use crate::core::config::TaskManagerConfig;
use crate::core::error::{Error, ErrorKind};

pub type MergeKey = u64;

/// Something whose pending writes can be forced to stable storage.
pub trait Flushable: Send + Sync {
    fn flush(&self) -> Result<(), Error>;
}

pub struct FlushRequest {
    key: MergeKey,
    target: Arc<dyn Flushable>,
    barriers: Vec<SyncBarrier>,
}

impl FlushRequest {
    pub fn new(key: MergeKey, target: Arc<dyn Flushable>, barrier: SyncBarrier) -> Self {
        Self {
            key,
            target,
            barriers: vec![barrier],
        }
    }

    fn run(self) {
        let result = self.target.flush();
        if let Err(err) = &result {
            error!(key = self.key, error = %err, "async flush failed");
        }
        for barrier in &self.barriers {
            barrier.signal(result.as_ref().map(|_| ()));
        }
    }
}

pub enum Task {
    /// Mergeable: a queued flush for the same key absorbs later requests.
    Flush(FlushRequest),
    Run(Box<dyn FnOnce() + Send + 'static>),
}

impl Task {
    pub fn run_fn(f: impl FnOnce() + Send + 'static) -> Self {
        Task::Run(Box::new(f))
    }

    pub fn merge_key(&self) -> Option<MergeKey> {
        match self {
            Task::Flush(request) => Some(request.key),
            Task::Run(_) => None,
        }
    }

    /// Folds `other` into `self`; hands it back if the two cannot merge.
    fn merge(&mut self, other: Task) -> Result<(), Task> {
        match (self, other) {
            (Task::Flush(mine), Task::Flush(theirs)) if mine.key == theirs.key => {
                mine.barriers.extend(theirs.barriers);
                Ok(())
            }
            (_, other) => Err(other),
        }
    }

    fn run(self) {
        match self {
            Task::Flush(request) => request.run(),
            Task::Run(f) => f(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TaskStats {
    pub queued: usize,
    pub idle: usize,
    pub running: usize,
    pub workers: usize,
    pub completed: u64,
    pub merged: u64,
}

#[derive(Default)]
struct PoolState {
    queue: VecDeque<Task>,
    pending: HashSet<MergeKey>,
    idle: usize,
    running: usize,
    workers: usize,
    spawned: u64,
    completed: u64,
    merged: u64,
    shutdown: bool,
}

struct Shared {
    state: Mutex<PoolState>,
    work: Condvar,
    settled: Condvar,
    config: TaskManagerConfig,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct AsyncTaskManager {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl AsyncTaskManager {
    pub fn new(config: TaskManagerConfig) -> Result<Self, Error> {
        config.validate()?;
        let manager = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState::default()),
                work: Condvar::new(),
                settled: Condvar::new(),
                config,
            }),
            handles: Mutex::new(Vec::new()),
        };
        {
            let mut state = manager.shared.state();
            for _ in 0..manager.shared.config.min_threads {
                manager.spawn_worker(&mut state)?;
            }
        }
        Ok(manager)
    }

    pub fn execute(&self, task: Task) -> Result<(), Error> {
        let mut state = self.shared.state();
        if state.shutdown {
            return Err(Error::new(ErrorKind::Closed).with_message("task manager is shut down"));
        }
        if let Some(key) = task.merge_key() {
            if state.pending.contains(&key) {
                let mut task = Some(task);
                for queued in state.queue.iter_mut() {
                    if queued.merge_key() != Some(key) {
                        continue;
                    }
                    if let Some(incoming) = task.take() {
                        if let Err(rejected) = queued.merge(incoming) {
                            task = Some(rejected);
                        }
                    }
                    break;
                }
                if task.is_none() {
                    state.merged += 1;
                    return Ok(());
                }
                return Err(Error::new(ErrorKind::Internal).with_message("pending merge key without queued task"));
            }
            state.pending.insert(key);
        }
        state.queue.push_back(task);
        if state.idle > 0 {
            self.shared.work.notify_one();
        } else if state.workers < self.shared.config.max_threads {
            self.spawn_worker(&mut state)?;
        }
        Ok(())
    }

    pub fn stats(&self) -> TaskStats {
        let state = self.shared.state();
        TaskStats {
            queued: state.queue.len(),
            idle: state.idle,
            running: state.running,
            workers: state.workers,
            completed: state.completed,
            merged: state.merged,
        }
    }

    /// Blocks until the queue is empty and no task is running.
    pub fn wait_idle(&self) {
        let mut state = self.shared.state();
        while !state.queue.is_empty() || state.running > 0 {
            state = self
                .shared
                .settled
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Runs what is queued, then stops every worker.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state();
            state.shutdown = true;
        }
        self.shared.work.notify_all();
        let handles = {
            let mut guard = self
                .handles
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            let _ = handle.join();
        }
    }

    fn spawn_worker(&self, state: &mut PoolState) -> Result<(), Error> {
        state.spawned += 1;
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("queuestore-worker-{}", state.spawned))
            .spawn(move || worker_loop(shared))
            .map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to spawn worker thread")
                    .with_source(err)
            })?;
        state.workers += 1;
        debug!(workers = state.workers, "spawned task worker");
        let mut handles = self
            .handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handles.retain(|handle| !handle.is_finished());
        handles.push(handle);
        Ok(())
    }
}

impl Drop for AsyncTaskManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let task = {
            let mut state = shared.state();
            loop {
                if let Some(task) = state.queue.pop_front() {
                    if let Some(key) = task.merge_key() {
                        state.pending.remove(&key);
                    }
                    state.running += 1;
                    break task;
                }
                if state.shutdown {
                    state.workers -= 1;
                    shared.settled.notify_all();
                    return;
                }
                if state.idle >= shared.config.max_idle && state.workers > shared.config.min_threads {
                    state.workers -= 1;
                    debug!(workers = state.workers, "retired idle task worker");
                    return;
                }
                state.idle += 1;
                state = shared
                    .work
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                state.idle -= 1;
            }
        };

        if catch_unwind(AssertUnwindSafe(|| task.run())).is_err() {
            error!("task panicked on worker thread");
        }

        let mut state = shared.state();
        state.running -= 1;
        state.completed += 1;
        drop(state);
        shared.settled.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::{AsyncTaskManager, FlushRequest, Flushable, Task};
    use crate::core::barrier::SyncBarrier;
    use crate::core::config::TaskManagerConfig;
    use crate::core::error::{Error, ErrorKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};

    struct CountingFlush {
        calls: AtomicUsize,
        fail: bool,
    }

    impl Flushable for CountingFlush {
        fn flush(&self) -> Result<(), Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::new(ErrorKind::JournalFailed).with_message("boom"));
            }
            Ok(())
        }
    }

    fn config(min: usize, idle: usize, max: usize) -> TaskManagerConfig {
        TaskManagerConfig {
            min_threads: min,
            max_idle: idle,
            max_threads: max,
        }
    }

    #[test]
    fn tasks_run_in_fifo_order_on_single_worker() {
        let manager = AsyncTaskManager::new(config(1, 1, 1)).expect("manager");
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..20 {
            let seen = Arc::clone(&seen);
            manager
                .execute(Task::run_fn(move || seen.lock().expect("lock").push(i)))
                .expect("execute");
        }
        manager.wait_idle();
        assert_eq!(*seen.lock().expect("lock"), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn queued_flushes_for_same_key_merge() {
        let manager = AsyncTaskManager::new(config(1, 1, 1)).expect("manager");
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        manager
            .execute(Task::run_fn(move || {
                let _ = started_tx.send(());
                let _ = release_rx.recv();
            }))
            .expect("block worker");
        started_rx.recv().expect("worker busy");

        let target = Arc::new(CountingFlush {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let barriers: Vec<SyncBarrier> = (0..5).map(|_| SyncBarrier::new()).collect();
        for barrier in &barriers {
            barrier.arm();
            let request = FlushRequest::new(7, target.clone(), barrier.clone());
            manager.execute(Task::Flush(request)).expect("execute");
        }
        assert_eq!(manager.stats().queued, 1);
        assert_eq!(manager.stats().merged, 4);

        release_tx.send(()).expect("release");
        for barrier in &barriers {
            barrier.wait().expect("flushed");
        }
        manager.wait_idle();
        assert_eq!(target.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_flush_reaches_every_barrier() {
        let manager = AsyncTaskManager::new(config(0, 1, 2)).expect("manager");
        let target = Arc::new(CountingFlush {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let barrier = SyncBarrier::new();
        barrier.arm();
        manager
            .execute(Task::Flush(FlushRequest::new(1, target, barrier.clone())))
            .expect("execute");
        assert_eq!(barrier.wait().expect_err("failed").kind(), ErrorKind::JournalFailed);
    }

    #[test]
    fn pool_grows_to_max_and_retires_idle_workers() {
        let manager = AsyncTaskManager::new(config(0, 0, 3)).expect("manager");
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));
        for _ in 0..3 {
            let rx = Arc::clone(&release_rx);
            manager
                .execute(Task::run_fn(move || {
                    let _ = rx.lock().expect("lock").recv();
                }))
                .expect("execute");
        }
        assert_eq!(manager.stats().workers, 3);
        for _ in 0..3 {
            release_tx.send(()).expect("release");
        }
        manager.wait_idle();
        manager.shutdown();
        assert_eq!(manager.stats().workers, 0);
        assert_eq!(manager.stats().completed, 3);
    }

    #[test]
    fn execute_after_shutdown_is_rejected() {
        let manager = AsyncTaskManager::new(config(1, 1, 1)).expect("manager");
        manager.shutdown();
        let err = manager.execute(Task::run_fn(|| {})).expect_err("closed");
        assert_eq!(err.kind(), ErrorKind::Closed);
    }
}
