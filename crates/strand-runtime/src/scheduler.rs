//! Cooperative task scheduler coordinating worker threads
//!
//! Tasks travel by value: a task sits in exactly one of the run queues, the
//! parked set, the finished set, or the hands of the one worker resuming
//! it. A suspended task is parked until its pause reason stops being valid;
//! parked tasks are re-checked on every [`Scheduler::notify`] and by idle
//! workers every poll interval.

use crate::config::RuntimeOptions;
use crate::error::SchedulerError;
use crate::timer::Waker;
use crate::worker::Worker;
use crossbeam_deque::{Injector, Worker as CWorker};
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use strand_core::{Task, TaskId, TaskState};
use tracing::{debug, trace, warn};

/// Scheduler statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Total tasks spawned
    pub tasks_spawned: u64,

    /// Tasks that ended successfully or with an exit value
    pub tasks_completed: u64,

    /// Tasks that ended with an error
    pub tasks_failed: u64,

    /// Total `resume()` calls
    pub resumes: u64,

    /// Tasks spawned and not yet finished
    pub live_tasks: usize,

    /// Suspended tasks waiting on their pause reason
    pub parked_tasks: usize,
}

/// State shared by the scheduler handle, its workers and its waker
pub(crate) struct Shared {
    /// Runnable tasks
    pub(crate) injector: Injector<Task>,

    /// Suspended tasks
    parked: Mutex<FxHashMap<TaskId, Task>>,

    /// Terminal tasks not yet collected
    finished: Mutex<FxHashMap<TaskId, Task>>,

    /// Whether terminal tasks go to `finished` at all
    retain_finished: bool,

    /// Bumped whenever new work may be available
    signal: Mutex<u64>,
    wakeup: Condvar,

    pub(crate) shutdown: AtomicBool,

    spawned: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    resumes: AtomicU64,
    live: AtomicUsize,
}

impl Shared {
    fn new(retain_finished: bool) -> Self {
        Self {
            injector: Injector::new(),
            parked: Mutex::new(FxHashMap::default()),
            finished: Mutex::new(FxHashMap::default()),
            retain_finished,
            signal: Mutex::new(0),
            wakeup: Condvar::new(),
            shutdown: AtomicBool::new(false),
            spawned: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            resumes: AtomicU64::new(0),
            live: AtomicUsize::new(0),
        }
    }

    /// Current wake-up generation
    pub(crate) fn generation(&self) -> u64 {
        *self.signal.lock()
    }

    /// Tell idle workers that work may be available
    pub(crate) fn wake_all(&self) {
        *self.signal.lock() += 1;
        self.wakeup.notify_all();
    }

    /// Sleep until woken or `timeout` passes, unless a wake-up happened
    /// since `seen` was read
    pub(crate) fn idle_wait(&self, seen: u64, timeout: Duration) {
        let mut signal = self.signal.lock();
        if *signal == seen && !self.shutdown.load(Ordering::Acquire) {
            self.wakeup.wait_for(&mut signal, timeout);
        }
    }

    pub(crate) fn record_resume(&self) {
        self.resumes.fetch_add(1, Ordering::Relaxed);
    }

    /// Park a suspended task, or queue it at once if its reason already
    /// lapsed.
    pub(crate) fn park(&self, task: Task) {
        let mut parked = self.parked.lock();
        if is_runnable(&task) {
            drop(parked);
            self.injector.push(task);
            self.wake_all();
        } else {
            trace!(task = %task.id(), "task parked");
            parked.insert(task.id(), task);
        }
    }

    /// Move every parked task whose reason lapsed back to the run queue.
    ///
    /// Returns how many tasks were moved.
    pub(crate) fn poll_parked(&self) -> usize {
        let ready: Vec<Task> = {
            let mut parked = self.parked.lock();
            let ids: Vec<TaskId> = parked
                .iter()
                .filter(|(_, task)| is_runnable(task))
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| parked.remove(id)).collect()
        };

        let count = ready.len();
        if count > 0 {
            for task in ready {
                trace!(task = %task.id(), "task unparked");
                self.injector.push(task);
            }
            self.wake_all();
        }
        count
    }

    /// Record a terminal task
    pub(crate) fn retire(&self, task: Task, failed: bool) {
        if failed {
            self.failed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.completed.fetch_add(1, Ordering::Relaxed);
        }
        if self.retain_finished {
            self.finished.lock().insert(task.id(), task);
        } else {
            trace!(task = %task.id(), "finished task dropped");
        }
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A suspended task may run again once its reason reports that there is
/// nothing left to wait for
fn is_runnable(task: &Task) -> bool {
    task.pause_reason()
        .is_some_and(|reason| !reason.is_valid(task))
}

/// Multi-worker cooperative scheduler
///
/// Terminal tasks are kept until [`Scheduler::take_finished`] collects them.
/// A long-running scheduler whose callers never collect should turn
/// [`RuntimeOptions::retain_finished`] off.
pub struct Scheduler {
    /// Worker threads
    workers: Vec<Worker>,

    /// Shared run queue, parked set and counters
    shared: Arc<Shared>,

    options: RuntimeOptions,

    /// Whether the workers are running
    started: bool,
}

impl Scheduler {
    /// Create a scheduler; no thread runs until [`Scheduler::start`]
    pub fn new(options: RuntimeOptions) -> Self {
        let worker_count = options.worker_count();
        let shared = Arc::new(Shared::new(options.retain_finished));

        let deques: Vec<CWorker<Task>> = (0..worker_count).map(|_| CWorker::new_fifo()).collect();
        let stealers: Vec<_> = deques.iter().map(CWorker::stealer).collect();

        let workers = deques
            .into_iter()
            .enumerate()
            .map(|(id, deque)| {
                // Steal from every worker except self
                let others = stealers
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != id)
                    .map(|(_, s)| s.clone())
                    .collect();
                Worker::new(id, deque, others, shared.clone())
            })
            .collect();

        Self {
            workers,
            shared,
            options,
            started: false,
        }
    }

    /// Start all worker threads
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        if self.shared.shutdown.load(Ordering::Acquire) {
            warn!("scheduler was shut down; not restarting");
            return;
        }

        for worker in &mut self.workers {
            worker.start(&self.options);
        }
        self.started = true;
        debug!(workers = self.workers.len(), "scheduler started");
    }

    /// Queue a task that has not run yet
    pub fn spawn(&self, task: Task) -> Result<TaskId, SchedulerError> {
        let id = task.id();
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(SchedulerError::ShutDown(id));
        }
        if task.state() != TaskState::Created {
            return Err(SchedulerError::AlreadyStarted(id));
        }

        self.shared.spawned.fetch_add(1, Ordering::Relaxed);
        self.shared.live.fetch_add(1, Ordering::AcqRel);
        self.shared.injector.push(task);
        self.shared.wake_all();
        trace!(task = %id, "task spawned");
        Ok(id)
    }

    /// Re-check parked tasks now. Call after flipping a pause condition.
    pub fn notify(&self) {
        self.shared.poll_parked();
    }

    /// A callback that runs [`Scheduler::notify`], for event sources such as
    /// the timer service
    pub fn waker(&self) -> Waker {
        let shared = Arc::downgrade(&self.shared);
        Arc::new(move || {
            if let Some(shared) = shared.upgrade() {
                shared.poll_parked();
            }
        })
    }

    /// Remove and return a terminal task.
    ///
    /// Always `None` when `retain_finished` is off.
    pub fn take_finished(&self, id: TaskId) -> Option<Task> {
        self.shared.finished.lock().remove(&id)
    }

    /// Wait until every spawned task finished. Returns `false` on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let start = Instant::now();

        loop {
            if self.shared.live.load(Ordering::Acquire) == 0 {
                return true;
            }
            if start.elapsed() > timeout {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Get scheduler statistics
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            tasks_spawned: self.shared.spawned.load(Ordering::Relaxed),
            tasks_completed: self.shared.completed.load(Ordering::Relaxed),
            tasks_failed: self.shared.failed.load(Ordering::Relaxed),
            resumes: self.shared.resumes.load(Ordering::Relaxed),
            live_tasks: self.shared.live.load(Ordering::Acquire),
            parked_tasks: self.shared.parked.lock().len(),
        }
    }

    /// Number of workers
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Check if the scheduler has been started
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Stop all workers. Tasks still queued or parked are dropped with the
    /// scheduler; finished tasks can still be collected.
    pub fn shutdown(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if !self.started {
            return;
        }

        self.shared.wake_all();
        for worker in &mut self.workers {
            worker.stop();
        }
        self.started = false;
        debug!("scheduler shut down");
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(RuntimeOptions::default())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
