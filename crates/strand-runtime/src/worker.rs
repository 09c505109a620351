//! Worker thread that resumes Tasks
//!
//! Workers pick up tasks from their local queue, from other workers, or from
//! the shared injector, and drive each one with a single `resume()` call.

use crate::config::RuntimeOptions;
use crate::scheduler::Shared;
use crossbeam_deque::{Steal, Stealer, Worker as CWorker};
use std::sync::Arc;
use std::thread;
use strand_core::Task;
use tracing::{debug, error, trace};

/// Worker thread that resumes Tasks
pub(crate) struct Worker {
    /// Worker ID
    id: usize,

    /// Local queue; moved into the thread on start
    deque: Option<CWorker<Task>>,

    /// Stealers from other workers
    stealers: Vec<Stealer<Task>>,

    /// Shared scheduler state
    shared: Arc<Shared>,

    /// Worker thread handle
    handle: Option<thread::JoinHandle<()>>,
}

impl Worker {
    /// Create a new Worker
    pub(crate) fn new(
        id: usize,
        deque: CWorker<Task>,
        stealers: Vec<Stealer<Task>>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            id,
            deque: Some(deque),
            stealers,
            shared,
            handle: None,
        }
    }

    /// Start the worker thread
    pub(crate) fn start(&mut self, options: &RuntimeOptions) {
        let Some(deque) = self.deque.take() else {
            return;
        };
        let id = self.id;
        let stealers = self.stealers.clone();
        let shared = self.shared.clone();
        let poll_interval = options.poll_interval;

        let handle = thread::Builder::new()
            .name(format!("{}-{}", options.thread_name_prefix, id))
            .spawn(move || {
                debug!(worker = id, "worker started");
                Worker::run_loop(id, deque, stealers, shared, poll_interval);
            })
            .expect("Failed to spawn worker thread");

        self.handle = Some(handle);
    }

    /// Stop the worker thread. The caller raises the shutdown flag first.
    pub(crate) fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(worker = self.id, "worker thread panicked");
            }
        }
    }

    /// Worker thread main loop
    fn run_loop(
        id: usize,
        local: CWorker<Task>,
        stealers: Vec<Stealer<Task>>,
        shared: Arc<Shared>,
        poll_interval: std::time::Duration,
    ) {
        loop {
            if shared.shutdown.load(std::sync::atomic::Ordering::Acquire) {
                break;
            }

            let seen = shared.generation();
            match Self::find_work(id, &local, &stealers, &shared) {
                Some(task) => Self::run_task(id, task, &shared),
                None => {
                    // Parked tasks whose reason lapsed without a notify()
                    if shared.poll_parked() == 0 {
                        shared.idle_wait(seen, poll_interval);
                    }
                }
            }
        }

        debug!(worker = id, "worker shutting down");
    }

    /// Resume `task` once and route it by the outcome
    fn run_task(id: usize, mut task: Task, shared: &Shared) {
        let task_id = task.id();
        trace!(worker = id, task = %task_id, "resuming task");
        shared.record_resume();

        match task.resume() {
            Ok(true) => {
                let failed = task.exit_result().error().is_some();
                debug!(worker = id, task = %task_id, failed, "task finished");
                shared.retire(task, failed);
            }
            Ok(false) => shared.park(task),
            Err(err) => {
                error!(worker = id, task = %task_id, error = %err, "task broke the runtime contract");
                shared.retire(task, true);
            }
        }
    }

    /// Find work: local pop, then the injector, then steal
    fn find_work(
        id: usize,
        local: &CWorker<Task>,
        stealers: &[Stealer<Task>],
        shared: &Shared,
    ) -> Option<Task> {
        if let Some(task) = local.pop() {
            return Some(task);
        }

        loop {
            match shared.injector.steal_batch_and_pop(local) {
                Steal::Success(task) => return Some(task),
                Steal::Retry => continue,
                Steal::Empty => {}
            }

            match Self::steal_from_others(id, stealers) {
                Steal::Success(task) => return Some(task),
                Steal::Retry => continue,
                Steal::Empty => return None,
            }
        }
    }

    /// Steal from other workers, starting after this one
    fn steal_from_others(id: usize, stealers: &[Stealer<Task>]) -> Steal<Task> {
        if stealers.is_empty() {
            return Steal::Empty;
        }

        let start = id % stealers.len();
        stealers[start..]
            .iter()
            .chain(&stealers[..start])
            .map(Stealer::steal)
            .collect()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}
