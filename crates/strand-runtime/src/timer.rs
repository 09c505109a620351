//! Timer service
//!
//! Releases latches at their deadlines. A dedicated thread waits for the
//! earliest deadline using condvar timeouts, releases every latch that is
//! due, and calls the waker so the scheduler re-checks its parked tasks.
//! The service knows nothing about tasks.

use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use strand_core::Latch;
use tracing::{debug, trace};

/// Callback run after one or more latches were released
pub type Waker = Arc<dyn Fn() + Send + Sync>;

/// Entry in the timer heap
struct TimerEntry {
    /// When to release the latch
    deadline: Instant,
    /// Registration order, to release equal deadlines first-in first-out
    seq: u64,
    /// Releases the latch
    release: Box<dyn FnOnce() + Send>,
}

// Reverse ordering for min-heap (earliest deadline first)
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

/// Timer thread state
#[derive(Default)]
struct TimerState {
    /// Pending latches, earliest deadline first
    pending: BinaryHeap<TimerEntry>,
    /// Next registration number
    next_seq: u64,
}

/// Process-scoped timer service
pub struct TimerService {
    /// Internal state protected by mutex
    state: Mutex<TimerState>,
    /// Wakes the timer thread when an entry is added or on shutdown
    notify: Condvar,
    /// Shutdown signal
    shutdown: AtomicBool,
    /// Thread handle
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    /// Create a stopped timer service
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start the timer thread. `waker` runs after latches are released.
    pub fn start(self: &Arc<Self>, waker: Waker) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        self.shutdown.store(false, AtomicOrdering::Release);
        let timer = Arc::clone(self);

        *handle = Some(
            thread::Builder::new()
                .name("strand-timer".to_string())
                .spawn(move || timer.run_loop(waker))
                .expect("Failed to spawn timer thread"),
        );
        debug!("timer started");
    }

    /// Stop the timer thread. Pending latches stay registered.
    pub fn stop(&self) {
        self.shutdown.store(true, AtomicOrdering::Release);
        {
            // Taking the lock orders this notification after the loop's
            // shutdown check.
            let _state = self.state.lock();
            self.notify.notify_one();
        }

        if let Some(handle) = self.handle.lock().take() {
            let start = Instant::now();
            let timeout = Duration::from_secs(2);
            loop {
                if handle.is_finished() {
                    let _ = handle.join();
                    return;
                }
                if start.elapsed() > timeout {
                    drop(handle);
                    return;
                }
                thread::sleep(Duration::from_millis(5));
            }
        }
    }

    /// Whether the timer thread is running
    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some()
    }

    /// Release `latch` at `deadline`
    pub fn schedule<T>(&self, latch: Arc<Latch<T>>, deadline: Instant)
    where
        T: std::fmt::Debug + Send + Sync + 'static,
    {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.pending.push(TimerEntry {
            deadline,
            seq,
            release: Box::new(move || latch.release()),
        });
        // The new entry may be due before the one the thread waits for
        self.notify.notify_one();
    }

    /// A latch released after `duration`. Its payload is the deadline.
    pub fn sleep_latch(&self, duration: Duration) -> Arc<Latch<Instant>> {
        let deadline = Instant::now() + duration;
        let latch = Latch::new(deadline);
        self.schedule(latch.clone(), deadline);
        latch
    }

    /// Number of latches not yet released
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Timer thread main loop
    fn run_loop(&self, waker: Waker) {
        loop {
            let mut state = self.state.lock();
            if self.shutdown.load(AtomicOrdering::Acquire) {
                break;
            }

            // Collect everything that is due
            let now = Instant::now();
            let mut due = Vec::new();
            while state.pending.peek().is_some_and(|entry| entry.deadline <= now) {
                if let Some(entry) = state.pending.pop() {
                    due.push(entry);
                }
            }

            if !due.is_empty() {
                drop(state);
                trace!(released = due.len(), "timer deadlines passed");
                for entry in due {
                    (entry.release)();
                }
                waker();
                continue;
            }

            // Wait for the next deadline or a new registration
            match state.pending.peek().map(|next| next.deadline) {
                Some(deadline) => {
                    self.notify.wait_until(&mut state, deadline);
                }
                None => self.notify.wait(&mut state),
            }
        }

        debug!("timer thread shutting down");
    }
}

impl Default for TimerService {
    fn default() -> Self {
        Self {
            state: Mutex::new(TimerState::default()),
            notify: Condvar::new(),
            shutdown: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_waker() -> (Waker, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let waker: Waker = Arc::new(move || {
            seen.fetch_add(1, AtomicOrdering::SeqCst);
        });
        (waker, count)
    }

    fn wait_for(condition: impl Fn() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(2) {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    #[test]
    fn test_timer_creation() {
        let timer = TimerService::new();
        assert_eq!(timer.pending(), 0);
        assert!(!timer.is_running());
    }

    #[test]
    fn test_timer_schedule_without_thread() {
        let timer = TimerService::new();
        let latch = timer.sleep_latch(Duration::from_millis(1));
        assert_eq!(timer.pending(), 1);
        thread::sleep(Duration::from_millis(5));
        // Nothing is released until the thread runs
        assert!(!latch.is_released());
    }

    #[test]
    fn test_timer_releases_latch() {
        let timer = TimerService::new();
        let (waker, wakes) = counting_waker();
        timer.start(waker);

        let latch = timer.sleep_latch(Duration::from_millis(20));
        assert!(!latch.is_released());
        assert!(wait_for(|| latch.is_released()));
        assert!(wait_for(|| wakes.load(AtomicOrdering::SeqCst) >= 1));
        assert_eq!(timer.pending(), 0);

        timer.stop();
        assert!(!timer.is_running());
    }

    #[test]
    fn test_timer_releases_in_deadline_order() {
        let timer = TimerService::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let (waker, _) = counting_waker();

        let now = Instant::now();
        let latches: Vec<_> = [60u64, 20, 40]
            .iter()
            .map(|ms| {
                let latch = Latch::new(*ms);
                timer.schedule(latch.clone(), now + Duration::from_millis(*ms));
                latch
            })
            .collect();

        let observer = order.clone();
        let mut watched = latches.clone();
        watched.sort_by_key(|latch| *latch.payload());
        let record: Waker = Arc::new(move || {
            let mut order = observer.lock();
            for latch in &watched {
                if latch.is_released() && !order.contains(latch.payload()) {
                    order.push(*latch.payload());
                }
            }
        });
        timer.start(Arc::new(move || {
            record();
            waker();
        }));

        assert!(wait_for(|| latches.iter().all(|l| l.is_released())));
        assert!(wait_for(|| order.lock().len() == 3));
        assert_eq!(*order.lock(), vec![20, 40, 60]);
        timer.stop();
    }

    #[test]
    fn test_timer_shutdown_keeps_pending() {
        let timer = TimerService::new();
        let (waker, _) = counting_waker();
        timer.start(waker);

        let latch = timer.sleep_latch(Duration::from_secs(60));
        timer.stop();
        assert_eq!(timer.pending(), 1);
        assert!(!latch.is_released());
    }
}
