//! Task structure and lifecycle
//!
//! A [`Task`] is a lightweight logical thread. Its stack lives in a
//! [`Fiber`] as an explicit chain of captured frames, so a suspended task
//! occupies no OS thread. The scheduler drives it with [`Task::resume`];
//! the body talks to the runtime through its [`Cx`].

use crate::error::{ContractViolation, ProtocolError, RuntimeError, TaskFailure};
use crate::fiber::{Fiber, Up};
use crate::frame::{Frame, Pc};
use crate::pause::{ExitResult, PauseReason};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::{type_name, Any};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, trace, warn};

/// Unique identifier for a Task
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    /// Generate a new unique TaskId
    pub fn new() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Create a TaskId from a u64 value
    pub fn from_u64(id: u64) -> Self {
        TaskId(id)
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State of a Task
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Created, never resumed
    Created,
    /// Inside `resume()`
    Running,
    /// Waiting on its pause reason
    Suspended,
    /// Terminal
    Done,
}

/// The root procedure of a task.
///
/// Implementations follow the down/up protocol at every suspendable call
/// (see [`crate::fiber`]). Errors returned here end the task; they never
/// reach the caller of `resume()`.
pub trait TaskBody: Send {
    /// Run (or replay) the body
    fn run(&mut self, cx: &mut Cx<'_>) -> anyhow::Result<()>;
}

struct FnBody<F>(F);

impl<F> TaskBody for FnBody<F>
where
    F: FnMut(&mut Cx<'_>) -> anyhow::Result<()> + Send,
{
    fn run(&mut self, cx: &mut Cx<'_>) -> anyhow::Result<()> {
        (self.0)(cx)
    }
}

/// The part of a task its body can reach while running.
struct Status {
    id: TaskId,
    pause_reason: Option<PauseReason>,
    pins: u32,
    violation: Option<ContractViolation>,
    exit_result: ExitResult,
}

/// A lightweight, cooperatively scheduled thread
pub struct Task {
    status: Status,

    /// Captured frames while suspended
    fiber: Fiber,

    /// Root procedure
    body: Box<dyn TaskBody>,

    /// Currently inside `resume()`
    running: bool,

    /// Terminal; never resumed again
    done: bool,

    /// Resumed at least once
    started: bool,
}

impl Task {
    /// Create a new Task running `body`
    pub fn new(body: impl TaskBody + 'static) -> Self {
        let id = TaskId::new();
        trace!(task = %id, "task created");
        Self {
            status: Status {
                id,
                pause_reason: None,
                pins: 0,
                violation: None,
                exit_result: ExitResult::Success,
            },
            fiber: Fiber::new(),
            body: Box::new(body),
            running: false,
            done: false,
            started: false,
        }
    }

    /// Create a new Task whose body is a closure
    pub fn from_fn<F>(body: F) -> Self
    where
        F: FnMut(&mut Cx<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        Self::new(FnBody(body))
    }

    /// Get the Task's unique ID
    pub fn id(&self) -> TaskId {
        self.status.id
    }

    /// Get the current state
    pub fn state(&self) -> TaskState {
        if self.done {
            TaskState::Done
        } else if self.running {
            TaskState::Running
        } else if self.started {
            TaskState::Suspended
        } else {
            TaskState::Created
        }
    }

    /// Whether the task is terminal
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Whether the task is inside `resume()`
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// The current pause condition
    pub fn pause_reason(&self) -> Option<&PauseReason> {
        self.status.pause_reason.as_ref()
    }

    /// How the task ended; the success marker until it does
    pub fn exit_result(&self) -> &ExitResult {
        &self.status.exit_result
    }

    /// Number of held non-suspendable resources
    pub fn pin_count(&self) -> u32 {
        self.status.pins
    }

    /// The continuation manager (for inspection)
    pub fn fiber(&self) -> &Fiber {
        &self.fiber
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Synchronously run the task until it suspends or completes.
    ///
    /// Returns `Ok(true)` once the task is done, `Ok(false)` if it is
    /// suspended on its pause reason. Errors raised by the body end the task
    /// and are reported through [`Task::exit_result`]. `Err` is reserved for a
    /// malformed resumable procedure or a broken pinning contract; the task
    /// is terminal afterwards.
    pub fn resume(&mut self) -> Result<bool, RuntimeError> {
        let id = self.status.id;
        if self.done {
            return Err(RuntimeError::AlreadyDone(id));
        }

        self.running = true;
        self.started = true;
        self.fiber.begin();
        trace!(task = %id, pc = self.fiber.pc(), "task resuming");

        let outcome = {
            let Task {
                status,
                fiber,
                body,
                ..
            } = self;
            panic::catch_unwind(AssertUnwindSafe(|| {
                let mut cx = Cx { fiber, status };
                body.run(&mut cx)
            }))
        };

        let result = match outcome {
            Ok(Ok(())) => self.finish_drive(),
            // Violations by this task were recorded when they were raised;
            // anything else the body returns is its own failure.
            Ok(Err(err)) => self.fail_drive(TaskFailure::new(err)),
            Err(payload) => self.fail_drive(TaskFailure::from_panic(payload)),
        };
        self.running = false;

        let result = result.and_then(|done| self.check_pins(done));
        match &result {
            Ok(true) => debug!(task = %id, result = %self.status.exit_result, "task done"),
            Ok(false) => debug!(
                task = %id,
                frames = self.fiber.chain().len(),
                "task suspended"
            ),
            Err(err) => self.poison(err),
        }
        result
    }

    /// The body returned normally: either it completed or a suspension
    /// unwound all the way out.
    fn finish_drive(&mut self) -> Result<bool, RuntimeError> {
        if let Some(violation) = self.status.violation.take() {
            return Err(violation.into());
        }
        let exiting = self.fiber.is_exiting();
        let unwound = self.fiber.end()?;

        let finished = self
            .status
            .pause_reason
            .as_ref()
            .is_some_and(PauseReason::is_done);
        let done = if finished {
            true
        } else if exiting {
            // An exit request is terminal whatever reason was left behind
            self.status.pause_reason = Some(PauseReason::Done(self.status.exit_result.clone()));
            true
        } else if unwound {
            self.status.pause_reason = Some(PauseReason::Done(ExitResult::Success));
            true
        } else if self.status.pause_reason.is_some() {
            false
        } else {
            return Err(ProtocolError::MissingPauseReason.into());
        };
        if done {
            self.fiber.reset();
            self.done = true;
        }
        Ok(done)
    }

    /// The body raised an error or panicked
    fn fail_drive(&mut self, failure: TaskFailure) -> Result<bool, RuntimeError> {
        if let Some(violation) = self.status.violation.take() {
            return Err(violation.into());
        }
        if let Some(fault) = self.fiber.take_fault() {
            return Err(fault.into());
        }
        warn!(task = %self.status.id, error = %failure, "task failed");
        self.fiber.reset();
        self.terminate_with(ExitResult::Error(failure));
        Ok(true)
    }

    fn check_pins(&self, done: bool) -> Result<bool, RuntimeError> {
        match self.status.pins {
            0 => Ok(done),
            pins => Err(ContractViolation::PinnedOnReturn {
                task: self.status.id,
                pins,
                phase: if done { "ended" } else { "suspended" },
            }
            .into()),
        }
    }

    /// End the task after a protocol or contract violation
    fn poison(&mut self, err: &RuntimeError) {
        error!(task = %self.status.id, error = %err, "task poisoned");
        self.fiber.reset();
        self.status.pins = 0;
        self.status.violation = None;
        let failure = TaskFailure::new(anyhow::Error::new(err.clone()));
        self.terminate_with(ExitResult::Error(failure));
    }

    fn terminate_with(&mut self, result: ExitResult) {
        self.status.exit_result = result.clone();
        self.status.pause_reason = Some(PauseReason::Done(result));
        self.done = true;
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Task {}

impl Hash for Task {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.status.id)
            .field("state", &self.state())
            .field("pause_reason", &self.status.pause_reason)
            .field("pins", &self.status.pins)
            .finish()
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(running={},pr=", self.status.id, self.running)?;
        match &self.status.pause_reason {
            Some(reason) => write!(f, "{})", reason),
            None => f.write_str("null)"),
        }
    }
}

// =============================================================================
// Body context
// =============================================================================

/// A running task as seen from inside its body.
///
/// Carries the boundary operations of the down/up protocol and the task
/// operations that are only meaningful while the body runs: pause, yield,
/// exit, pin and unpin.
pub struct Cx<'a> {
    fiber: &'a mut Fiber,
    status: &'a mut Status,
}

impl Cx<'_> {
    /// The running task's id
    pub fn task_id(&self) -> TaskId {
        self.status.id
    }

    /// Resume point of the current level (0 = fresh entry)
    pub fn pc(&self) -> Pc {
        self.fiber.pc()
    }

    /// Current call depth (root = 0)
    pub fn depth(&self) -> usize {
        self.fiber.depth().unwrap_or(0)
    }

    /// The continuation manager (read-only)
    pub fn fiber(&self) -> &Fiber {
        &*self.fiber
    }

    /// The pause reason currently recorded
    pub fn pause_reason(&self) -> Option<&PauseReason> {
        self.status.pause_reason.as_ref()
    }

    // =========================================================================
    // Down/up protocol
    // =========================================================================

    /// Enter a callee that may suspend
    pub fn down(&mut self) {
        self.fiber.down();
    }

    /// Return from a callee; branch on the outcome
    pub fn up(&mut self) -> Result<Up, RuntimeError> {
        Ok(self.fiber.up()?)
    }

    /// Locals saved for the current level, if it is being replayed.
    ///
    /// Returns the resume point and a copy of the locals. The frame itself
    /// stays on the chain until the call at that resume point returns.
    pub fn restore<L: Any + Clone>(&mut self) -> Result<Option<(Pc, L)>, RuntimeError> {
        let depth = self.depth();
        let mismatch = match self.fiber.state() {
            None => return Ok(None),
            Some(frame) => match frame.locals::<L>() {
                Some(locals) => return Ok(Some((frame.pc(), locals.clone()))),
                None => ProtocolError::LocalsMismatch {
                    depth,
                    expected: type_name::<L>(),
                    found: frame.locals_type(),
                },
            },
        };
        Err(self.fiber.record(mismatch).into())
    }

    /// Save the current level's locals after an [`Up::Capture`] outcome
    pub fn capture<L: Any + Send>(&mut self, pc: Pc, locals: L) -> Result<(), RuntimeError> {
        Ok(self.fiber.set_state(Frame::new(pc, locals))?)
    }

    // =========================================================================
    // Suspension
    // =========================================================================

    /// Suspend with `reason`.
    ///
    /// A suspendable leaf: bracket it with `down()`/`up()`. When replayed it
    /// clears the pause reason and execution continues after the call.
    pub fn pause(&mut self, reason: PauseReason) -> Result<(), RuntimeError> {
        if let PauseReason::Done(result) = reason {
            return self.terminate(result);
        }
        self.check_unpinned()?;
        let fresh = self.fiber.pc() == 0;
        self.fiber.toggle_pause()?;
        if fresh {
            trace!(task = %self.status.id, depth = self.depth(), reason = %reason, "pausing");
            self.status.pause_reason = Some(reason);
        } else {
            self.status.pause_reason = None;
        }
        Ok(())
    }

    /// Give other tasks a turn
    pub fn yield_now(&mut self) -> Result<(), RuntimeError> {
        self.pause(PauseReason::Yield)
    }

    /// End the task with `value` as its exit result.
    ///
    /// A suspendable leaf like [`Cx::pause`]; the unwind it starts is never
    /// replayed, so callers need not capture.
    pub fn exit(&mut self, value: Value) -> Result<(), RuntimeError> {
        self.terminate(ExitResult::Value(value))
    }

    /// End the task with `error` as its exit result
    pub fn error_exit(&mut self, error: anyhow::Error) -> Result<(), RuntimeError> {
        self.terminate(ExitResult::Error(TaskFailure::new(error)))
    }

    fn terminate(&mut self, result: ExitResult) -> Result<(), RuntimeError> {
        self.check_unpinned()?;
        self.fiber.request_exit()?;
        trace!(task = %self.status.id, result = %result, "exit requested");
        self.status.exit_result = result.clone();
        self.status.pause_reason = Some(PauseReason::Done(result));
        Ok(())
    }

    // =========================================================================
    // Pinning
    // =========================================================================

    /// Mark a non-suspendable resource as held
    pub fn pin(&mut self) {
        self.status.pins += 1;
    }

    /// Release a resource marked with [`Cx::pin`]
    pub fn unpin(&mut self) -> Result<(), RuntimeError> {
        if self.status.pins == 0 {
            return Err(self.violate(ContractViolation::UnpinWithoutPin {
                task: self.status.id,
            }));
        }
        self.status.pins -= 1;
        Ok(())
    }

    /// Number of held pins
    pub fn pin_count(&self) -> u32 {
        self.status.pins
    }

    fn check_unpinned(&mut self) -> Result<(), RuntimeError> {
        match self.status.pins {
            0 => Ok(()),
            pins => Err(self.violate(ContractViolation::PausedWhilePinned {
                task: self.status.id,
                pins,
            })),
        }
    }

    fn violate(&mut self, violation: ContractViolation) -> RuntimeError {
        if self.status.violation.is_none() {
            self.status.violation = Some(violation.clone());
        }
        violation.into()
    }
}
