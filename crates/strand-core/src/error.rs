//! Error types for the task runtime
//!
//! Three families, matching how a failure is handled:
//! - [`TaskFailure`]: an error raised by task code. Caught at the
//!   `resume()` boundary and stored in the task's exit result.
//! - [`ProtocolError`]: the resumable procedure itself is malformed
//!   (unbalanced boundaries, frames that were never replayed, ...).
//! - [`ContractViolation`]: the task broke the pinning discipline.
//!
//! The last two surface from `Task::resume()` as a [`RuntimeError`].

use crate::frame::Pc;
use crate::task::TaskId;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A malformed resumable procedure.
///
/// These are integration defects in the transformed code, never runtime
/// conditions a task can recover from.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// `up()` without a matching `down()`
    #[error("Malformed resumable procedure: up() without matching down() (active levels: {active})")]
    UnbalancedUp {
        /// Active levels when `up()` was called
        active: usize,
    },

    /// `end()` reached while callee levels were still active
    #[error("Malformed resumable procedure: drive ended at depth {depth}, expected the root level")]
    UnbalancedEnd {
        /// Depth at which `end()` was called
        depth: usize,
    },

    /// A suspendable boundary was used outside `begin()`/`end()`
    #[error("Malformed resumable procedure: suspendable boundary used outside a drive")]
    NotDriving,

    /// A pause or exit leaf was called without `down()`
    #[error("Malformed resumable procedure: pause leaf called without down()")]
    UnbracketedLeaf,

    /// A task completed while captured frames were never replayed
    #[error("Malformed resumable procedure: {count} captured frame(s) never replayed")]
    StaleFrames {
        /// Number of frames left on the chain
        count: usize,
    },

    /// Suspension propagated out of a level that captured nothing
    #[error("Malformed resumable procedure: suspension left depth {depth} without capturing a frame")]
    MissingCapture {
        /// Depth that failed to capture
        depth: usize,
    },

    /// A frame is being captured for a level that already holds one
    #[error("Malformed resumable procedure: depth {depth} already holds a captured frame")]
    DuplicateCapture {
        /// Depth that already held a frame
        depth: usize,
    },

    /// A captured frame used the fresh-entry resume point
    #[error("Malformed resumable procedure: frame captured at depth {depth} with resume point 0")]
    ZeroResumePoint {
        /// Depth of the offending capture
        depth: usize,
    },

    /// The locals saved for a level have a different type than the
    /// procedure expects on replay
    #[error("Malformed resumable procedure: frame at depth {depth} holds {found}, expected {expected}")]
    LocalsMismatch {
        /// Depth of the frame
        depth: usize,
        /// Type the procedure asked for
        expected: &'static str,
        /// Type that was captured
        found: &'static str,
    },

    /// A pause leaf found a procedure frame in its own slot
    #[error("Malformed resumable procedure: pause point at depth {depth} holds a procedure frame")]
    ForeignPauseSlot {
        /// Depth of the pause leaf
        depth: usize,
    },

    /// A task stopped without completing and without a pause reason
    #[error("Malformed resumable procedure: task suspended without a pause reason")]
    MissingPauseReason,

    /// A boundary or leaf was entered while a suspension was still unwinding,
    /// i.e. a caller ignored a `Capture`/`Propagate` outcome and kept going
    #[error("Malformed resumable procedure: boundary entered at depth {depth} while a suspension was unwinding")]
    BoundaryWhileUnwinding {
        /// Depth of the offending call
        depth: usize,
    },

    /// Explicit exit was requested while a frame was being replayed
    #[error("Malformed resumable procedure: exit requested during replay (pc = {pc})")]
    ExitDuringReplay {
        /// Resume point of the replayed frame
        pc: Pc,
    },
}

/// A broken resource-discipline contract.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractViolation {
    /// Suspension was requested while a non-suspendable resource was held
    #[error("Task {task} attempted to suspend while holding {pins} pin(s)")]
    PausedWhilePinned {
        /// Offending task
        task: TaskId,
        /// Pins held at the time
        pins: u32,
    },

    /// `resume()` returned while pins were still held
    #[error("Task {task} {phase} with {pins} active pin(s)")]
    PinnedOnReturn {
        /// Offending task
        task: TaskId,
        /// Pins held at the time
        pins: u32,
        /// "suspended" or "ended"
        phase: &'static str,
    },

    /// `unpin()` without a matching `pin()`
    #[error("Task {task} unpinned without a matching pin")]
    UnpinWithoutPin {
        /// Offending task
        task: TaskId,
    },
}

/// Error reported by `Task::resume()` and by the boundary operations of
/// a task context.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    /// Malformed resumable procedure
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Resource-discipline violation
    #[error(transparent)]
    Contract(#[from] ContractViolation),

    /// `resume()` called on a terminal task
    #[error("Task {0} is done and cannot be resumed")]
    AlreadyDone(TaskId),
}

/// Failure of the dynamic invocation path.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvokeError {
    /// Nothing is registered under the requested name
    #[error("Found no pausable operation registered as '{0}'")]
    UnknownOperation(String),

    /// An operation with the same name is already registered
    #[error("Pausable operation '{0}' is already registered")]
    DuplicateOperation(String),

    /// The operation was given a target of the wrong type
    #[error("Operation '{op}' expects a target of type {expected}")]
    TargetMismatch {
        /// Operation name
        op: String,
        /// Expected target type
        expected: &'static str,
    },
}

/// An error raised by task code, kept as the task's exit result.
///
/// Cheap to clone; all clones share one error.
#[derive(Clone)]
pub struct TaskFailure(Arc<anyhow::Error>);

impl TaskFailure {
    /// Wrap an error raised by task code
    pub fn new(err: anyhow::Error) -> Self {
        TaskFailure(Arc::new(err))
    }

    /// Build a failure from a caught panic payload
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        TaskFailure::new(anyhow::anyhow!("task panicked: {}", msg))
    }

    /// The underlying error
    pub fn error(&self) -> &anyhow::Error {
        &self.0
    }

    /// Downcast the underlying error
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    /// Whether two failures share the same underlying error
    pub fn same_as(&self, other: &TaskFailure) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl From<anyhow::Error> for TaskFailure {
    fn from(err: anyhow::Error) -> Self {
        TaskFailure::new(err)
    }
}

impl fmt::Debug for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TaskFailure").field(&self.0.to_string()).finish()
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_from_str_panic() {
        let failure = TaskFailure::from_panic(Box::new("boom"));
        assert_eq!(failure.to_string(), "task panicked: boom");
    }

    #[test]
    fn test_failure_from_string_panic() {
        let failure = TaskFailure::from_panic(Box::new(String::from("kaboom")));
        assert!(failure.to_string().contains("kaboom"));
    }

    #[test]
    fn test_failure_clones_share_error() {
        let failure = TaskFailure::new(anyhow::anyhow!("disk full"));
        let copy = failure.clone();
        assert!(failure.same_as(&copy));
        assert!(!failure.same_as(&TaskFailure::new(anyhow::anyhow!("disk full"))));
    }
}
