//! Pause conditions
//!
//! A [`PauseReason`] records why a task is suspended and decides when it may
//! run again. `is_valid` answers "is there still a reason to keep waiting?":
//! a scheduler resumes a suspended task only once its reason reports `false`.
//! The reason is evaluated by the scheduler, never by the task itself.

use crate::defaults::SUCCESS_MARKER;
use crate::error::TaskFailure;
use crate::task::Task;
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Implementation-specific reason for suspending a task.
///
/// Validity may change from outside the task (a timer, an I/O completion);
/// the runtime places no constraint on how it becomes false.
pub trait PauseCondition: Any + Send + Sync + fmt::Debug {
    /// Whether `task` should keep waiting
    fn is_valid(&self, task: &Task) -> bool;
}

/// How a terminal task ended.
#[derive(Clone, Default)]
pub enum ExitResult {
    /// The body returned normally
    #[default]
    Success,

    /// The body requested termination with a value
    Value(Value),

    /// The body raised an error or broke the runtime contract
    Error(TaskFailure),
}

impl ExitResult {
    /// Whether this is the default success marker
    pub fn is_success(&self) -> bool {
        matches!(self, ExitResult::Success)
    }

    /// The error, if the task failed
    pub fn error(&self) -> Option<&TaskFailure> {
        match self {
            ExitResult::Error(failure) => Some(failure),
            _ => None,
        }
    }

    /// The exit value, if the task exited with one
    pub fn value(&self) -> Option<&Value> {
        match self {
            ExitResult::Value(value) => Some(value),
            _ => None,
        }
    }
}

impl PartialEq for ExitResult {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ExitResult::Success, ExitResult::Success) => true,
            (ExitResult::Value(a), ExitResult::Value(b)) => a == b,
            (ExitResult::Error(a), ExitResult::Error(b)) => a.same_as(b),
            _ => false,
        }
    }
}

impl fmt::Debug for ExitResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitResult::Success => f.write_str("Success"),
            ExitResult::Value(value) => f.debug_tuple("Value").field(value).finish(),
            ExitResult::Error(failure) => f.debug_tuple("Error").field(failure).finish(),
        }
    }
}

impl fmt::Display for ExitResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitResult::Success => f.write_str(SUCCESS_MARKER),
            ExitResult::Value(value) => write!(f, "{}", value),
            ExitResult::Error(failure) => write!(f, "{}", failure),
        }
    }
}

/// Why a task is suspended, or that it is done.
#[derive(Clone)]
pub enum PauseReason {
    /// Cooperative yield; runnable again on the next scheduling pass
    Yield,

    /// Implementation-specific condition
    Custom(Arc<dyn PauseCondition>),

    /// Terminal marker. A done task keeps waiting forever.
    Done(ExitResult),
}

impl PauseReason {
    /// Wrap a custom condition
    pub fn custom(condition: impl PauseCondition) -> Self {
        PauseReason::Custom(Arc::new(condition))
    }

    /// Whether `task` should keep waiting
    pub fn is_valid(&self, task: &Task) -> bool {
        match self {
            PauseReason::Yield => false,
            PauseReason::Custom(condition) => condition.is_valid(task),
            PauseReason::Done(_) => true,
        }
    }

    /// Whether this is the terminal marker
    pub fn is_done(&self) -> bool {
        matches!(self, PauseReason::Done(_))
    }

    /// Exit result carried by the terminal marker
    pub fn exit_result(&self) -> Option<&ExitResult> {
        match self {
            PauseReason::Done(result) => Some(result),
            _ => None,
        }
    }

    /// Borrow a custom condition as its concrete type
    pub fn downcast_ref<C: PauseCondition>(&self) -> Option<&C> {
        match self {
            PauseReason::Custom(condition) => {
                let condition: &dyn PauseCondition = &**condition;
                let any: &dyn Any = condition;
                any.downcast_ref::<C>()
            }
            _ => None,
        }
    }
}

impl fmt::Debug for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PauseReason::Yield => f.write_str("Yield"),
            PauseReason::Custom(condition) => f.debug_tuple("Custom").field(condition).finish(),
            PauseReason::Done(result) => f.debug_tuple("Done").field(result).finish(),
        }
    }
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PauseReason::Yield => f.write_str("Yield"),
            PauseReason::Custom(condition) => write!(f, "{:?}", condition),
            PauseReason::Done(result) => write!(f, "Done. Exit msg = {}", result),
        }
    }
}

/// A custom condition that holds until released from outside the task.
///
/// Carries a payload the scheduler or the code that created the latch can
/// inspect while the task waits.
#[derive(Debug)]
pub struct Latch<T = ()> {
    payload: T,
    released: AtomicBool,
}

impl<T> Latch<T>
where
    T: fmt::Debug + Send + Sync + 'static,
{
    /// Create a latch that holds until [`Latch::release`] is called
    pub fn new(payload: T) -> Arc<Self> {
        Arc::new(Self {
            payload,
            released: AtomicBool::new(false),
        })
    }

    /// The payload
    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Let the waiting task run again
    pub fn release(&self) {
        self.released.store(true, Ordering::Release);
    }

    /// Whether the latch was released
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Pause reason waiting on this latch
    pub fn reason(self: &Arc<Self>) -> PauseReason {
        PauseReason::Custom(self.clone())
    }
}

impl<T> PauseCondition for Latch<T>
where
    T: fmt::Debug + Send + Sync + 'static,
{
    fn is_valid(&self, _task: &Task) -> bool {
        !self.is_released()
    }
}
