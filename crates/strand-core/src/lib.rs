//! Strand Core
//!
//! Cooperative tasks that suspend at any call depth without holding an OS
//! thread:
//! - **Task**: lifecycle, pause/yield/exit, pinning (`task` module)
//! - **Fiber**: the down/up protocol and the captured-frame chain (`fiber`, `frame`)
//! - **Pause reasons**: why a task waits and when it may run again (`pause`)
//! - **Dynamic calls**: pausable operations chosen at runtime (`invoke`)
//!
//! # Example
//!
//! ```rust,ignore
//! use strand_core::{Task, Up};
//!
//! let mut task = Task::from_fn(|cx| {
//!     let n: u32 = match cx.restore()? {
//!         Some((_, n)) => n,
//!         None => 7,
//!     };
//!     cx.down();
//!     cx.yield_now()?;
//!     match cx.up()? {
//!         Up::Capture => return Ok(cx.capture(1, n)?),
//!         Up::Propagate => return Ok(()),
//!         Up::Normal | Up::Retired => {}
//!     }
//!     println!("resumed with {}", n);
//!     Ok(())
//! });
//!
//! assert_eq!(task.resume(), Ok(false));
//! assert_eq!(task.resume(), Ok(true));
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// ============================================================================
// Modules
// ============================================================================

/// Named constants
pub mod defaults;

/// Error types
pub mod error;

/// Continuation manager
pub mod fiber;

/// Captured frames
pub mod frame;

/// Dynamic invocation path
pub mod invoke;

/// Pause reasons
pub mod pause;

/// Tasks and the body context
pub mod task;

// ============================================================================
// Re-exports
// ============================================================================

pub use error::{ContractViolation, InvokeError, ProtocolError, RuntimeError, TaskFailure};
pub use fiber::{Fiber, Step, Up};
pub use frame::{Frame, Pc, StateChain, PAUSE_POINT_PC};
pub use invoke::{invoke, DynamicCall, Operation, OperationRegistry, Target, DYNAMIC_CALL_PC};
pub use pause::{ExitResult, Latch, PauseCondition, PauseReason};
pub use task::{Cx, Task, TaskBody, TaskId, TaskState};
