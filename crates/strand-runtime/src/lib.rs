//! Strand Runtime
//!
//! Reference collaborators that drive `strand-core` tasks:
//! - **Scheduler**: worker threads resuming runnable tasks and parking
//!   suspended ones until their pause reason lapses (`scheduler` module)
//! - **Timer**: releases latches at deadlines and wakes the scheduler (`timer` module)
//! - **Config**: worker count, poll interval, thread names (`config` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use strand_runtime::{RuntimeOptions, Scheduler, TimerService};
//!
//! let mut scheduler = Scheduler::new(RuntimeOptions::from_env());
//! let timer = TimerService::new();
//! timer.start(scheduler.waker());
//! scheduler.start();
//!
//! let id = scheduler.spawn(task)?;
//! scheduler.wait_idle(Duration::from_secs(1));
//! let task = scheduler.take_finished(id);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Runtime configuration
pub mod config;

/// Error types
pub mod error;

/// Task scheduler
pub mod scheduler;

/// Timer service
pub mod timer;

mod worker;

pub use config::RuntimeOptions;
pub use error::{ConfigError, SchedulerError};
pub use scheduler::{Scheduler, SchedulerStats};
pub use timer::{TimerService, Waker};
