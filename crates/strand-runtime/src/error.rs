//! Error types for the runtime collaborators

use strand_core::TaskId;

/// Scheduler failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// The scheduler was shut down; no task can be spawned
    #[error("Scheduler is shut down; task {0} was not spawned")]
    ShutDown(TaskId),

    /// A task that already ran was handed to the scheduler
    #[error("Task {0} was already started")]
    AlreadyStarted(TaskId),
}

/// Invalid runtime configuration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable holds a value that does not parse
    #[error("Invalid value '{value}' for {var}: {reason}")]
    InvalidValue {
        /// Variable name
        var: &'static str,
        /// Raw value
        value: String,
        /// Parser message
        reason: String,
    },
}
