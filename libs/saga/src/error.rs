//! Saga Error Types
//!
//! Error taxonomy for the effect interpreter: malformed patterns, bus
//! delivery failures, task failures, cancellation races and external
//! call failures, plus the configuration and resource errors raised by
//! the scheduler itself.

use crate::task::TaskId;
use thiserror::Error;

/// Main saga error type
///
/// Cloneable so a single failure can be delivered to every Join waiter,
/// the task handle and a parent task at once.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SagaError {
    /// Malformed pattern detected at Take registration
    #[error("Pattern error: {message}")]
    Pattern { message: String },

    /// Bus adapter failed to accept or deliver an action
    #[error("Dispatch error: {message}")]
    Dispatch { message: String },

    /// A saga procedure raised an unrecovered failure
    #[error("Task {task} failed: {message}")]
    TaskFailure { task: TaskId, message: String },

    /// A joined task ended Cancelled
    #[error("Task {task} was cancelled")]
    Cancelled { task: TaskId },

    /// Resume or settle attempted on a task that already reached a terminal state
    #[error("Cancellation race on {task}: {operation}")]
    CancellationRace { task: TaskId, operation: String },

    /// External unit of work invoked by a Call effect failed
    #[error("External call '{name}' failed: {message}")]
    ExternalCall { name: String, message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Resource exhaustion errors
    #[error("Resource exhausted: {resource}: {message}")]
    ResourceExhausted { resource: String, message: String },

    /// Referenced task is not known to the scheduler
    #[error("Unknown task: {task}")]
    UnknownTask { task: TaskId },

    /// Async runtime unavailable or shut down
    #[error("Runtime error: {message}")]
    Runtime { message: String },
}

/// Result type alias for saga operations
pub type Result<T> = std::result::Result<T, SagaError>;

impl SagaError {
    /// Create a pattern error
    pub fn pattern(message: impl Into<String>) -> Self {
        Self::Pattern {
            message: message.into(),
        }
    }

    /// Create a dispatch error
    pub fn dispatch(message: impl Into<String>) -> Self {
        Self::Dispatch {
            message: message.into(),
        }
    }

    /// Create a task failure raised by the given task
    pub fn task_failure(task: TaskId, message: impl Into<String>) -> Self {
        Self::TaskFailure {
            task,
            message: message.into(),
        }
    }

    /// Create a failure from inside a procedure that does not know its task id
    ///
    /// The scheduler stamps the raising task onto unattributed failures.
    pub fn procedure(message: impl Into<String>) -> Self {
        Self::TaskFailure {
            task: TaskId::UNASSIGNED,
            message: message.into(),
        }
    }

    /// Create a cancellation error for a joined task
    pub fn cancelled(task: TaskId) -> Self {
        Self::Cancelled { task }
    }

    /// Create a cancellation race error
    pub fn cancellation_race(task: TaskId, operation: impl Into<String>) -> Self {
        Self::CancellationRace {
            task,
            operation: operation.into(),
        }
    }

    /// Create an external call error
    pub fn external_call(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExternalCall {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    /// Create a resource exhausted error
    pub fn resource_exhausted(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Create an unknown task error
    pub fn unknown_task(task: TaskId) -> Self {
        Self::UnknownTask { task }
    }

    /// Create a runtime error
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }

    /// Check if a saga procedure is expected to recover from this error
    ///
    /// Only external work can fail in a way the procedure should intercept;
    /// failures propagated from children are raised at the parent's
    /// suspension point and may be intercepted too.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SagaError::ExternalCall { .. }
                | SagaError::TaskFailure { .. }
                | SagaError::Cancelled { .. }
        )
    }

    /// Check if the error indicates a structural bug in the saga
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            SagaError::Pattern { .. } | SagaError::Dispatch { .. } | SagaError::ResourceExhausted { .. }
        )
    }

    /// Stamp the raising task onto a failure created without one
    pub(crate) fn attributed_to(self, task: TaskId) -> Self {
        match self {
            SagaError::TaskFailure { task: t, message } if t == TaskId::UNASSIGNED => {
                SagaError::TaskFailure { task, message }
            }
            other => other,
        }
    }

    /// Get error category for metrics and logging
    pub fn category(&self) -> &'static str {
        match self {
            SagaError::Pattern { .. } => "pattern",
            SagaError::Dispatch { .. } => "dispatch",
            SagaError::TaskFailure { .. } => "task_failure",
            SagaError::Cancelled { .. } => "cancelled",
            SagaError::CancellationRace { .. } => "cancellation_race",
            SagaError::ExternalCall { .. } => "external_call",
            SagaError::Configuration { .. } => "configuration",
            SagaError::ResourceExhausted { .. } => "resource",
            SagaError::UnknownTask { .. } => "unknown_task",
            SagaError::Runtime { .. } => "runtime",
        }
    }
}
