use thiserror::Error;

/// Errors returned by the scheduler's public API.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Task {0} is already running")]
    AlreadyRunning(String),

    #[error("Task {0} is not skippable and cannot be enabled or disabled")]
    NotSkippable(String),

    #[error("Task {0} has no handler in this deployment")]
    NoHandler(String),

    #[error("Invalid recurrence rule '{rule}': {reason}")]
    InvalidRecurrence { rule: String, reason: String },

    #[error("Task {0} is already registered")]
    DuplicateTask(String),

    #[error("Scheduler is already started")]
    AlreadyStarted,

    #[error("Scheduler is not running")]
    Unavailable,

    #[error("Lease for task {0} is held by another node")]
    LeaseHeld(String),

    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl SchedulerError {
    pub(crate) fn invalid_rule(rule: &str, reason: impl Into<String>) -> Self {
        SchedulerError::InvalidRecurrence {
            rule: rule.to_string(),
            reason: reason.into(),
        }
    }
}
