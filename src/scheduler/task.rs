use super::context::TaskContext;
use super::error::SchedulerError;
use super::recurrence::Recurrence;
use super::retry_policy::RetryPolicy;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors a task handler can return.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("Execution failed: {0}")]
    Failed(String),

    #[error("Task was cancelled")]
    Cancelled,

    #[error("Task timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    pub fn failed(msg: impl Into<String>) -> Self {
        TaskError::Failed(msg.into())
    }
}

/// The work behind a task.
///
/// Handlers run synchronously on the blocking thread pool, so they may do
/// blocking I/O. Long-running handlers should check `ctx.is_cancelled()`.
pub trait TaskHandler: Send + Sync {
    fn run(&self, ctx: &TaskContext) -> Result<(), TaskError>;
}

impl<F> TaskHandler for F
where
    F: Fn(&TaskContext) -> Result<(), TaskError> + Send + Sync,
{
    fn run(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        self(ctx)
    }
}

/// Handler slot of a registered task. A task without a handler in this
/// deployment is `Inert`: it is listed but never dispatched.
#[derive(Clone)]
pub enum Handler {
    Active(Arc<dyn TaskHandler>),
    Inert,
}

impl Handler {
    pub fn is_active(&self) -> bool {
        matches!(self, Handler::Active(_))
    }
}

impl From<Option<Arc<dyn TaskHandler>>> for Handler {
    fn from(handler: Option<Arc<dyn TaskHandler>>) -> Self {
        match handler {
            Some(h) => Handler::Active(h),
            None => Handler::Inert,
        }
    }
}

/// Static description of a task, as listed in the catalogue.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub id: &'static str,
    pub name: &'static str,
    pub rule: &'static str,
    pub skippable: bool,
    /// Handler timeout; `None` uses the scheduler's default.
    pub timeout: Option<Duration>,
    pub retry: RetryPolicy,
}

/// A registered task with its parsed recurrence and runtime flags.
#[derive(Clone)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub rule: String,
    pub recurrence: Recurrence,
    pub skippable: bool,
    pub enabled: bool,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub handler: Handler,
}

impl Task {
    /// Builds a task, rejecting malformed recurrence rules up front.
    pub fn new(
        spec: &TaskSpec,
        handler: Handler,
        default_timeout: Duration,
    ) -> Result<Self, SchedulerError> {
        let recurrence = Recurrence::parse(spec.rule)?;
        Ok(Self {
            id: spec.id.to_string(),
            name: spec.name.to_string(),
            rule: spec.rule.to_string(),
            recurrence,
            skippable: spec.skippable,
            enabled: true,
            timeout: spec.timeout.unwrap_or(default_timeout),
            retry: spec.retry.clone(),
            handler,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

    fn spec(rule: &'static str) -> TaskSpec {
        TaskSpec {
            id: "log_rotation",
            name: "Log Rotation",
            rule,
            skippable: true,
            timeout: None,
            retry: RetryPolicy::default(),
        }
    }

    #[test]
    fn test_closure_is_a_handler() {
        let handler: Arc<dyn TaskHandler> =
            Arc::new(|_ctx: &TaskContext| -> Result<(), TaskError> {
                Err(TaskError::failed("boom"))
            });
        let ctx = TaskContext::new(
            tokio_util::sync::CancellationToken::new(),
            "log_rotation",
            chrono::Utc::now(),
            chrono::Utc::now(),
        );
        assert_eq!(handler.run(&ctx), Err(TaskError::Failed("boom".to_string())));
    }

    #[test]
    fn test_new_task_rejects_bad_rule() {
        let err = Task::new(&spec("@daily 26:00"), Handler::Inert, DEFAULT_TIMEOUT).err().unwrap();
        assert!(matches!(err, SchedulerError::InvalidRecurrence { .. }));
    }

    #[test]
    fn test_new_task_starts_enabled() {
        let task = Task::new(&spec("@daily"), Handler::Inert, DEFAULT_TIMEOUT).unwrap();
        assert!(task.enabled);
        assert_eq!(task.timeout, DEFAULT_TIMEOUT);
        assert!(!task.handler.is_active());
        assert_eq!(task.rule, "@daily");
    }

    #[test]
    fn test_handler_from_option() {
        let handler: Option<Arc<dyn TaskHandler>> =
            Some(Arc::new(|_ctx: &TaskContext| -> Result<(), TaskError> { Ok(()) }));
        assert!(Handler::from(handler).is_active());
        assert!(!Handler::from(None).is_active());
    }
}
