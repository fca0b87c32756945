use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

/// Context provided to a task handler for one execution.
///
/// The cancellation token fires when the scheduler stops, when the handler
/// overruns its timeout, or when a cluster lease is lost. Handlers doing long
/// work should poll `is_cancelled()` and return `TaskError::Cancelled`.
#[derive(Clone)]
pub struct TaskContext {
    pub cancellation_token: CancellationToken,

    /// Id of the task being executed.
    pub task_id: String,

    /// Scheduled instant this execution belongs to.
    pub occurrence: DateTime<Utc>,

    /// Instant after which the scheduler treats the run as timed out.
    pub deadline: DateTime<Utc>,
}

impl TaskContext {
    pub fn new(
        cancellation_token: CancellationToken,
        task_id: &str,
        occurrence: DateTime<Utc>,
        deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            cancellation_token,
            task_id: task_id.to_string(),
            occurrence,
            deadline,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}
