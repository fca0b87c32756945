use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;

/// Raised once when a task exhausts its retry budget for an occurrence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskFailureNotification {
    pub task_id: String,
    pub task_name: String,
    pub error: String,
    pub attempts: u32,
    pub last_run: Option<DateTime<Utc>>,
    pub fail_count: u32,
}

/// Receiver of failure notifications, e.g. an operator mailer.
///
/// Called from a blocking thread on the scheduler's completion path. Errors
/// are logged and dropped.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: &TaskFailureNotification) -> anyhow::Result<()>;
}

impl<F> NotificationSink for F
where
    F: Fn(&TaskFailureNotification) -> anyhow::Result<()> + Send + Sync,
{
    fn notify(&self, notification: &TaskFailureNotification) -> anyhow::Result<()> {
        self(notification)
    }
}

/// Default sink: writes the failure to the log.
pub struct LogNotificationSink;

impl NotificationSink for LogNotificationSink {
    fn notify(&self, n: &TaskFailureNotification) -> anyhow::Result<()> {
        error!(
            "Task {} ({}) failed {} times in a row, giving up on this occurrence: {}",
            n.task_id, n.task_name, n.attempts, n.error
        );
        Ok(())
    }
}
