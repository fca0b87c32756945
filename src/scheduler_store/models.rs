use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for its next occurrence.
    Idle,
    /// A handler invocation is in flight.
    Running,
    /// The last attempt failed and a backoff retry is scheduled.
    Retrying,
    /// Disabled by the operator or configuration; never dispatched.
    Disabled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Idle => "idle",
            TaskStatus::Running => "running",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(TaskStatus::Idle),
            "running" => Some(TaskStatus::Running),
            "retrying" => Some(TaskStatus::Retrying),
            "disabled" => Some(TaskStatus::Disabled),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable per-task scheduling state, one row per task id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedTaskState {
    pub task_id: String,
    pub last_run: Option<DateTime<Utc>>,
    /// Earliest instant at which the task is eligible to run.
    /// `None` means the recurrence has no further occurrences.
    pub next_run: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    /// Consecutive failures since the last success.
    pub fail_count: u32,
    /// Attempts already made for `occurrence`.
    pub attempt: u32,
    /// Scheduled instant currently being retried, if any.
    pub occurrence: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl PersistedTaskState {
    /// State of a task that has never run: due immediately.
    pub fn never_run(task_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            task_id: task_id.to_string(),
            last_run: None,
            next_run: Some(now),
            status: TaskStatus::Idle,
            fail_count: 0,
            attempt: 0,
            occurrence: None,
            last_error: None,
        }
    }
}

/// What caused an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Schedule,
    Manual,
}

impl RunTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunTrigger::Schedule => "schedule",
            RunTrigger::Manual => "manual",
        }
    }
}

/// Outcome of a single recorded execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Interrupted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Interrupted => "interrupted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "succeeded" => Some(RunStatus::Succeeded),
            "failed" => Some(RunStatus::Failed),
            "interrupted" => Some(RunStatus::Interrupted),
            _ => None,
        }
    }
}

/// One entry of the execution history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: i64,
    pub task_id: String,
    pub occurrence: DateTime<Utc>,
    pub node_id: String,
    pub triggered_by: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_round_trips_through_str() {
        for status in [
            TaskStatus::Idle,
            TaskStatus::Running,
            TaskStatus::Retrying,
            TaskStatus::Disabled,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("paused"), None);
    }

    #[test]
    fn test_never_run_is_due_now() {
        let now = Utc::now();
        let state = PersistedTaskState::never_run("session_cleanup", now);
        assert_eq!(state.next_run, Some(now));
        assert_eq!(state.status, TaskStatus::Idle);
        assert!(state.last_run.is_none());
        assert_eq!(state.fail_count, 0);
    }

    #[test]
    fn test_run_status_parse() {
        assert_eq!(RunStatus::parse("failed"), Some(RunStatus::Failed));
        assert_eq!(RunStatus::parse("interrupted"), Some(RunStatus::Interrupted));
        assert_eq!(RunStatus::parse("nope"), None);
    }
}
