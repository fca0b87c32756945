use super::error::SchedulerError;
use super::notify::NotificationSink;
use super::task::Task;
use crate::scheduler_store::{PersistedTaskState, TaskStatus};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Read-only view of one task for operators.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub skippable: bool,
    pub schedule: String,
    /// False when no handler is wired for this deployment.
    pub active: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    pub last_error: Option<String>,
    pub fail_count: u32,
    pub running: bool,
}

/// Command sent to the dispatcher loop.
pub enum SchedulerCommand {
    RunNow {
        task_id: String,
        response: oneshot::Sender<Result<(), SchedulerError>>,
    },
}

/// State shared between the facade and the dispatcher loop.
pub struct SharedSchedulerState {
    /// Registered tasks, ordered by id
    pub tasks: BTreeMap<String, Task>,
    /// Last known persisted state per task
    pub states: HashMap<String, PersistedTaskState>,
    /// Task ids with a handler in flight on this node
    pub running: HashSet<String>,
    pub timezone: Tz,
    pub catch_up_window: Duration,
    /// Tasks whose overdue occurrence must go through the catch-up rule on
    /// the next dispatch pass.
    pub catch_up_pending: HashSet<String>,
    pub notify_sink: Arc<dyn NotificationSink>,
}

impl SharedSchedulerState {
    pub fn new(timezone: Tz, catch_up_window: Duration, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            tasks: BTreeMap::new(),
            states: HashMap::new(),
            running: HashSet::new(),
            timezone,
            catch_up_window,
            catch_up_pending: HashSet::new(),
            notify_sink: sink,
        }
    }

    pub fn snapshot(&self, task_id: &str) -> Option<TaskSnapshot> {
        let task = self.tasks.get(task_id)?;
        let state = self.states.get(task_id);
        let running = self.running.contains(task_id);

        let status = match state {
            _ if running => TaskStatus::Running,
            Some(s) => s.status,
            None if !task.enabled => TaskStatus::Disabled,
            None => TaskStatus::Idle,
        };

        Some(TaskSnapshot {
            id: task.id.clone(),
            name: task.name.clone(),
            enabled: task.enabled,
            skippable: task.skippable,
            schedule: task.rule.clone(),
            active: task.handler.is_active(),
            last_run: state.and_then(|s| s.last_run),
            next_run: state.and_then(|s| s.next_run),
            status,
            last_error: state.and_then(|s| s.last_error.clone()),
            fail_count: state.map(|s| s.fail_count).unwrap_or(0),
            running,
        })
    }

    pub fn snapshots(&self) -> Vec<TaskSnapshot> {
        self.tasks
            .keys()
            .filter_map(|id| self.snapshot(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::notify::LogNotificationSink;
    use crate::scheduler::retry_policy::RetryPolicy;
    use crate::scheduler::task::{Handler, TaskSpec};

    fn shared_with(ids: &[&'static str]) -> SharedSchedulerState {
        let mut shared = SharedSchedulerState::new(
            Tz::UTC,
            Duration::from_secs(3600),
            Arc::new(LogNotificationSink),
        );
        for id in ids {
            let spec = TaskSpec {
                id,
                name: "Test Task",
                rule: "@every 5m",
                skippable: true,
                timeout: None,
                retry: RetryPolicy::default(),
            };
            let task = Task::new(&spec, Handler::Inert, Duration::from_secs(60)).unwrap();
            shared.tasks.insert(id.to_string(), task);
        }
        shared
    }

    #[test]
    fn test_snapshots_sorted_by_id() {
        let shared = shared_with(&["tor_health", "backup_daily", "log_rotation"]);
        let ids: Vec<String> = shared.snapshots().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["backup_daily", "log_rotation", "tor_health"]);
    }

    #[test]
    fn test_snapshot_reflects_state_and_running() {
        let mut shared = shared_with(&["backup_daily"]);
        let now = Utc::now();
        let mut state = PersistedTaskState::never_run("backup_daily", now);
        state.status = TaskStatus::Retrying;
        state.fail_count = 2;
        state.last_error = Some("disk full".to_string());
        shared.states.insert("backup_daily".to_string(), state);

        let snap = shared.snapshot("backup_daily").unwrap();
        assert_eq!(snap.status, TaskStatus::Retrying);
        assert_eq!(snap.fail_count, 2);
        assert_eq!(snap.next_run, Some(now));
        assert!(!snap.running);
        assert!(!snap.active);

        shared.running.insert("backup_daily".to_string());
        let snap = shared.snapshot("backup_daily").unwrap();
        assert_eq!(snap.status, TaskStatus::Running);
        assert!(snap.running);

        assert!(shared.snapshot("unknown").is_none());
    }

    #[test]
    fn test_snapshot_serializes_status_as_string() {
        let shared = shared_with(&["log_rotation"]);
        let json = serde_json::to_value(shared.snapshot("log_rotation").unwrap()).unwrap();
        assert_eq!(json["status"], "idle");
        assert_eq!(json["schedule"], "@every 5m");
    }
}
