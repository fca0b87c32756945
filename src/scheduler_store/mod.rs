mod models;
mod schema;
mod sqlite_scheduler_store;

pub use models::*;
pub use schema::SCHEDULER_VERSIONED_SCHEMAS;
pub use sqlite_scheduler_store::SqliteSchedulerStore;

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Durable storage for the scheduler. Shared by every node of a cluster when
/// they point at the same database.
pub trait SchedulerStore: Send + Sync {
    // Task state
    fn get_task_state(&self, task_id: &str) -> Result<Option<PersistedTaskState>>;
    fn list_task_states(&self) -> Result<Vec<PersistedTaskState>>;
    fn save_task_state(&self, state: &PersistedTaskState) -> Result<()>;
    /// Resets rows left in `running` by a dead process. Rows whose task still
    /// holds a live lease are left alone. Returns the number of rows reset.
    fn reset_interrupted_tasks(&self, now: DateTime<Utc>) -> Result<usize>;

    // Execution leases
    /// Conditionally claims `(task_id, occurrence)`. Granted only when no
    /// other live lease exists for the task and the occurrence was never
    /// completed.
    fn try_acquire_lease(
        &self,
        task_id: &str,
        occurrence: DateTime<Utc>,
        node_id: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool>;
    /// Extends a lease held by `node_id`. Returns false if the lease was lost.
    fn renew_lease(
        &self,
        task_id: &str,
        occurrence: DateTime<Utc>,
        node_id: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool>;
    /// Ends a lease held by `node_id`. A completed occurrence can never be
    /// claimed again; an abandoned one becomes claimable immediately.
    fn release_lease(
        &self,
        task_id: &str,
        occurrence: DateTime<Utc>,
        node_id: &str,
        now: DateTime<Utc>,
        completed: bool,
    ) -> Result<()>;
    /// Deletes lease rows that expired before `before`.
    fn purge_leases(&self, before: DateTime<Utc>) -> Result<usize>;

    // Execution history
    fn record_run_start(
        &self,
        task_id: &str,
        occurrence: DateTime<Utc>,
        node_id: &str,
        trigger: RunTrigger,
    ) -> Result<i64>;
    fn record_run_finish(&self, run_id: i64, status: RunStatus, error: Option<&str>)
        -> Result<()>;
    fn get_run_history(&self, task_id: &str, limit: usize) -> Result<Vec<TaskRun>>;

    /// Cheap round-trip used by health checks.
    fn ping(&self) -> Result<()>;
}
