//! Scheduler lifecycle management for tests.

use metasearch_scheduler::config::SchedulerSettings;
use metasearch_scheduler::scheduler::{Handler, TaskHandler, TaskSnapshot, TaskSpec};
use metasearch_scheduler::{Scheduler, SchedulerStore, SqliteSchedulerStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// How long `wait_for_task` polls before giving up.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// A scheduler over a fresh SQLite database.
pub struct TestScheduler {
    pub scheduler: Arc<Scheduler>,
    pub store: Arc<dyn SchedulerStore>,
    pub db_path: PathBuf,

    // Keeps the database alive until drop
    _temp_dir: Option<TempDir>,
}

impl TestScheduler {
    pub fn new(settings: SchedulerSettings) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("scheduler.db");
        let mut harness = Self::open(&db_path, "node-test", settings);
        harness._temp_dir = Some(temp_dir);
        harness
    }

    /// Opens another scheduler on an existing database file.
    pub fn open(db_path: &Path, node_id: &str, settings: SchedulerSettings) -> Self {
        let store: Arc<dyn SchedulerStore> = Arc::new(SqliteSchedulerStore::new(db_path).unwrap());
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&store), node_id, settings));
        Self {
            scheduler,
            store,
            db_path: db_path.to_path_buf(),
            _temp_dir: None,
        }
    }

    pub async fn register(&self, spec: &TaskSpec, handler: Arc<dyn TaskHandler>) {
        self.scheduler
            .register(spec, Handler::Active(handler))
            .await
            .unwrap();
    }

    pub async fn task(&self, task_id: &str) -> TaskSnapshot {
        self.scheduler.get_task(task_id).await.unwrap()
    }

    /// Polls until `predicate` holds for the task's snapshot.
    pub async fn wait_for_task<F>(&self, task_id: &str, predicate: F) -> TaskSnapshot
    where
        F: Fn(&TaskSnapshot) -> bool,
    {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            let snapshot = self.task(task_id).await;
            if predicate(&snapshot) {
                return snapshot;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting on {}: {:?}",
                task_id,
                snapshot
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

/// Polls until `condition` holds.
pub async fn wait_until<F>(description: &str, condition: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            description
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
