use super::error::SchedulerError;
use super::facade::Scheduler;
use super::handle::TaskSnapshot;
use std::sync::Arc;

/// Read-mostly view of the scheduler for the administrative UI.
///
/// It can list tasks and request a manual run, which goes through the same
/// lease and bookkeeping as a scheduled run. It cannot change the registry.
#[derive(Clone)]
pub struct AdminAdapter {
    scheduler: Arc<Scheduler>,
}

impl AdminAdapter {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }

    pub async fn get_tasks(&self) -> Vec<TaskSnapshot> {
        self.scheduler.get_tasks().await
    }

    pub async fn run_now(&self, task_id: &str) -> Result<(), SchedulerError> {
        self.scheduler.run_now(task_id).await
    }
}
