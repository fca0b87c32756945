//! Task specs, handlers and sinks shared by the end-to-end tests.

use metasearch_scheduler::config::SchedulerSettings;
use metasearch_scheduler::scheduler::{
    NotificationSink, RetryPolicy, TaskContext, TaskError, TaskFailureNotification, TaskHandler,
    TaskSpec,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Settings with a short tick so tests settle in milliseconds.
pub fn fast_settings() -> SchedulerSettings {
    SchedulerSettings {
        tick_interval: Duration::from_millis(50),
        shutdown_grace: Duration::from_secs(5),
        lease_ttl: Duration::from_secs(3),
        ..Default::default()
    }
}

/// Retries quickly: 3 attempts, 50ms then 100ms.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(50), Duration::from_millis(200))
}

/// A skippable task running once an hour, with fast retries.
pub fn hourly_spec(id: &'static str) -> TaskSpec {
    TaskSpec {
        id,
        name: "Test Task",
        rule: "@every 1h",
        skippable: true,
        timeout: Some(Duration::from_secs(10)),
        retry: fast_retry(),
    }
}

/// Succeeds and counts invocations.
pub fn counting_handler() -> (Arc<dyn TaskHandler>, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    let handler = Arc::new(move |_ctx: &TaskContext| -> Result<(), TaskError> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    (handler, count)
}

/// Always fails and counts invocations.
pub fn failing_handler(message: &'static str) -> (Arc<dyn TaskHandler>, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    let handler = Arc::new(move |_ctx: &TaskContext| -> Result<(), TaskError> {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(TaskError::failed(message))
    });
    (handler, count)
}

/// Runs until released or cancelled. Cancellation returns `Cancelled`.
pub struct BlockingHandler {
    pub started: AtomicUsize,
    pub release: AtomicBool,
    pub exited: AtomicBool,
}

impl BlockingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started: AtomicUsize::new(0),
            release: AtomicBool::new(false),
            exited: AtomicBool::new(false),
        })
    }

    pub fn release(&self) {
        self.release.store(true, Ordering::SeqCst);
    }
}

impl TaskHandler for BlockingHandler {
    fn run(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let result = loop {
            if ctx.is_cancelled() {
                break Err(TaskError::Cancelled);
            }
            if self.release.swap(false, Ordering::SeqCst) {
                break Ok(());
            }
            std::thread::sleep(Duration::from_millis(10));
        };
        self.exited.store(true, Ordering::SeqCst);
        result
    }
}

/// Collects failure notifications.
#[derive(Default)]
pub struct RecordingSink {
    pub notifications: Mutex<Vec<TaskFailureNotification>>,
}

impl RecordingSink {
    pub fn count(&self) -> usize {
        self.notifications.lock().unwrap().len()
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, notification: &TaskFailureNotification) -> anyhow::Result<()> {
        self.notifications.lock().unwrap().push(notification.clone());
        Ok(())
    }
}
