//! Persistent task scheduler.
//!
//! Runs the server's maintenance tasks on recurring schedules, with retry and
//! backoff on failure, catch-up after downtime and, in cluster mode, a
//! database lease so each occurrence runs on one node only.

mod admin;
mod context;
mod dispatcher;
mod duration;
mod error;
mod facade;
mod handle;
mod lease;
mod notify;
mod recurrence;
pub mod registry;
mod retry_policy;
mod task;
mod transition;

pub use admin::AdminAdapter;
pub use context::TaskContext;
pub use duration::parse_duration;
pub use error::SchedulerError;
pub use facade::Scheduler;
pub use handle::TaskSnapshot;
pub use lease::{ExecutionLease, LocalLease, StoreLease};
pub use notify::{LogNotificationSink, NotificationSink, TaskFailureNotification};
pub use recurrence::Recurrence;
pub use registry::builtin_tasks;
pub use retry_policy::RetryPolicy;
pub use task::{Handler, TaskError, TaskHandler, TaskSpec};
