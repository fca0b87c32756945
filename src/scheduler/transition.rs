//! State transitions of a task's persisted row.
//!
//! These are pure functions of the previous state and the outcome; the
//! dispatcher applies and persists the result.

use super::notify::TaskFailureNotification;
use super::task::{Task, TaskError};
use crate::scheduler_store::{PersistedTaskState, RunStatus, RunTrigger, TaskStatus};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::time::Duration;

/// How a handler invocation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Succeeded,
    Failed(TaskError),
    /// Cancelled by scheduler shutdown or lease loss. Not a failure.
    Interrupted,
}

impl Outcome {
    pub fn run_status(&self) -> RunStatus {
        match self {
            Outcome::Succeeded => RunStatus::Succeeded,
            Outcome::Failed(_) => RunStatus::Failed,
            Outcome::Interrupted => RunStatus::Interrupted,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Succeeded => "success",
            Outcome::Failed(TaskError::Panicked(_)) => "panic",
            Outcome::Failed(TaskError::Timeout(_)) => "timeout",
            Outcome::Failed(_) => "failed",
            Outcome::Interrupted => "interrupted",
        }
    }
}

/// Result of applying an outcome.
#[derive(Debug, Clone)]
pub struct Completion {
    pub state: PersistedTaskState,
    /// Set only when the retry budget for the occurrence ran out.
    pub notification: Option<TaskFailureNotification>,
}

pub fn is_due(state: &PersistedTaskState, now: DateTime<Utc>) -> bool {
    state.next_run.is_some_and(|next| next <= now)
}

/// Whether a missed occurrence is recent enough to still run.
pub fn within_catch_up(next_run: DateTime<Utc>, now: DateTime<Utc>, window: Duration) -> bool {
    match (now - next_run).to_std() {
        Ok(late) => late <= window,
        // Not late at all
        Err(_) => true,
    }
}

/// Drops a stale occurrence and moves `next_run` to the first regular
/// occurrence after `now`. Any pending retry of the dropped occurrence is
/// abandoned.
pub fn skip_stale(
    task: &Task,
    state: &PersistedTaskState,
    tz: Tz,
    now: DateTime<Utc>,
) -> PersistedTaskState {
    let anchor = state.occurrence.or(state.next_run).unwrap_or(now);
    PersistedTaskState {
        next_run: task.recurrence.next_after_now(tz, anchor, now),
        status: resting_status(task.enabled, 0),
        attempt: 0,
        occurrence: None,
        ..state.clone()
    }
}

/// State written when an execution starts. A scheduled first attempt pins
/// the occurrence it belongs to; retries keep the pinned one.
pub fn begin(
    state: &PersistedTaskState,
    occurrence: DateTime<Utc>,
    trigger: RunTrigger,
) -> PersistedTaskState {
    let pinned = match trigger {
        RunTrigger::Schedule if state.attempt == 0 || state.occurrence.is_none() => {
            Some(occurrence)
        }
        _ => state.occurrence,
    };
    PersistedTaskState {
        status: TaskStatus::Running,
        occurrence: pinned,
        ..state.clone()
    }
}

/// Applies the outcome of an execution that started from `state`.
pub fn complete(
    task: &Task,
    state: &PersistedTaskState,
    trigger: RunTrigger,
    started_at: DateTime<Utc>,
    outcome: &Outcome,
    tz: Tz,
    now: DateTime<Utc>,
) -> Completion {
    match trigger {
        RunTrigger::Schedule => complete_scheduled(task, state, started_at, outcome, tz, now),
        RunTrigger::Manual => complete_manual(task, state, started_at, outcome),
    }
}

fn complete_scheduled(
    task: &Task,
    state: &PersistedTaskState,
    started_at: DateTime<Utc>,
    outcome: &Outcome,
    tz: Tz,
    now: DateTime<Utc>,
) -> Completion {
    let anchor = state.occurrence.or(state.next_run).unwrap_or(started_at);

    match outcome {
        Outcome::Succeeded => Completion {
            state: PersistedTaskState {
                last_run: Some(started_at),
                // From the pinned occurrence, not the completion time, so a
                // slow run does not shift the cadence.
                next_run: task.recurrence.next_run(tz, Some(anchor), now),
                status: resting_status(task.enabled, 0),
                fail_count: 0,
                attempt: 0,
                occurrence: None,
                last_error: None,
                ..state.clone()
            },
            notification: None,
        },
        Outcome::Failed(err) => {
            let attempt = state.attempt + 1;
            let fail_count = state.fail_count + 1;
            let error = err.to_string();

            if task.retry.should_retry(attempt) {
                let delay = task.retry.delay_with_jitter(attempt);
                // Unrepresentable delays leave the task without a next run.
                let retry_at = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|delay| now.checked_add_signed(delay));
                Completion {
                    state: PersistedTaskState {
                        last_run: Some(started_at),
                        next_run: retry_at,
                        status: resting_status(task.enabled, attempt),
                        fail_count,
                        attempt,
                        occurrence: Some(anchor),
                        last_error: Some(error),
                        ..state.clone()
                    },
                    notification: None,
                }
            } else {
                let notification = TaskFailureNotification {
                    task_id: task.id.clone(),
                    task_name: task.name.clone(),
                    error: error.clone(),
                    attempts: attempt,
                    last_run: Some(started_at),
                    fail_count,
                };
                Completion {
                    state: PersistedTaskState {
                        last_run: Some(started_at),
                        next_run: task.recurrence.next_after_now(tz, anchor, now),
                        status: resting_status(task.enabled, 0),
                        fail_count,
                        attempt: 0,
                        occurrence: None,
                        last_error: Some(error),
                        ..state.clone()
                    },
                    notification: Some(notification),
                }
            }
        }
        // The occurrence stays due so catch-up decides after a restart.
        Outcome::Interrupted => Completion {
            state: PersistedTaskState {
                status: resting_status(task.enabled, state.attempt),
                ..state.clone()
            },
            notification: None,
        },
    }
}

/// Manual runs report health but leave the schedule and any pending retry
/// of a scheduled occurrence untouched.
fn complete_manual(
    task: &Task,
    state: &PersistedTaskState,
    started_at: DateTime<Utc>,
    outcome: &Outcome,
) -> Completion {
    let mut next = PersistedTaskState {
        status: resting_status(task.enabled, state.attempt),
        ..state.clone()
    };
    match outcome {
        Outcome::Succeeded => {
            next.last_run = Some(started_at);
            next.fail_count = 0;
            next.last_error = None;
        }
        Outcome::Failed(err) => {
            next.last_run = Some(started_at);
            next.fail_count = state.fail_count + 1;
            next.last_error = Some(err.to_string());
        }
        Outcome::Interrupted => {}
    }
    Completion {
        state: next,
        notification: None,
    }
}

/// State after the enabled flag changes on a task that is not running.
pub fn set_enabled(state: &PersistedTaskState, enabled: bool) -> PersistedTaskState {
    PersistedTaskState {
        status: resting_status(enabled, state.attempt),
        ..state.clone()
    }
}

fn resting_status(enabled: bool, attempt: u32) -> TaskStatus {
    if !enabled {
        TaskStatus::Disabled
    } else if attempt > 0 {
        TaskStatus::Retrying
    } else {
        TaskStatus::Idle
    }
}
