use super::context::TaskContext;
use super::error::SchedulerError;
use super::handle::{SchedulerCommand, SharedSchedulerState};
use super::lease::ExecutionLease;
use super::task::{Handler, Task, TaskError, TaskHandler};
use super::transition::{self, Outcome};
use crate::metrics;
use crate::scheduler_store::{PersistedTaskState, RunTrigger, SchedulerStore, TaskStatus};
use chrono::{DateTime, Utc};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lease rows are purged this often in cluster mode.
const LEASE_PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Lease rows whose expiry is older than this are purged.
const LEASE_RETENTION_HOURS: i64 = 24;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub node_id: String,
    pub tick: Duration,
    pub lease_ttl: Duration,
    pub cluster: bool,
    pub shutdown_grace: Duration,
}

/// A spawned execution and the occurrence it claimed.
struct InFlight {
    occurrence: DateTime<Utc>,
    handle: JoinHandle<()>,
}

/// Drives task execution: wakes on a fixed tick, dispatches due tasks and
/// serves manual run requests until the shutdown token fires.
pub struct Dispatcher {
    /// State shared with the facade
    shared: Arc<RwLock<SharedSchedulerState>>,

    store: Arc<dyn SchedulerStore>,

    lease: Arc<dyn ExecutionLease>,

    config: DispatcherConfig,

    /// Execution tasks in flight, managed by the loop only
    running_handles: HashMap<String, InFlight>,

    command_receiver: mpsc::Receiver<SchedulerCommand>,

    /// Parent of every execution's cancellation token.
    shutdown_token: CancellationToken,

    last_purge: Option<Instant>,
}

impl Dispatcher {
    pub fn new(
        shared: Arc<RwLock<SharedSchedulerState>>,
        store: Arc<dyn SchedulerStore>,
        lease: Arc<dyn ExecutionLease>,
        config: DispatcherConfig,
        command_receiver: mpsc::Receiver<SchedulerCommand>,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            shared,
            store,
            lease,
            config,
            running_handles: HashMap::new(),
            command_receiver,
            shutdown_token,
            last_purge: None,
        }
    }

    /// Main dispatcher loop.
    pub async fn run(mut self) {
        let task_count = self.shared.read().await.tasks.len();
        info!(
            "Starting task dispatcher with {} registered tasks (node {}, cluster: {})",
            task_count, self.config.node_id, self.config.cluster
        );

        self.reconcile().await;

        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            self.cleanup_completed_runs().await;

            tokio::select! {
                _ = ticker.tick() => {
                    self.dispatch_due().await;
                }
                Some(cmd) = self.command_receiver.recv() => {
                    self.handle_command(cmd).await;
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Dispatcher received shutdown signal");
                    self.shutdown().await;
                    break;
                }
            }
        }

        info!("Task dispatcher stopped");
    }

    /// Brings persisted rows in line with this process before the first
    /// dispatch pass.
    async fn reconcile(&mut self) {
        let now = Utc::now();

        match self.store.reset_interrupted_tasks(now) {
            Ok(count) if count > 0 => {
                info!("Reset {} tasks interrupted by a previous shutdown", count);
            }
            Ok(_) => {}
            Err(e) => {
                error!("Failed to reset interrupted tasks: {}", e);
            }
        }

        let persisted: HashMap<String, PersistedTaskState> = match self.store.list_task_states() {
            Ok(rows) => rows
                .into_iter()
                .map(|row| (row.task_id.clone(), row))
                .collect(),
            Err(e) => {
                error!("Failed to load task state, using in-memory state: {}", e);
                HashMap::new()
            }
        };

        let mut guard = self.shared.write().await;
        let shared = &mut *guard;
        for (task_id, task) in &shared.tasks {
            let state = match persisted.get(task_id) {
                // Another node holds it
                Some(row) if row.status == TaskStatus::Running => row.clone(),
                Some(row) => {
                    let state = transition::set_enabled(row, task.enabled);
                    if &state != row {
                        if let Err(e) = self.store.save_task_state(&state) {
                            error!("Failed to persist state for {}: {}", task_id, e);
                        }
                    }
                    state
                }
                None => shared
                    .states
                    .get(task_id)
                    .cloned()
                    .unwrap_or_else(|| PersistedTaskState::never_run(task_id, now)),
            };
            shared.states.insert(task_id.clone(), state);
            shared.catch_up_pending.insert(task_id.clone());
        }
    }

    async fn handle_command(&mut self, cmd: SchedulerCommand) {
        match cmd {
            SchedulerCommand::RunNow { task_id, response } => {
                let result = self.launch(&task_id, Utc::now(), RunTrigger::Manual).await;
                if let Err(e) = &result {
                    debug!("Manual run of {} rejected: {}", task_id, e);
                }
                let _ = response.send(result);
            }
        }
    }

    /// Dispatches every enabled task whose `next_run` has passed.
    async fn dispatch_due(&mut self) {
        let now = Utc::now();

        if self.config.cluster {
            self.refresh_from_store().await;
            self.purge_expired_leases(now);
        }

        let mut due = Vec::new();
        {
            let mut guard = self.shared.write().await;
            let shared = &mut *guard;
            let pending = std::mem::take(&mut shared.catch_up_pending);
            let tz = shared.timezone;
            let window = shared.catch_up_window;

            for (task_id, task) in &shared.tasks {
                if !task.enabled || !task.handler.is_active() || shared.running.contains(task_id) {
                    continue;
                }
                let Some(state) = shared.states.get(task_id) else {
                    continue;
                };
                let Some(next_run) = state.next_run.filter(|_| transition::is_due(state, now))
                else {
                    continue;
                };

                if pending.contains(task_id) && !transition::within_catch_up(next_run, now, window)
                {
                    let skipped = transition::skip_stale(task, state, tz, now);
                    info!(
                        "Skipping stale occurrence of {} due at {} (catch-up window {:?}), next run at {:?}",
                        task_id, next_run, window, skipped.next_run
                    );
                    metrics::record_skipped_occurrence(task_id);
                    if let Err(e) = self.store.save_task_state(&skipped) {
                        error!("Failed to persist state for {}: {}", task_id, e);
                    }
                    shared.states.insert(task_id.clone(), skipped);
                    continue;
                }

                due.push((task_id.clone(), next_run));
            }
        }

        for (task_id, occurrence) in due {
            match self.launch(&task_id, occurrence, RunTrigger::Schedule).await {
                Ok(()) => {}
                Err(SchedulerError::LeaseHeld(_)) => {
                    debug!("Lease for {} at {} held elsewhere, skipping", task_id, occurrence);
                }
                Err(e) => {
                    warn!("Could not dispatch {}: {}", task_id, e);
                }
            }
        }
    }

    /// Replaces in-memory state with the database's view for tasks not
    /// running here. Other nodes may have advanced them.
    async fn refresh_from_store(&self) {
        let rows = match self.store.list_task_states() {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Failed to refresh task state, using in-memory state: {}", e);
                return;
            }
        };
        let mut shared = self.shared.write().await;
        for row in rows {
            if shared.tasks.contains_key(&row.task_id) && !shared.running.contains(&row.task_id) {
                shared.states.insert(row.task_id.clone(), row);
            }
        }
    }

    fn purge_expired_leases(&mut self, now: DateTime<Utc>) {
        if !self
            .last_purge
            .map_or(true, |at| at.elapsed() >= LEASE_PURGE_INTERVAL)
        {
            return;
        }
        self.last_purge = Some(Instant::now());

        let before = now - chrono::Duration::hours(LEASE_RETENTION_HOURS);
        match self.store.purge_leases(before) {
            Ok(count) if count > 0 => debug!("Purged {} expired lease rows", count),
            Ok(_) => {}
            Err(e) => warn!("Failed to purge expired leases: {}", e),
        }
    }

    /// Claims `occurrence` of a task and spawns its execution.
    async fn launch(
        &mut self,
        task_id: &str,
        occurrence: DateTime<Utc>,
        trigger: RunTrigger,
    ) -> Result<(), SchedulerError> {
        let now = Utc::now();

        let (task, handler, started) = {
            let mut guard = self.shared.write().await;
            let shared = &mut *guard;

            let task = shared
                .tasks
                .get(task_id)
                .cloned()
                .ok_or_else(|| SchedulerError::NotFound(task_id.to_string()))?;
            let Handler::Active(handler) = task.handler.clone() else {
                return Err(SchedulerError::NoHandler(task_id.to_string()));
            };
            if shared.running.contains(task_id) {
                return Err(SchedulerError::AlreadyRunning(task_id.to_string()));
            }

            match self
                .lease
                .acquire(task_id, occurrence, now, self.config.lease_ttl)
            {
                Ok(true) => {}
                Ok(false) if trigger == RunTrigger::Manual && self.running_elsewhere(task_id) => {
                    return Err(SchedulerError::AlreadyRunning(task_id.to_string()));
                }
                Ok(false) => return Err(SchedulerError::LeaseHeld(task_id.to_string())),
                Err(e) => {
                    error!("Failed to acquire lease for {}: {}", task_id, e);
                    return Err(SchedulerError::Store(e));
                }
            }

            // Another node may have finished this occurrence between our last
            // refresh and the lease grant. Rows are saved before leases are
            // released, so the row read under the lease is current.
            if self.config.cluster {
                if let Ok(Some(row)) = self.store.get_task_state(task_id) {
                    if trigger == RunTrigger::Schedule && !transition::is_due(&row, now) {
                        if let Err(e) = self.lease.release(task_id, occurrence, now, false) {
                            warn!("Failed to release lease for {}: {}", task_id, e);
                        }
                        shared.states.insert(task_id.to_string(), row);
                        return Err(SchedulerError::LeaseHeld(task_id.to_string()));
                    }
                    shared.states.insert(task_id.to_string(), row);
                }
            }

            shared.running.insert(task_id.to_string());
            let previous = shared
                .states
                .get(task_id)
                .cloned()
                .unwrap_or_else(|| PersistedTaskState::never_run(task_id, now));
            let started = transition::begin(&previous, occurrence, trigger);
            shared.states.insert(task_id.to_string(), started.clone());
            (task, handler, started)
        };

        if let Err(e) = self.store.save_task_state(&started) {
            error!("Failed to persist state for {}: {}", task_id, e);
        }

        let run_id = match self.store.record_run_start(
            task_id,
            occurrence,
            &self.config.node_id,
            trigger,
        ) {
            Ok(id) => Some(id),
            Err(e) => {
                error!("Failed to record run start for {}: {}", task_id, e);
                None
            }
        };

        info!(
            "Starting task {} (occurrence: {}, attempt: {}, triggered_by: {})",
            task_id,
            occurrence,
            started.attempt + 1,
            trigger.as_str()
        );
        metrics::set_task_running(task_id, true);

        let execution = Execution {
            shared: Arc::clone(&self.shared),
            store: Arc::clone(&self.store),
            lease: Arc::clone(&self.lease),
            cancel_token: self.shutdown_token.child_token(),
            shutdown_token: self.shutdown_token.clone(),
            lease_ttl: self.config.lease_ttl,
            task,
            handler,
            trigger,
            occurrence,
            started,
            started_at: now,
            run_id,
        };
        let handle = tokio::spawn(execution.run());
        self.running_handles
            .insert(task_id.to_string(), InFlight { occurrence, handle });
        Ok(())
    }

    /// Whether the persisted row says another node is executing the task.
    fn running_elsewhere(&self, task_id: &str) -> bool {
        self.config.cluster
            && matches!(
                self.store.get_task_state(task_id),
                Ok(Some(row)) if row.status == TaskStatus::Running
            )
    }

    async fn cleanup_completed_runs(&mut self) {
        let completed: Vec<String> = self
            .running_handles
            .iter()
            .filter(|(_, handle)| handle.handle.is_finished())
            .map(|(task_id, _)| task_id.clone())
            .collect();

        for task_id in completed {
            if let Some(in_flight) = self.running_handles.remove(&task_id) {
                if let Err(e) = in_flight.handle.await {
                    error!("Execution task for {} ended abnormally: {}", task_id, e);
                    self.recover_aborted(&task_id, in_flight.occurrence).await;
                }
            }
        }
    }

    /// Clears what an execution that died before finishing left behind, so
    /// the task can be dispatched again.
    async fn recover_aborted(&self, task_id: &str, occurrence: DateTime<Utc>) {
        let mut guard = self.shared.write().await;
        let shared = &mut *guard;
        if !shared.running.remove(task_id) {
            return;
        }

        if let Err(e) = self.lease.release(task_id, occurrence, Utc::now(), false) {
            warn!("Failed to release lease for {}: {}", task_id, e);
        }
        let enabled = shared.tasks.get(task_id).is_some_and(|t| t.enabled);
        if let Some(state) = shared.states.get(task_id) {
            let state = transition::set_enabled(state, enabled);
            if let Err(e) = self.store.save_task_state(&state) {
                error!("Failed to persist state for {}: {}", task_id, e);
            }
            shared.states.insert(task_id.to_string(), state);
        }
        metrics::set_task_running(task_id, false);
    }

    /// Waits up to the grace period for cancelled executions to return.
    async fn shutdown(&mut self) {
        info!(
            "Shutting down dispatcher, waiting up to {:?} for {} running tasks",
            self.config.shutdown_grace,
            self.running_handles.len()
        );

        // Execution tokens are children of the shutdown token and are
        // already cancelled at this point.
        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        let running: Vec<(String, InFlight)> = self.running_handles.drain().collect();
        for (task_id, in_flight) in running {
            match tokio::time::timeout_at(deadline, in_flight.handle).await {
                Ok(Ok(())) => debug!("Task {} finished before shutdown", task_id),
                Ok(Err(e)) => {
                    error!("Execution task for {} ended abnormally: {}", task_id, e);
                    self.recover_aborted(&task_id, in_flight.occurrence).await;
                }
                Err(_) => warn!(
                    "Task {} did not finish within the shutdown grace period",
                    task_id
                ),
            }
        }

        info!("Dispatcher shutdown complete");
    }
}

/// One handler invocation, from spawn to persisted completion.
struct Execution {
    shared: Arc<RwLock<SharedSchedulerState>>,
    store: Arc<dyn SchedulerStore>,
    lease: Arc<dyn ExecutionLease>,
    cancel_token: CancellationToken,
    shutdown_token: CancellationToken,
    lease_ttl: Duration,
    task: Task,
    handler: Arc<dyn TaskHandler>,
    trigger: RunTrigger,
    occurrence: DateTime<Utc>,
    /// State written when the run began
    started: PersistedTaskState,
    started_at: DateTime<Utc>,
    run_id: Option<i64>,
}

impl Execution {
    async fn run(self) {
        let task_id = self.task.id.clone();
        let timeout = self.task.timeout;
        let deadline = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|timeout| self.started_at.checked_add_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let ctx = TaskContext::new(
            self.cancel_token.clone(),
            &task_id,
            self.occurrence,
            deadline,
        );

        let lease_lost = Arc::new(AtomicBool::new(false));
        let renewal_done = CancellationToken::new();
        let renewal = self.lease.needs_renewal().then(|| {
            tokio::spawn(renew_until_done(
                Arc::clone(&self.lease),
                task_id.clone(),
                self.occurrence,
                self.started_at,
                self.lease_ttl,
                self.cancel_token.clone(),
                renewal_done.clone(),
                Arc::clone(&lease_lost),
            ))
        });

        let start_time = Instant::now();
        let handler = Arc::clone(&self.handler);
        let mut join = tokio::task::spawn_blocking(move || handler.run(&ctx));
        let waited = tokio::time::timeout(timeout, &mut join).await;
        let (result, timed_out) = match waited {
            Ok(result) => (result, false),
            Err(_) => {
                warn!(
                    "Task {} exceeded its timeout of {:?}, cancelling",
                    task_id, timeout
                );
                self.cancel_token.cancel();
                // The next invocation must not overlap this one.
                (join.await, true)
            }
        };
        let elapsed = start_time.elapsed();

        renewal_done.cancel();
        if let Some(renewal) = renewal {
            let _ = renewal.await;
        }

        let lease_lost = lease_lost.load(Ordering::SeqCst);
        let outcome = match result {
            // Another node may own the occurrence now
            _ if lease_lost => Outcome::Interrupted,
            _ if timed_out => Outcome::Failed(TaskError::Timeout(timeout)),
            Ok(Ok(())) => Outcome::Succeeded,
            Ok(Err(_)) if self.shutdown_token.is_cancelled() => Outcome::Interrupted,
            Ok(Err(e)) => Outcome::Failed(e),
            Err(e) if e.is_panic() => {
                Outcome::Failed(TaskError::Panicked(panic_message(e.into_panic())))
            }
            Err(e) => Outcome::Failed(TaskError::failed(e.to_string())),
        };

        match &outcome {
            Outcome::Succeeded => {
                info!("Task {} completed successfully in {:?}", task_id, elapsed)
            }
            Outcome::Failed(e) => error!("Task {} failed after {:?}: {}", task_id, elapsed, e),
            Outcome::Interrupted => {
                info!("Task {} was interrupted after {:?}", task_id, elapsed)
            }
        }

        self.finish(outcome, elapsed, lease_lost).await;
    }

    /// Applies the outcome, persists it and releases the lease. After a lost
    /// lease the row belongs to whoever claimed the occurrence next, so it is
    /// re-read instead of written.
    async fn finish(self, outcome: Outcome, elapsed: Duration, lease_lost: bool) {
        let task_id = self.task.id.as_str();
        let now = Utc::now();

        let (completion, sink) = {
            let mut shared = self.shared.write().await;

            // The operator may have toggled the task while it ran.
            let mut task = self.task.clone();
            if let Some(current) = shared.tasks.get(task_id) {
                task.enabled = current.enabled;
            }

            let completion = transition::complete(
                &task,
                &self.started,
                self.trigger,
                self.started_at,
                &outcome,
                shared.timezone,
                now,
            );

            let state = if lease_lost {
                match self.store.get_task_state(task_id) {
                    Ok(Some(row)) => row,
                    Ok(None) => completion.state.clone(),
                    Err(e) => {
                        warn!("Failed to re-read state for {}: {}", task_id, e);
                        completion.state.clone()
                    }
                }
            } else {
                if let Err(e) = self.store.save_task_state(&completion.state) {
                    error!("Failed to persist state for {}: {}", task_id, e);
                }
                completion.state.clone()
            };
            let completed = outcome != Outcome::Interrupted;
            if let Err(e) = self
                .lease
                .release(task_id, self.occurrence, now, completed)
            {
                warn!("Failed to release lease for {}: {}", task_id, e);
            }

            shared.states.insert(task_id.to_string(), state);
            shared.running.remove(task_id);
            (completion, Arc::clone(&shared.notify_sink))
        };

        match &completion.state.status {
            TaskStatus::Retrying => info!(
                "Task {} will retry (attempt {}/{}) at {:?}",
                task_id,
                completion.state.attempt + 1,
                self.task.retry.max_attempts,
                completion.state.next_run
            ),
            _ => debug!("Task {} next run at {:?}", task_id, completion.state.next_run),
        }

        if let Some(run_id) = self.run_id {
            let error = match &outcome {
                Outcome::Failed(e) => Some(e.to_string()),
                _ => None,
            };
            if let Err(e) =
                self.store
                    .record_run_finish(run_id, outcome.run_status(), error.as_deref())
            {
                error!("Failed to record run finish for {}: {}", task_id, e);
            }
        }

        metrics::record_task_execution(task_id, outcome.label(), elapsed);
        metrics::set_task_running(task_id, false);

        if let Some(notification) = completion.notification {
            warn!(
                "Task {} exhausted {} attempts, notifying",
                task_id, notification.attempts
            );
            metrics::record_failure_notification(task_id);
            let result = tokio::task::spawn_blocking(move || sink.notify(&notification)).await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Failure notification for {} failed: {}", task_id, e),
                Err(e) => error!("Failure notification for {} panicked: {}", task_id, e),
            }
        }
    }
}

/// Keeps a cluster lease alive while the handler runs. Losing it, or failing
/// to renew it before it lapses, cancels the handler.
#[allow(clippy::too_many_arguments)]
async fn renew_until_done(
    lease: Arc<dyn ExecutionLease>,
    task_id: String,
    occurrence: DateTime<Utc>,
    granted_at: DateTime<Utc>,
    ttl: Duration,
    cancel_token: CancellationToken,
    done: CancellationToken,
    lost: Arc<AtomicBool>,
) {
    let period = (ttl / 3).max(Duration::from_millis(100));
    let margin = chrono::Duration::from_std(period).unwrap_or(chrono::Duration::MAX);
    let mut expires_at = lease_expiry(granted_at, ttl);
    let mut interval = tokio::time::interval(period);
    // First tick fires immediately
    interval.tick().await;

    loop {
        tokio::select! {
            _ = done.cancelled() => break,
            _ = interval.tick() => {
                let now = Utc::now();
                // Whether the next attempt would come after the lease lapses
                let last_chance = now
                    .checked_add_signed(margin)
                    .map_or(true, |next| next >= expires_at);
                match lease.renew(&task_id, occurrence, now, ttl) {
                    Ok(true) => {
                        expires_at = lease_expiry(now, ttl);
                        debug!("Renewed lease for {}", task_id);
                    }
                    Ok(false) => {
                        warn!("Lost lease for {} at {}, cancelling", task_id, occurrence);
                        lost.store(true, Ordering::SeqCst);
                        cancel_token.cancel();
                        break;
                    }
                    Err(e) if last_chance => {
                        warn!(
                            "Failed to renew lease for {} before it expires at {}: {}, cancelling",
                            task_id, expires_at, e
                        );
                        lost.store(true, Ordering::SeqCst);
                        cancel_token.cancel();
                        break;
                    }
                    Err(e) => warn!("Failed to renew lease for {}: {}", task_id, e),
                }
            }
        }
    }
}

fn lease_expiry(from: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| from.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
