use super::dispatcher::{Dispatcher, DispatcherConfig};
use super::error::SchedulerError;
use super::handle::{SchedulerCommand, SharedSchedulerState, TaskSnapshot};
use super::lease::{ExecutionLease, LocalLease, StoreLease};
use super::notify::{LogNotificationSink, NotificationSink};
use super::registry::builtin_tasks;
use super::task::{Handler, Task, TaskHandler, TaskSpec};
use super::transition;
use crate::config::SchedulerSettings;
use crate::scheduler_store::{PersistedTaskState, SchedulerStore, TaskRun};
use chrono::Utc;
use chrono_tz::Tz;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

enum Lifecycle {
    Idle {
        command_receiver: mpsc::Receiver<SchedulerCommand>,
    },
    Running {
        handle: JoinHandle<()>,
    },
    Stopped,
}

/// Entry point of the scheduler: owns the task registry, the state store and
/// the dispatcher loop.
pub struct Scheduler {
    shared: Arc<RwLock<SharedSchedulerState>>,
    store: Arc<dyn SchedulerStore>,
    lease: Arc<dyn ExecutionLease>,
    settings: SchedulerSettings,
    node_id: String,
    command_tx: mpsc::Sender<SchedulerCommand>,
    shutdown_token: CancellationToken,
    lifecycle: Mutex<Lifecycle>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn SchedulerStore>, node_id: &str, settings: SchedulerSettings) -> Self {
        let timezone = settings.timezone.parse::<Tz>().unwrap_or_else(|e| {
            warn!(
                "Invalid timezone '{}': {}. Using UTC",
                settings.timezone, e
            );
            Tz::UTC
        });

        let lease: Arc<dyn ExecutionLease> = if settings.cluster {
            Arc::new(StoreLease::new(Arc::clone(&store), node_id))
        } else {
            Arc::new(LocalLease::new())
        };

        let (command_tx, command_receiver) = mpsc::channel(100);
        let shared = SharedSchedulerState::new(
            timezone,
            settings.catch_up_window,
            Arc::new(LogNotificationSink),
        );

        Self {
            shared: Arc::new(RwLock::new(shared)),
            store,
            lease,
            settings,
            node_id: node_id.to_string(),
            command_tx,
            shutdown_token: CancellationToken::new(),
            lifecycle: Mutex::new(Lifecycle::Idle { command_receiver }),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn is_started(&self) -> bool {
        !matches!(*self.lifecycle.lock().unwrap(), Lifecycle::Idle { .. })
    }

    fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock().unwrap(), Lifecycle::Running { .. })
    }

    /// Registers a task. Must be called before `start()`.
    pub async fn register(&self, spec: &TaskSpec, handler: Handler) -> Result<(), SchedulerError> {
        if self.is_started() {
            return Err(SchedulerError::AlreadyStarted);
        }

        let mut task = Task::new(spec, handler, self.settings.handler_timeout)?;
        if self.settings.retry_jitter_ratio > 0.0 {
            task.retry = task.retry.with_jitter(self.settings.retry_jitter_ratio);
        }

        let mut shared = self.shared.write().await;
        if shared.tasks.contains_key(spec.id) {
            return Err(SchedulerError::DuplicateTask(spec.id.to_string()));
        }

        let state = match self.store.get_task_state(spec.id) {
            Ok(Some(state)) => state,
            Ok(None) => PersistedTaskState::never_run(spec.id, Utc::now()),
            Err(e) => {
                error!("Failed to load state for {}: {}", spec.id, e);
                PersistedTaskState::never_run(spec.id, Utc::now())
            }
        };

        info!(
            "Registering task: {} - {} ({}{})",
            spec.id,
            spec.name,
            spec.rule,
            if task.handler.is_active() { "" } else { ", inert" }
        );
        shared.states.insert(spec.id.to_string(), state);
        shared.tasks.insert(spec.id.to_string(), task);
        Ok(())
    }

    /// Registers the whole catalogue. Tasks missing from `handlers` are
    /// listed but never dispatched.
    pub async fn register_builtin_tasks(
        &self,
        mut handlers: HashMap<String, Arc<dyn TaskHandler>>,
    ) -> Result<(), SchedulerError> {
        for spec in builtin_tasks() {
            let handler = Handler::from(handlers.remove(spec.id));
            self.register(&spec, handler).await?;
        }
        for id in handlers.keys() {
            warn!("Ignoring handler for unknown task {}", id);
        }
        Ok(())
    }

    /// Applies per-task enabled flags from configuration. Flags for tasks
    /// that are unknown or not skippable are ignored with a warning.
    pub async fn apply_task_flags(&self, flags: &HashMap<String, bool>) {
        for (task_id, enabled) in flags {
            match self.set_enabled(task_id, *enabled).await {
                Ok(()) => {}
                Err(SchedulerError::NotSkippable(_)) => {
                    warn!("Task {} is not skippable, ignoring enabled flag", task_id);
                }
                Err(e) => warn!("Ignoring enabled flag for {}: {}", task_id, e),
            }
        }
    }

    pub async fn enable(&self, task_id: &str) -> Result<(), SchedulerError> {
        self.set_enabled(task_id, true).await
    }

    pub async fn disable(&self, task_id: &str) -> Result<(), SchedulerError> {
        self.set_enabled(task_id, false).await
    }

    async fn set_enabled(&self, task_id: &str, enabled: bool) -> Result<(), SchedulerError> {
        let mut guard = self.shared.write().await;
        let shared = &mut *guard;

        let task = shared
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| SchedulerError::NotFound(task_id.to_string()))?;
        if !task.skippable {
            return Err(SchedulerError::NotSkippable(task_id.to_string()));
        }
        if task.enabled == enabled {
            return Ok(());
        }
        task.enabled = enabled;
        info!(
            "Task {} {}",
            task_id,
            if enabled { "enabled" } else { "disabled" }
        );

        if enabled {
            // Whatever it missed while disabled goes through catch-up.
            shared.catch_up_pending.insert(task_id.to_string());
        }

        // A running task persists its final status on completion.
        if shared.running.contains(task_id) {
            return Ok(());
        }
        if let Some(state) = shared.states.get(task_id) {
            let updated = transition::set_enabled(state, enabled);
            if let Err(e) = self.store.save_task_state(&updated) {
                error!("Failed to persist state for {}: {}", task_id, e);
            }
            shared.states.insert(task_id.to_string(), updated);
        }
        Ok(())
    }

    /// Changes the timezone calendar rules are evaluated in. An invalid
    /// identifier keeps the previous timezone.
    pub async fn set_timezone(&self, timezone: &str) {
        match timezone.parse::<Tz>() {
            Ok(tz) => {
                let mut shared = self.shared.write().await;
                if shared.timezone != tz {
                    info!("Scheduler timezone set to {}", tz);
                }
                shared.timezone = tz;
            }
            Err(e) => {
                let previous = self.shared.read().await.timezone;
                warn!(
                    "Invalid timezone '{}': {}. Keeping {}",
                    timezone, e, previous
                );
            }
        }
    }

    pub async fn timezone(&self) -> Tz {
        self.shared.read().await.timezone
    }

    pub async fn set_catch_up_window(&self, window: Duration) {
        self.shared.write().await.catch_up_window = window;
    }

    pub async fn catch_up_window(&self) -> Duration {
        self.shared.read().await.catch_up_window
    }

    pub async fn set_notify_sink(&self, sink: Arc<dyn NotificationSink>) {
        self.shared.write().await.notify_sink = sink;
    }

    /// Runs a task immediately, outside its schedule. Returns once the run
    /// has started.
    pub async fn run_now(&self, task_id: &str) -> Result<(), SchedulerError> {
        if !self.is_running() {
            return Err(SchedulerError::Unavailable);
        }

        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(SchedulerCommand::RunNow {
                task_id: task_id.to_string(),
                response: response_tx,
            })
            .await
            .map_err(|_| SchedulerError::Unavailable)?;

        response_rx.await.map_err(|_| SchedulerError::Unavailable)?
    }

    /// Status of every registered task, ordered by id.
    pub async fn get_tasks(&self) -> Vec<TaskSnapshot> {
        self.shared.read().await.snapshots()
    }

    pub async fn get_task(&self, task_id: &str) -> Option<TaskSnapshot> {
        self.shared.read().await.snapshot(task_id)
    }

    /// Most recent executions of a task, newest first.
    pub async fn task_history(
        &self,
        task_id: &str,
        limit: usize,
    ) -> Result<Vec<TaskRun>, SchedulerError> {
        if !self.shared.read().await.tasks.contains_key(task_id) {
            return Err(SchedulerError::NotFound(task_id.to_string()));
        }
        Ok(self.store.get_run_history(task_id, limit)?)
    }

    /// Spawns the dispatcher loop. Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut lifecycle = self.lifecycle.lock().unwrap();
        let command_receiver = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Idle { command_receiver } => command_receiver,
            other => {
                *lifecycle = other;
                return Err(SchedulerError::AlreadyStarted);
            }
        };

        let dispatcher = Dispatcher::new(
            Arc::clone(&self.shared),
            Arc::clone(&self.store),
            Arc::clone(&self.lease),
            DispatcherConfig {
                node_id: self.node_id.clone(),
                tick: self.settings.tick_interval,
                lease_ttl: self.settings.lease_ttl,
                cluster: self.settings.cluster,
                shutdown_grace: self.settings.shutdown_grace,
            },
            command_receiver,
            self.shutdown_token.clone(),
        );
        let handle = tokio::spawn(dispatcher.run());
        *lifecycle = Lifecycle::Running { handle };
        info!("Scheduler started");
        Ok(())
    }

    /// Cancels running handlers and waits, up to the shutdown grace period,
    /// for them to return.
    pub async fn stop(&self) {
        self.shutdown_token.cancel();

        let previous = std::mem::replace(&mut *self.lifecycle.lock().unwrap(), Lifecycle::Stopped);
        if let Lifecycle::Running { handle } = previous {
            if let Err(e) = handle.await {
                error!("Dispatcher task ended abnormally: {}", e);
            }
            info!("Scheduler stopped");
        }
    }
}
