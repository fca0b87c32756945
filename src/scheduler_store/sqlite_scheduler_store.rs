use super::models::{PersistedTaskState, RunStatus, RunTrigger, TaskRun, TaskStatus};
use super::schema::SCHEDULER_VERSIONED_SCHEMAS;
use super::SchedulerStore;
use crate::sqlite_persistence::BASE_DB_VERSION;
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// How long a connection waits on a lock held by another process.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteSchedulerStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSchedulerStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();

        let mut conn = Connection::open(path).context("Failed to open scheduler database")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // WAL lets several server processes share the file. The mode is kept
        // in the file, so losing a race with another node switching it is
        // harmless.
        if let Err(e) =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
        {
            warn!("Could not switch scheduler database to WAL: {}", e);
        }

        // Several nodes may open a fresh shared file at once. The write lock
        // taken up front makes exactly one of them create the schema.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        Self::prepare_schema(&tx, path)?;
        tx.commit()?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates, validates or migrates the schema. Runs inside the opening
    /// transaction.
    fn prepare_schema(conn: &Connection, path: &Path) -> Result<()> {
        let latest = SCHEDULER_VERSIONED_SCHEMAS
            .last()
            .context("No scheduler schema defined")?;

        let raw_version: i64 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
        if raw_version == 0 {
            info!("Creating new scheduler database at {:?}", path);
            return latest.create(conn);
        }

        let db_version = raw_version - BASE_DB_VERSION as i64;
        if db_version < 1 {
            anyhow::bail!(
                "Scheduler database version {} is invalid (expected >= 1)",
                db_version
            );
        }

        let version_index = SCHEDULER_VERSIONED_SCHEMAS
            .iter()
            .position(|s| s.version == db_version as usize)
            .with_context(|| format!("Unknown scheduler database version {}", db_version))?;
        SCHEDULER_VERSIONED_SCHEMAS[version_index]
            .validate(conn)
            .with_context(|| {
                format!(
                    "Scheduler database schema validation failed for version {}",
                    db_version
                )
            })?;

        if (db_version as usize) < latest.version {
            info!(
                "Migrating scheduler database from version {} to {}",
                db_version, latest.version
            );
            Self::migrate(conn, db_version as usize)?;
        }
        Ok(())
    }

    fn migrate(conn: &Connection, from_version: usize) -> Result<()> {
        let mut current = from_version;
        for schema in SCHEDULER_VERSIONED_SCHEMAS
            .iter()
            .filter(|s| s.version > from_version)
        {
            info!(
                "Running scheduler database migration from version {} to {}",
                current, schema.version
            );
            if let Some(migration_fn) = schema.migration {
                migration_fn(conn).with_context(|| {
                    format!("Failed to run migration to version {}", schema.version)
                })?;
            }
            current = schema.version;
        }
        conn.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + current),
            [],
        )?;
        Ok(())
    }

    /// Fixed-width UTC timestamps so that SQL string comparison orders them.
    fn format_datetime(dt: &DateTime<Utc>) -> String {
        dt.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    }

    fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
        chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or_else(|| now + chrono::Duration::minutes(1))
    }

    fn row_to_task_state(row: &rusqlite::Row) -> rusqlite::Result<PersistedTaskState> {
        let status_str: String = row.get("status")?;
        let last_run: Option<String> = row.get("last_run")?;
        let next_run: Option<String> = row.get("next_run")?;
        let occurrence: Option<String> = row.get("occurrence")?;

        Ok(PersistedTaskState {
            task_id: row.get("task_id")?,
            last_run: last_run.as_deref().and_then(Self::parse_datetime),
            next_run: next_run.as_deref().and_then(Self::parse_datetime),
            status: TaskStatus::parse(&status_str).unwrap_or(TaskStatus::Idle),
            fail_count: row.get("fail_count")?,
            attempt: row.get("attempt")?,
            occurrence: occurrence.as_deref().and_then(Self::parse_datetime),
            last_error: row.get("last_error")?,
        })
    }

    fn row_to_task_run(row: &rusqlite::Row) -> rusqlite::Result<TaskRun> {
        let status_str: String = row.get("status")?;
        let occurrence: String = row.get("occurrence")?;
        let started_at: String = row.get("started_at")?;
        let finished_at: Option<String> = row.get("finished_at")?;

        Ok(TaskRun {
            id: row.get("id")?,
            task_id: row.get("task_id")?,
            occurrence: Self::parse_datetime(&occurrence).unwrap_or_else(Utc::now),
            node_id: row.get("node_id")?,
            triggered_by: row.get("triggered_by")?,
            started_at: Self::parse_datetime(&started_at).unwrap_or_else(Utc::now),
            finished_at: finished_at.as_deref().and_then(Self::parse_datetime),
            status: RunStatus::parse(&status_str).unwrap_or(RunStatus::Failed),
            error: row.get("error")?,
        })
    }
}

impl SchedulerStore for SqliteSchedulerStore {
    fn get_task_state(&self, task_id: &str) -> Result<Option<PersistedTaskState>> {
        let conn = self.conn.lock().unwrap();
        let state = conn
            .query_row(
                "SELECT task_id, last_run, next_run, status, fail_count, attempt, occurrence, last_error
                 FROM task_state WHERE task_id = ?1",
                params![task_id],
                Self::row_to_task_state,
            )
            .optional()?;
        Ok(state)
    }

    fn list_task_states(&self) -> Result<Vec<PersistedTaskState>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT task_id, last_run, next_run, status, fail_count, attempt, occurrence, last_error
             FROM task_state ORDER BY task_id",
        )?;
        let states = stmt
            .query_map([], Self::row_to_task_state)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(states)
    }

    fn save_task_state(&self, state: &PersistedTaskState) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO task_state
                (task_id, last_run, next_run, status, fail_count, attempt, occurrence, last_error, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(task_id) DO UPDATE SET
                last_run = excluded.last_run,
                next_run = excluded.next_run,
                status = excluded.status,
                fail_count = excluded.fail_count,
                attempt = excluded.attempt,
                occurrence = excluded.occurrence,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at",
            params![
                state.task_id,
                state.last_run.as_ref().map(Self::format_datetime),
                state.next_run.as_ref().map(Self::format_datetime),
                state.status.as_str(),
                state.fail_count,
                state.attempt,
                state.occurrence.as_ref().map(Self::format_datetime),
                state.last_error,
                Self::format_datetime(&Utc::now()),
            ],
        )?;
        Ok(())
    }

    fn reset_interrupted_tasks(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let now_str = Self::format_datetime(&now);
        let count = conn.execute(
            "UPDATE task_state SET status = ?1, last_error = ?2, updated_at = ?3
             WHERE status = ?4
               AND NOT EXISTS (
                   SELECT 1 FROM task_leases l
                   WHERE l.task_id = task_state.task_id
                     AND l.completed_at IS NULL
                     AND l.expires_at > ?3
               )",
            params![
                TaskStatus::Idle.as_str(),
                "interrupted by restart",
                now_str,
                TaskStatus::Running.as_str(),
            ],
        )?;
        Ok(count)
    }

    fn try_acquire_lease(
        &self,
        task_id: &str,
        occurrence: DateTime<Utc>,
        node_id: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let now_str = Self::format_datetime(&now);
        // A single statement, so SQLite's write lock makes the check-and-claim
        // atomic across processes.
        let changed = conn.execute(
            "INSERT INTO task_leases (task_id, occurrence, node_id, acquired_at, expires_at, completed_at)
             SELECT ?1, ?2, ?3, ?4, ?5, NULL
             WHERE NOT EXISTS (
                     SELECT 1 FROM task_leases
                     WHERE task_id = ?1 AND completed_at IS NULL AND expires_at > ?4
                 )
               AND NOT EXISTS (
                     SELECT 1 FROM task_leases
                     WHERE task_id = ?1 AND occurrence = ?2 AND completed_at IS NOT NULL
                 )
             ON CONFLICT(task_id, occurrence) DO UPDATE SET
                node_id = excluded.node_id,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at",
            params![
                task_id,
                Self::format_datetime(&occurrence),
                node_id,
                now_str,
                Self::format_datetime(&Self::expiry(now, ttl)),
            ],
        )?;
        Ok(changed == 1)
    }

    fn renew_lease(
        &self,
        task_id: &str,
        occurrence: DateTime<Utc>,
        node_id: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE task_leases SET expires_at = ?1
             WHERE task_id = ?2 AND occurrence = ?3 AND node_id = ?4 AND completed_at IS NULL",
            params![
                Self::format_datetime(&Self::expiry(now, ttl)),
                task_id,
                Self::format_datetime(&occurrence),
                node_id,
            ],
        )?;
        Ok(changed == 1)
    }

    fn release_lease(
        &self,
        task_id: &str,
        occurrence: DateTime<Utc>,
        node_id: &str,
        now: DateTime<Utc>,
        completed: bool,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now_str = Self::format_datetime(&now);
        let completed_at = completed.then(|| now_str.clone());
        conn.execute(
            "UPDATE task_leases SET completed_at = ?1, expires_at = ?2
             WHERE task_id = ?3 AND occurrence = ?4 AND node_id = ?5 AND completed_at IS NULL",
            params![
                completed_at,
                now_str,
                task_id,
                Self::format_datetime(&occurrence),
                node_id
            ],
        )?;
        Ok(())
    }

    fn purge_leases(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "DELETE FROM task_leases WHERE expires_at < ?1",
            params![Self::format_datetime(&before)],
        )?;
        Ok(count)
    }

    fn record_run_start(
        &self,
        task_id: &str,
        occurrence: DateTime<Utc>,
        node_id: &str,
        trigger: RunTrigger,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO task_runs (task_id, occurrence, node_id, triggered_by, started_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                task_id,
                Self::format_datetime(&occurrence),
                node_id,
                trigger.as_str(),
                Self::format_datetime(&Utc::now()),
                RunStatus::Running.as_str(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn record_run_finish(
        &self,
        run_id: i64,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE task_runs SET finished_at = ?1, status = ?2, error = ?3 WHERE id = ?4",
            params![
                Self::format_datetime(&Utc::now()),
                status.as_str(),
                error,
                run_id
            ],
        )?;
        Ok(())
    }

    fn get_run_history(&self, task_id: &str, limit: usize) -> Result<Vec<TaskRun>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, task_id, occurrence, node_id, triggered_by, started_at, finished_at, status, error
             FROM task_runs WHERE task_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let runs = stmt
            .query_map(params![task_id, limit as i64], Self::row_to_task_run)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    fn ping(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }
}
