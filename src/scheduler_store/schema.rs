//! SQLite schema definitions for the scheduler database.
//!
//! The tables are private to the scheduler: per-task state, execution
//! leases and the execution history.

use crate::sqlite_column;
use crate::sqlite_persistence::{SqlType, Table, VersionedSchema};

// =============================================================================
// Version 1 - Task state and leases
// =============================================================================

/// One row per task id, updated on every state transition.
const TASK_STATE_TABLE_V1: Table = Table {
    name: "task_state",
    columns: &[
        sqlite_column!("task_id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("last_run", &SqlType::Text),
        sqlite_column!("next_run", &SqlType::Text),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!(
            "fail_count",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!(
            "attempt",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("occurrence", &SqlType::Text),
        sqlite_column!("last_error", &SqlType::Text),
        sqlite_column!("updated_at", &SqlType::Text, non_null = true),
    ],
    primary_key: &[],
    indices: &[],
};

/// One row per (task id, occurrence). Rows are kept after release so that
/// a finished occurrence can't be claimed twice.
const TASK_LEASES_TABLE_V1: Table = Table {
    name: "task_leases",
    columns: &[
        sqlite_column!("task_id", &SqlType::Text, non_null = true),
        sqlite_column!("occurrence", &SqlType::Text, non_null = true),
        sqlite_column!("node_id", &SqlType::Text, non_null = true),
        sqlite_column!("acquired_at", &SqlType::Text, non_null = true),
        sqlite_column!("expires_at", &SqlType::Text, non_null = true),
        sqlite_column!("completed_at", &SqlType::Text),
    ],
    primary_key: &["task_id", "occurrence"],
    indices: &[("idx_task_leases_expires", "expires_at")],
};

// =============================================================================
// Version 2 - Execution history
// =============================================================================

const TASK_RUNS_TABLE_V2: Table = Table {
    name: "task_runs",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true), // AUTOINCREMENT
        sqlite_column!("task_id", &SqlType::Text, non_null = true),
        sqlite_column!("occurrence", &SqlType::Text, non_null = true),
        sqlite_column!("node_id", &SqlType::Text, non_null = true),
        sqlite_column!("triggered_by", &SqlType::Text, non_null = true),
        sqlite_column!("started_at", &SqlType::Text, non_null = true),
        sqlite_column!("finished_at", &SqlType::Text),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("error", &SqlType::Text),
    ],
    primary_key: &[],
    indices: &[("idx_task_runs_task_started", "task_id, started_at DESC")],
};

/// Migration from version 1 to version 2: add task_runs table
fn migrate_v1_to_v2(conn: &rusqlite::Connection) -> anyhow::Result<()> {
    TASK_RUNS_TABLE_V2.create(conn)
}

// =============================================================================
// Versioned Schema Definition
// =============================================================================

/// All versioned schemas for the scheduler database.
///
/// Version 1: task_state and task_leases
/// Version 2: task_runs
pub const SCHEDULER_VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 1,
        tables: &[TASK_STATE_TABLE_V1, TASK_LEASES_TABLE_V1],
        migration: None,
    },
    VersionedSchema {
        version: 2,
        tables: &[TASK_STATE_TABLE_V1, TASK_LEASES_TABLE_V1, TASK_RUNS_TABLE_V2],
        migration: Some(migrate_v1_to_v2),
    },
];

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_every_version_creates_and_validates() {
        for schema in SCHEDULER_VERSIONED_SCHEMAS {
            let conn = Connection::open_in_memory().unwrap();
            schema.create(&conn).unwrap();
            schema.validate(&conn).unwrap();
        }
    }

    #[test]
    fn test_v1_to_v2_migration() {
        let conn = Connection::open_in_memory().unwrap();
        SCHEDULER_VERSIONED_SCHEMAS[0].create(&conn).unwrap();

        // v1 does not validate as v2 yet
        assert!(SCHEDULER_VERSIONED_SCHEMAS[1].validate(&conn).is_err());

        migrate_v1_to_v2(&conn).unwrap();
        SCHEDULER_VERSIONED_SCHEMAS[1].validate(&conn).unwrap();
    }

    #[test]
    fn test_lease_primary_key_is_task_and_occurrence() {
        let conn = Connection::open_in_memory().unwrap();
        SCHEDULER_VERSIONED_SCHEMAS.last().unwrap().create(&conn).unwrap();

        let insert = "INSERT INTO task_leases (task_id, occurrence, node_id, acquired_at, expires_at)
                      VALUES (?1, ?2, 'node-a', '2024-01-01T00:00:00.000Z', '2024-01-01T00:02:00.000Z')";
        conn.execute(insert, ["backup_daily", "2024-01-01T00:00:00.000Z"])
            .unwrap();
        assert!(conn
            .execute(insert, ["backup_daily", "2024-01-01T00:00:00.000Z"])
            .is_err());
        conn.execute(insert, ["backup_daily", "2024-01-02T00:00:00.000Z"])
            .unwrap();
    }
}
