//! Per-task mutual exclusion.
//!
//! A single node only needs an in-process lock per task id. Nodes sharing one
//! database claim each occurrence through a conditional write on the lease
//! table, so the database decides which node runs it.

use crate::scheduler_store::SchedulerStore;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub trait ExecutionLease: Send + Sync {
    /// Tries to claim `occurrence` of `task_id`. `Ok(false)` means another
    /// holder has it, which is not an error.
    fn acquire(
        &self,
        task_id: &str,
        occurrence: DateTime<Utc>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool>;

    /// Extends a held claim. `Ok(false)` means it was lost.
    fn renew(
        &self,
        task_id: &str,
        occurrence: DateTime<Utc>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool>;

    /// Ends a held claim. `completed` marks the occurrence as done so it is
    /// never claimed again; otherwise it is left claimable.
    fn release(
        &self,
        task_id: &str,
        occurrence: DateTime<Utc>,
        now: DateTime<Utc>,
        completed: bool,
    ) -> Result<()>;

    /// Whether held claims expire and must be renewed while the handler runs.
    fn needs_renewal(&self) -> bool;
}

/// In-process lease for single-node deployments.
#[derive(Default)]
pub struct LocalLease {
    held: Mutex<HashSet<String>>,
}

impl LocalLease {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionLease for LocalLease {
    fn acquire(
        &self,
        task_id: &str,
        _occurrence: DateTime<Utc>,
        _now: DateTime<Utc>,
        _ttl: Duration,
    ) -> Result<bool> {
        Ok(self.held.lock().unwrap().insert(task_id.to_string()))
    }

    fn renew(
        &self,
        task_id: &str,
        _occurrence: DateTime<Utc>,
        _now: DateTime<Utc>,
        _ttl: Duration,
    ) -> Result<bool> {
        Ok(self.held.lock().unwrap().contains(task_id))
    }

    fn release(
        &self,
        task_id: &str,
        _occurrence: DateTime<Utc>,
        _now: DateTime<Utc>,
        _completed: bool,
    ) -> Result<()> {
        self.held.lock().unwrap().remove(task_id);
        Ok(())
    }

    fn needs_renewal(&self) -> bool {
        false
    }
}

/// Database-backed lease for cluster deployments.
pub struct StoreLease {
    store: Arc<dyn SchedulerStore>,
    node_id: String,
}

impl StoreLease {
    pub fn new(store: Arc<dyn SchedulerStore>, node_id: &str) -> Self {
        Self {
            store,
            node_id: node_id.to_string(),
        }
    }
}

impl ExecutionLease for StoreLease {
    fn acquire(
        &self,
        task_id: &str,
        occurrence: DateTime<Utc>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool> {
        self.store
            .try_acquire_lease(task_id, occurrence, &self.node_id, now, ttl)
    }

    fn renew(
        &self,
        task_id: &str,
        occurrence: DateTime<Utc>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool> {
        self.store
            .renew_lease(task_id, occurrence, &self.node_id, now, ttl)
    }

    fn release(
        &self,
        task_id: &str,
        occurrence: DateTime<Utc>,
        now: DateTime<Utc>,
        completed: bool,
    ) -> Result<()> {
        self.store
            .release_lease(task_id, occurrence, &self.node_id, now, completed)
    }

    fn needs_renewal(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler_store::SqliteSchedulerStore;
    use tempfile::TempDir;

    const TTL: Duration = Duration::from_secs(120);

    #[test]
    fn test_local_lease_is_exclusive_per_task() {
        let lease = LocalLease::new();
        let now = Utc::now();

        assert!(lease.acquire("backup_daily", now, now, TTL).unwrap());
        assert!(!lease.acquire("backup_daily", now, now, TTL).unwrap());
        assert!(lease.acquire("log_rotation", now, now, TTL).unwrap());
        assert!(lease.renew("backup_daily", now, now, TTL).unwrap());

        lease.release("backup_daily", now, now, true).unwrap();
        assert!(!lease.renew("backup_daily", now, now, TTL).unwrap());
        assert!(lease.acquire("backup_daily", now, now, TTL).unwrap());
        assert!(!lease.needs_renewal());
    }

    #[test]
    fn test_store_leases_on_shared_database() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("scheduler.db");
        let store_a: Arc<dyn SchedulerStore> = Arc::new(SqliteSchedulerStore::new(&path).unwrap());
        let store_b: Arc<dyn SchedulerStore> = Arc::new(SqliteSchedulerStore::new(&path).unwrap());
        let node_a = StoreLease::new(store_a, "node-a");
        let node_b = StoreLease::new(store_b, "node-b");
        let occurrence = Utc::now();
        let now = occurrence;

        assert!(node_a.acquire("geoip_update", occurrence, now, TTL).unwrap());
        assert!(!node_b.acquire("geoip_update", occurrence, now, TTL).unwrap());
        assert!(!node_b.renew("geoip_update", occurrence, now, TTL).unwrap());
        assert!(node_a.renew("geoip_update", occurrence, now, TTL).unwrap());

        node_a.release("geoip_update", occurrence, now, true).unwrap();
        // A finished occurrence stays claimed
        assert!(!node_b.acquire("geoip_update", occurrence, now, TTL).unwrap());
        assert!(node_a.needs_renewal());
    }
}
