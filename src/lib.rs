//! Metasearch Scheduler Library
//!
//! Persistent scheduler for the maintenance tasks of a self-hosted metasearch
//! server, plus its SQLite state store and configuration.

pub mod config;
pub mod metrics;
pub mod scheduler;
pub mod scheduler_store;
pub mod sqlite_persistence;

// Re-export commonly used types for convenience
pub use scheduler::{AdminAdapter, Scheduler, SchedulerError, TaskSnapshot};
pub use scheduler_store::{SchedulerStore, SqliteSchedulerStore};
