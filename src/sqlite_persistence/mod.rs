//! Versioned SQLite schema helpers shared by the persistent stores.

mod versioned_schema;

pub use versioned_schema::{Column, SqlType, Table, VersionedSchema, BASE_DB_VERSION};
