//! Scoped SQLite CRUD helpers with retry on lock contention.
//!
//! # Intention
//!
//! - Provide generic insert/update/delete/select helpers over a SQLite file.
//! - Absorb the engine's own lock contention with a bounded retry loop.
//!
//! # Architectural Boundaries
//!
//! - Every call opens its own connection and commits it before returning.
//! - No schema management, pooling or application data model.

pub mod config;
pub mod error;
pub mod retry;
pub mod sqlite;

pub use config::SqliteConfig;
pub use error::{Result, SqliteError};
pub use retry::{is_transient, RetryPolicy, DB_RETRIES};
pub use sqlite::{
    ColumnDefinition, Condition, DataType, DbCursor, DefaultValue, Fields, Row, SqliteStore,
    Value,
};
