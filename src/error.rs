//! Error types for the SQLite helpers.

use rusqlite::ErrorCode;
use thiserror::Error;

use crate::retry::is_transient;

/// Errors returned by [`crate::SqliteStore`] and [`crate::DbCursor`].
#[derive(Debug, Error)]
pub enum SqliteError {
    /// The engine rejected the statement or the connection failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A helper that needs at least one field was called with none.
    #[error("no fields given for {operation} on table `{table}`")]
    EmptyFields {
        operation: &'static str,
        table: String,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SqliteError {
    /// Busy or locked database, i.e. worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, SqliteError::Database(err) if is_transient(err))
    }

    pub fn is_constraint_violation(&self) -> bool {
        match self {
            SqliteError::Database(rusqlite::Error::SqliteFailure(err, _)) => {
                err.code == ErrorCode::ConstraintViolation
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SqliteError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::ffi;

    fn failure(code: i32) -> SqliteError {
        SqliteError::Database(rusqlite::Error::SqliteFailure(
            ffi::Error::new(code),
            None,
        ))
    }

    #[test]
    fn test_classification() {
        assert!(failure(ffi::SQLITE_BUSY).is_transient());
        assert!(failure(ffi::SQLITE_LOCKED).is_transient());
        assert!(!failure(ffi::SQLITE_BUSY).is_constraint_violation());

        let constraint = failure(ffi::SQLITE_CONSTRAINT);
        assert!(constraint.is_constraint_violation());
        assert!(!constraint.is_transient());

        let empty = SqliteError::EmptyFields {
            operation: "update",
            table: "games".to_string(),
        };
        assert!(!empty.is_transient());
        assert_eq!(
            empty.to_string(),
            "no fields given for update on table `games`"
        );
    }
}
