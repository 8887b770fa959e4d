//! Store configuration: database path, retry behaviour and busy timeout.
//!
//! Durations are kept as milliseconds so the struct round-trips through
//! serde as plain integers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SqliteError};
use crate::retry::{RetryPolicy, DB_RETRIES, DEFAULT_RETRY_DELAY};

/// Engine-side wait for a lock before `SQLITE_BUSY` is reported.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Milliseconds in `duration`, saturating at `u64::MAX`.
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn default_retry_attempts() -> u32 {
    DB_RETRIES
}

fn default_retry_delay_ms() -> u64 {
    millis(DEFAULT_RETRY_DELAY)
}

fn default_busy_timeout_ms() -> u64 {
    millis(DEFAULT_BUSY_TIMEOUT)
}

/// SQLite store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqliteConfig {
    /// Path to the SQLite database file
    pub db_path: PathBuf,
    /// Attempts made for a query failing with a busy/locked error
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl SqliteConfig {
    /// Create a config for `db_path` with the default retry behaviour
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }

    pub fn with_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.retry_attempts = attempts;
        self.retry_delay_ms = millis(delay);
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout_ms = millis(timeout);
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_attempts,
            Duration::from_millis(self.retry_delay_ms),
        )
    }

    /// Busy timeout handed to the engine, capped at what SQLite accepts
    /// (`i32::MAX` milliseconds).
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms.min(i32::MAX as u64))
    }

    pub fn validate(&self) -> Result<()> {
        if self.db_path.as_os_str().is_empty() {
            return Err(SqliteError::InvalidConfig(
                "db_path must not be empty".to_string(),
            ));
        }
        if self.retry_attempts == 0 {
            return Err(SqliteError::InvalidConfig(
                "retry_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
