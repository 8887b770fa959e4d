//! Retrying query execution.
//!
//! SQLite reports lock contention as `SQLITE_BUSY` or `SQLITE_LOCKED`. Both
//! usually clear once the other writer commits, so [`RetryPolicy::run`]
//! re-runs the whole operation a bounded number of times before giving up.
//! Any other failure is returned on the first attempt.

use std::thread;
use std::time::Duration;

use rusqlite::ErrorCode;

/// Number of attempts made before a transient failure is returned.
pub const DB_RETRIES: u32 = 5;

/// Pause between two attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Returns true for errors caused by another connection holding a lock.
pub fn is_transient(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(failure, _) => matches!(
            failure.code,
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}

/// How often, and how patiently, a query is re-run on lock contention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DB_RETRIES,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempts are used up. `query` is only used for diagnostics.
    pub fn run<T, F>(&self, query: &str, mut op: F) -> rusqlite::Result<T>
    where
        F: FnMut() -> rusqlite::Result<T>,
    {
        let attempts = self.attempts.max(1);
        let mut failed = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if is_transient(&err) => {
                    failed += 1;
                    if failed >= attempts {
                        tracing::error!(
                            query,
                            attempts,
                            error = %err,
                            "sql query failed, giving up"
                        );
                        return Err(err);
                    }
                    tracing::error!(
                        query,
                        remaining = attempts - failed,
                        error = %err,
                        "sql query failed, retrying"
                    );
                    thread::sleep(self.delay);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::ffi;

    fn busy() -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(
            ffi::Error::new(ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        )
    }

    fn no_wait() -> RetryPolicy {
        RetryPolicy::new(DB_RETRIES, Duration::ZERO)
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts, 5);
        assert_eq!(policy.delay, Duration::from_secs(1));
    }

    #[test]
    fn test_transient_failure_recovers() {
        let mut calls = 0;
        let result = no_wait().run("select 1", || {
            calls += 1;
            if calls < 4 {
                Err(busy())
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 4);
    }

    #[test]
    fn test_last_attempt_can_succeed() {
        let mut calls = 0;
        let result = no_wait().run("select 1", || {
            calls += 1;
            if calls < DB_RETRIES {
                Err(busy())
            } else {
                Ok(())
            }
        });
        assert!(result.is_ok());
        assert_eq!(calls, DB_RETRIES);
    }

    #[test]
    fn test_persistent_failure_gives_up_after_limit() {
        let mut calls = 0;
        let result: rusqlite::Result<()> = no_wait().run("select 1", || {
            calls += 1;
            Err(busy())
        });
        let err = result.unwrap_err();
        assert!(is_transient(&err));
        assert_eq!(calls, 5);
    }

    #[test]
    fn test_non_transient_failure_is_not_retried() {
        let mut calls = 0;
        let result: rusqlite::Result<()> = no_wait().run("insert", || {
            calls += 1;
            Err(rusqlite::Error::SqliteFailure(
                ffi::Error::new(ffi::SQLITE_CONSTRAINT),
                None,
            ))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);

        calls = 0;
        let result: rusqlite::Result<()> = no_wait().run("select", || {
            calls += 1;
            Err(rusqlite::Error::QueryReturnedNoRows)
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_zero_attempts_still_runs_once() {
        let mut calls = 0;
        let result: rusqlite::Result<()> =
            RetryPolicy::new(0, Duration::ZERO).run("select 1", || {
                calls += 1;
                Err(busy())
            });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_sleeps_between_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_millis(20));
        let started = std::time::Instant::now();
        let result: rusqlite::Result<()> = policy.run("select 1", || Err(busy()));
        assert!(result.is_err());
        // two pauses for three attempts
        assert!(started.elapsed() >= Duration::from_millis(40));
    }
}
