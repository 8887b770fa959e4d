// Lock contention between two connections on the same file.
//
// A helper thread takes an exclusive lock and holds it for a while. The store
// runs with a zero busy timeout so every blocked attempt fails straight away
// with SQLITE_BUSY and goes through the retry loop.

use anyhow::Result;
use rusqlite::Connection;
use sqlite_crud::{Condition, Fields, SqliteConfig, SqliteStore};
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tempfile::NamedTempFile;

fn create_temp_db() -> Result<NamedTempFile> {
    let temp_file = NamedTempFile::new()?;
    let conn = Connection::open(temp_file.path())?;
    conn.execute_batch("CREATE TABLE games (id INTEGER PRIMARY KEY, slug TEXT NOT NULL);")?;
    Ok(temp_file)
}

fn store_for(path: &std::path::Path, attempts: u32, delay: Duration) -> Result<SqliteStore> {
    let config = SqliteConfig::new(path)
        .with_retry(attempts, delay)
        .with_busy_timeout(Duration::ZERO);
    Ok(SqliteStore::new(config)?)
}

// Holds an exclusive lock until `release` fires, then commits.
fn hold_lock(
    path: PathBuf,
    locked: mpsc::Sender<()>,
    release: mpsc::Receiver<()>,
) -> thread::JoinHandle<rusqlite::Result<()>> {
    thread::spawn(move || {
        let conn = Connection::open(path)?;
        conn.execute_batch("BEGIN EXCLUSIVE")?;
        locked.send(()).ok();
        release.recv().ok();
        conn.execute_batch("COMMIT")
    })
}

#[test]
fn test_lock_released_within_retry_window() {
    test_lock_released_within_retry_window_impl().unwrap();
}

fn test_lock_released_within_retry_window_impl() -> Result<()> {
    let file = create_temp_db()?;
    let (locked_tx, locked_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let holder = hold_lock(file.path().to_path_buf(), locked_tx, release_rx);
    locked_rx.recv()?;

    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        release_tx.send(()).ok();
    });

    let store = store_for(file.path(), 5, Duration::from_millis(100))?;
    let id = store.insert("games", &Fields::new().with_value("slug", "quake"))?;

    releaser.join().unwrap();
    holder.join().unwrap()?;

    let rows = store.select("games", None, Some(&Condition::eq("id", id)))?;
    assert_eq!(rows.len(), 1);
    Ok(())
}

#[test]
fn test_lock_held_past_retry_window() {
    test_lock_held_past_retry_window_impl().unwrap();
}

fn test_lock_held_past_retry_window_impl() -> Result<()> {
    let file = create_temp_db()?;
    let (locked_tx, locked_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let holder = hold_lock(file.path().to_path_buf(), locked_tx, release_rx);
    locked_rx.recv()?;

    let store = store_for(file.path(), 3, Duration::from_millis(10))?;
    let err = store
        .insert("games", &Fields::new().with_value("slug", "quake"))
        .unwrap_err();
    assert!(err.is_transient());

    release_tx.send(())?;
    holder.join().unwrap()?;

    // the lock is gone, so the same call now goes through
    store.insert("games", &Fields::new().with_value("slug", "quake"))?;
    assert_eq!(store.select("games", None, None)?.len(), 1);
    Ok(())
}
