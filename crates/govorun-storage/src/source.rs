//! A single named SQLite data source with a small connection pool.
//!
//! Connections are handed out round-robin; each one sits behind its own
//! mutex so independent workers don't serialize on a single connection.
//! Read-only sources are opened with SQLITE_OPEN_READ_ONLY and every write
//! entry point calls [`SqliteSource::check_writable`] first, so a rejected
//! write has no side effect.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, Transaction};

use govorun_core::config::SourceConfig;

use crate::error::{Result, StorageError};

pub struct SqliteSource {
    name: String,
    readonly: bool,
    pool: Vec<Mutex<Connection>>,
    next: AtomicUsize,
}

impl SqliteSource {
    /// Open `pool_size` connections to the configured path.
    pub fn open(name: &str, config: &SourceConfig) -> Result<Self> {
        let size = config.pool_size.max(1);
        let mut pool = Vec::with_capacity(size);
        for _ in 0..size {
            pool.push(Mutex::new(open_connection(
                &config.path,
                config.readonly,
                config.timeout,
            )?));
        }
        Ok(Self {
            name: name.to_string(),
            readonly: config.readonly,
            pool,
            next: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Fail fast (before any I/O) when this source cannot be written.
    pub fn check_writable(&self) -> Result<()> {
        if self.readonly {
            Err(StorageError::ReadOnlySource(self.name.clone()))
        } else {
            Ok(())
        }
    }

    /// Run `f` with a pooled connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        f(&self.conn())
    }

    /// Run `f` inside a transaction; commit on Ok, roll back on Err.
    pub fn with_txn<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let mut guard = self.conn();
        let txn = guard.transaction()?;
        let out = f(&txn)?;
        txn.commit()?;
        Ok(out)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.pool.len();
        // A poisoned mutex means a panic mid-query on this connection; the
        // connection itself is still usable for independent statements.
        self.pool[idx]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn open_connection(path: &str, readonly: bool, timeout_secs: u64) -> Result<Connection> {
    let conn = if readonly {
        Connection::open_with_flags(
            Path::new(path),
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?
    } else {
        Connection::open(Path::new(path))?
    };
    conn.busy_timeout(Duration::from_secs(timeout_secs))?;
    if !readonly {
        // journal_mode returns the resulting mode as a row.
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |r| r.get(0))?;
    }
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use govorun_core::config::SourceConfig;

    fn temp_source(readonly: bool) -> (tempfile::TempDir, SqliteSource) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db").to_string_lossy().into_owned();
        // Create the file read-write first so a readonly open has something to attach to.
        let rw = SqliteSource::open(
            "seed",
            &SourceConfig {
                path: path.clone(),
                readonly: false,
                pool_size: 1,
                timeout: 1,
            },
        )
        .unwrap();
        rw.with_conn(|c| {
            c.execute_batch("CREATE TABLE t (x INTEGER)")?;
            Ok(())
        })
        .unwrap();
        drop(rw);

        let src = SqliteSource::open(
            "main",
            &SourceConfig {
                path,
                readonly,
                pool_size: 2,
                timeout: 1,
            },
        )
        .unwrap();
        (dir, src)
    }

    #[test]
    fn write_through_pool() {
        let (_dir, src) = temp_source(false);
        src.with_txn(|t| {
            t.execute("INSERT INTO t (x) VALUES (1)", [])?;
            t.execute("INSERT INTO t (x) VALUES (2)", [])?;
            Ok(())
        })
        .unwrap();
        let n: i64 = src
            .with_conn(|c| Ok(c.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(n, 2);
    }

    #[test]
    fn readonly_flag_rejects_writes() {
        let (_dir, src) = temp_source(true);
        assert!(matches!(
            src.check_writable(),
            Err(StorageError::ReadOnlySource(_))
        ));
    }

    #[test]
    fn failed_txn_rolls_back() {
        let (_dir, src) = temp_source(false);
        let result: Result<()> = src.with_txn(|t| {
            t.execute("INSERT INTO t (x) VALUES (1)", [])?;
            Err(StorageError::Conflict("boom".to_string()))
        });
        assert!(result.is_err());
        let n: i64 = src
            .with_conn(|c| Ok(c.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(n, 0);
    }
}
