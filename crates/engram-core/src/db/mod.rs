//! SQLite access for the memory engine.
//!
//! Database location priority:
//! 1. ENGRAM_DB_PATH env var
//! 2. Walk up the directory tree looking for engram.db
//! 3. ~/.engram/engram.db

pub mod migrations;

use crate::error::{Error, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Database connection wrapper.
///
/// Thread-safe via internal Mutex. Writers hold the lock for the whole
/// backup-validate-commit cycle, which is what serializes mutations per
/// store.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open database connection, auto-detecting location.
    pub fn open() -> Result<Self> {
        let path = Self::find_database()?;
        Self::open_path(&path)
    }

    /// Open database at a specific path.
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        Self::init(conn)
    }

    /// Open an in-memory database. Used by tests and throwaway engines.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA foreign_keys=ON;",
        )?;
        migrations::run_migrations(&conn)?;
        tracing::debug!("database opened, migrations applied");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Find the database file location.
    fn find_database() -> Result<PathBuf> {
        // 1. Environment variable
        if let Ok(path) = std::env::var("ENGRAM_DB_PATH") {
            return Ok(PathBuf::from(path));
        }

        // 2. Walk up the directory tree from the current dir
        if let Ok(mut current) = std::env::current_dir() {
            loop {
                let db_path = current.join("engram.db");
                if db_path.exists() {
                    return Ok(db_path);
                }
                if !current.pop() {
                    break;
                }
            }
        }

        // 3. Home directory default
        let home = dirs::home_dir().ok_or(Error::DatabaseNotFound)?;
        let dir = home.join(".engram");
        std::fs::create_dir_all(&dir)?;
        Ok(dir.join("engram.db"))
    }

    /// Check database connectivity.
    pub fn ping(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch("SELECT 1")?;
        Ok(())
    }

    /// Acquire the connection lock.
    ///
    /// Exposed so the protection layer can open transactions; ordinary
    /// reads should prefer `with_conn`.
    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::LockPoisoned)
    }

    /// Run a read-only closure against the connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock()?;
        f(&conn)
    }
}
