//! Embedded relational engine wrapper.
//!
//! [`SqlStore`] wraps a single rusqlite [`Connection`] behind a mutex.
//! The bundled SQLite build ships the FTS5 module, which the full-text
//! subsystem relies on.
//!
//! The instance is cooperatively single-threaded from the host's point
//! of view, so one connection is enough; the mutex only guards against
//! overlapping library-internal access from helper threads (parallel
//! saga compensation).

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::{debug, instrument};

use crate::error::{Result, StorageError};

/// Shared handle to the instance's SQL engine.
pub struct SqlStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqlStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlStore").finish_non_exhaustive()
    }
}

impl SqlStore {
    /// Opens or creates a SQLite database at the given path.
    #[instrument(fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).map_err(StorageError::from)?;
        debug!("SQL engine opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Opens an in-memory database (tests, ephemeral instances).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(StorageError::from)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Runs `f` with the connection. All SQL in the crate goes through
    /// here so locking stays in one place.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        f(&conn).map_err(|e| StorageError::from(e).into())
    }

    /// Executes a single statement, returning the affected row count.
    pub fn execute(&self, sql: &str, params: impl rusqlite::Params) -> Result<usize> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(sql, params)
            .map_err(|e| StorageError::from(e).into())
    }

    /// Executes a batch of semicolon-separated statements.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(sql)
            .map_err(|e| StorageError::from(e).into())
    }
}
