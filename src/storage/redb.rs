//! redb key/value engine implementation.
//!
//! This module provides the production [`KvStore`] backend using
//! [redb](https://docs.rs/redb), a pure Rust embedded key-value store.
//!
//! # Features
//!
//! - ACID transactions with MVCC
//! - Single-writer, multiple-reader concurrency
//! - Automatic crash recovery
//! - Zero external dependencies (pure Rust)
//!
//! All instance KV data lives in one string-keyed table; subsystems
//! partition it by key prefix (`events:`, `cascade:queue:`,
//! `projection:`, `saga:pending:`, `alarm:`).

use std::path::{Path, PathBuf};

use ::redb::{Database, ReadableTable, TableDefinition};
use tracing::{debug, info, instrument};

use super::KvStore;
use crate::error::{Result, StorageError};

/// The single KV table. Key: prefixed string. Value: opaque bytes.
const KV_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");

/// redb-backed key/value store.
///
/// # Thread Safety
///
/// `RedbKv` is `Send + Sync`. redb handles internal synchronization
/// using MVCC for readers and exclusive locking for writers.
#[derive(Debug)]
pub struct RedbKv {
    /// The redb database handle.
    db: Database,

    /// Path to the database file.
    path: PathBuf,
}

impl RedbKv {
    /// Opens or creates a KV database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is corrupted or locked by another
    /// process.
    #[instrument(fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db_exists = path.exists();

        debug!(db_exists = db_exists, "Opening KV engine");

        let db = Database::builder().create(path).map_err(|e| {
            if e.to_string().contains("locked") {
                StorageError::DatabaseLocked
            } else {
                StorageError::Kv(e.to_string())
            }
        })?;

        // Make sure the table exists so first reads don't fail
        let write_txn = db.begin_write().map_err(StorageError::from)?;
        {
            let _ = write_txn.open_table(KV_TABLE)?;
        }
        write_txn.commit().map_err(StorageError::from)?;

        info!("KV engine opened");
        Ok(Self {
            db,
            path: path.to_path_buf(),
        })
    }

    /// Returns the path to the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KvStore for RedbKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read().map_err(StorageError::from)?;
        let table = read_txn.open_table(KV_TABLE)?;
        let value = table
            .get(key)
            .map_err(StorageError::from)?
            .map(|guard| guard.value().to_vec());
        Ok(value)
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(StorageError::from)?;
        {
            let mut table = write_txn.open_table(KV_TABLE)?;
            table.insert(key, value)?;
        }
        write_txn.commit().map_err(StorageError::from)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let write_txn = self.db.begin_write().map_err(StorageError::from)?;
        let existed = {
            let mut table = write_txn.open_table(KV_TABLE)?;
            let removed = table.remove(key)?;
            removed.is_some()
        };
        write_txn.commit().map_err(StorageError::from)?;
        Ok(existed)
    }

    fn delete_all(&self) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(StorageError::from)?;
        {
            // Collect first: redb iterators borrow the table
            let mut table = write_txn.open_table(KV_TABLE)?;
            let keys: Vec<String> = table
                .iter()
                .map_err(StorageError::from)?
                .filter_map(|entry| entry.ok())
                .map(|(k, _)| k.value().to_string())
                .collect();
            for key in keys {
                table.remove(key.as_str())?;
            }
        }
        write_txn.commit().map_err(StorageError::from)?;
        Ok(())
    }

    fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let read_txn = self.db.begin_read().map_err(StorageError::from)?;
        let table = read_txn.open_table(KV_TABLE)?;

        let mut out = Vec::new();
        let range = table.range(prefix..).map_err(StorageError::from)?;
        for entry in range {
            let (key, value) = entry.map_err(StorageError::from)?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.to_string(), value.value().to_vec()));
        }
        Ok(out)
    }
}
