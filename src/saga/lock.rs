//! Distributed lock service.
//!
//! Locks live entirely in the instance's own `saga_locks` table; they
//! are "distributed" in the sense that any activity addressing this
//! instance can contend for them. Exclusive locks exclude everything;
//! shared locks coexist with each other. Expired rows are reclaimed by
//! the next acquisition attempt on the same resource.

use std::sync::Arc;
use std::time::Duration;

use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::gate::Gate;
use crate::schema::SchemaManager;
use crate::storage::SqlStore;
use crate::types::{LockId, Timestamp};

/// Poll interval while waiting on a contended resource.
const POLL_INTERVAL_MS: u64 = 10;

/// Lock sharing mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockMode {
    /// Any number may coexist on one resource.
    Shared,
    /// Excludes every other lock on the resource.
    #[default]
    Exclusive,
}

impl LockMode {
    /// Storage string for the mode column.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::Exclusive => "exclusive",
        }
    }
}

/// A held lock.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    /// Lock identity, used for extend/release.
    pub id: LockId,
    /// Resource name the lock covers.
    pub resource: String,
    /// Owner tag supplied at acquisition.
    pub owner: String,
    /// Sharing mode.
    pub mode: LockMode,
    /// Acquisition time.
    pub acquired_at: Timestamp,
    /// Expiration time; the lock is reclaimable afterwards.
    pub expires_at: Timestamp,
}

/// Options for [`LockService::acquire`].
#[derive(Clone, Copy, Debug)]
pub struct LockOptions {
    /// Sharing mode (default exclusive).
    pub mode: LockMode,
    /// How long the lock is held before expiring.
    pub duration_ms: u64,
    /// How long to wait for a contended resource; 0 fails fast.
    pub timeout_ms: u64,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            mode: LockMode::Exclusive,
            duration_ms: 30_000,
            timeout_ms: 0,
        }
    }
}

/// SQL-backed lock table.
#[derive(Debug)]
pub struct LockService {
    sql: Arc<SqlStore>,
    schema: Arc<SchemaManager>,
    gate: Arc<Gate>,
}

impl LockService {
    /// Creates a lock service over the instance's SQL store.
    pub fn new(sql: Arc<SqlStore>, schema: Arc<SchemaManager>, gate: Arc<Gate>) -> Self {
        Self { sql, schema, gate }
    }

    /// Attempts to acquire a lock on `resource`.
    ///
    /// Returns `None` when the resource stays contended past
    /// `timeout_ms` (immediately for a zero timeout).
    pub fn acquire(
        &self,
        resource: &str,
        owner: &str,
        opts: LockOptions,
    ) -> Result<Option<Lock>> {
        self.schema.ensure_initialized(&self.sql)?;
        let deadline = Timestamp::now().as_millis() + opts.timeout_ms as i64;

        loop {
            if let Some(lock) = self.try_acquire(resource, owner, opts)? {
                return Ok(Some(lock));
            }
            if Timestamp::now().as_millis() >= deadline {
                debug!(resource, owner, "Lock acquisition timed out");
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
        }
    }

    /// One reclaim-check-insert pass; atomic under the instance gate.
    fn try_acquire(
        &self,
        resource: &str,
        owner: &str,
        opts: LockOptions,
    ) -> Result<Option<Lock>> {
        self.gate.run(|| {
            let now = Timestamp::now();

            // Reclaim expired rows on this resource
            self.sql.execute(
                "DELETE FROM saga_locks WHERE resource = ?1 AND expires_at <= ?2",
                params![resource, now.as_millis()],
            )?;

            // An exclusive request conflicts with anything; a shared
            // request conflicts only with an exclusive holder.
            let conflicts: i64 = self.sql.with_conn(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM saga_locks WHERE resource = ?1 AND (mode = 'exclusive' OR ?2 = 'exclusive')",
                    params![resource, opts.mode.as_str()],
                    |row| row.get(0),
                )
            })?;
            if conflicts > 0 {
                return Ok(None);
            }

            let lock = Lock {
                id: LockId::new(),
                resource: resource.to_string(),
                owner: owner.to_string(),
                mode: opts.mode,
                acquired_at: now,
                expires_at: Timestamp::from_millis(now.as_millis() + opts.duration_ms as i64),
            };
            self.sql.execute(
                "INSERT INTO saga_locks (lock_id, resource, owner, mode, acquired_at, expires_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    lock.id.to_string(),
                    lock.resource,
                    lock.owner,
                    lock.mode.as_str(),
                    lock.acquired_at.as_millis(),
                    lock.expires_at.as_millis(),
                ],
            )?;
            debug!(resource, owner, mode = lock.mode.as_str(), "Lock acquired");
            Ok(Some(lock))
        })
    }

    /// Extends a live lock to `now + new_duration_ms`.
    ///
    /// Returns `false` if the lock no longer exists or already expired.
    pub fn extend(&self, lock_id: LockId, new_duration_ms: u64) -> Result<bool> {
        self.schema.ensure_initialized(&self.sql)?;
        let now = Timestamp::now().as_millis();
        let updated = self.sql.execute(
            "UPDATE saga_locks SET expires_at = ?1 WHERE lock_id = ?2 AND expires_at > ?3",
            params![now + new_duration_ms as i64, lock_id.to_string(), now],
        )?;
        Ok(updated > 0)
    }

    /// Releases a lock. Returns `false` if it was already gone.
    pub fn release(&self, lock_id: LockId) -> Result<bool> {
        self.schema.ensure_initialized(&self.sql)?;
        let deleted = self.sql.execute(
            "DELETE FROM saga_locks WHERE lock_id = ?1",
            params![lock_id.to_string()],
        )?;
        Ok(deleted > 0)
    }
}
