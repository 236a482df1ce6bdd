//! Storage layer abstractions for cellstore.
//!
//! An instance owns two storage primitives:
//!
//! - a key/value store (`KvStore` trait, backed by redb in production)
//!   used for the domain-event log, the soft-cascade queue, projection
//!   positions, 2PC pending records, and the alarm slot;
//! - an embedded relational engine ([`SqlStore`], rusqlite with the
//!   bundled SQLite including FTS5) used for the event log, things,
//!   sagas, locks, and full-text search.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Instance                                │
//! │                    │           │                             │
//! │                    ▼           ▼                             │
//! │           ┌────────────┐  ┌──────────┐                      │
//! │           │  KvStore   │  │ SqlStore │                      │
//! │           └────────────┘  └──────────┘                      │
//! │              ▲       ▲                                       │
//! │              │       │                                       │
//! │        ┌─────┴──┐ ┌──┴──────┐                               │
//! │        │ RedbKv │ │ MemoryKv│                               │
//! │        └────────┘ └─────────┘                               │
//! │          (prod)     (test)                                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod redb;
pub mod sql;

pub use self::redb::RedbKv;
pub use sql::SqlStore;

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::error::Result;

/// Key/value store trait.
///
/// Keys are strings; multi-segment keys use `:` separators with
/// zero-padded numeric segments so lexicographic order equals numeric
/// order. Values are opaque bytes (bincode-encoded records).
///
/// Implementations must be `Send + Sync`; the instance shares one store
/// across all subsystems.
pub trait KvStore: Send + Sync {
    /// Retrieves the value stored under `key`, if any.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Stores `value` under `key`, replacing any prior value.
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Removes `key`. Returns `true` if a value existed.
    fn delete(&self, key: &str) -> Result<bool>;

    /// Removes every key in the store.
    fn delete_all(&self) -> Result<()>;

    /// Lists `(key, value)` pairs whose key starts with `prefix`,
    /// in ascending key order.
    fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
}

/// In-memory `KvStore` for tests and ephemeral instances.
///
/// A `BTreeMap` behind an `RwLock`; prefix scans use the map's natural
/// key ordering.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKv {
    /// Creates an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().unwrap().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries
            .write()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().unwrap().remove(key).is_some())
    }

    fn delete_all(&self) -> Result<()> {
        self.entries.write().unwrap().clear();
        Ok(())
    }

    fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let entries = self.entries.read().unwrap();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
