//! Things: a namespaced row store keyed by `(ns, type, id)`.
//!
//! Each mutation emits `thing:{created,updated,deleted}` through the
//! instance pub/sub so projections, cascades, and sockets can react.
//! `update` merges top-level JSON keys into the stored document and
//! touches `updated_at`; fields absent from the patch survive.

mod types;

pub use types::{ListOptions, NewThing, SortOrder, Thing, ThingOrder};

use std::sync::Arc;

use rusqlite::params;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::error::Result;
use crate::pubsub::PubSub;
use crate::schema::SchemaManager;
use crate::storage::SqlStore;
use crate::types::Timestamp;

use types::merge_data;

/// SQL-backed thing repository.
pub struct ThingStore {
    sql: Arc<SqlStore>,
    schema: Arc<SchemaManager>,
    bus: Arc<PubSub>,
}

impl std::fmt::Debug for ThingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThingStore").finish_non_exhaustive()
    }
}

impl ThingStore {
    /// Creates a store over the instance's SQL store and bus.
    pub fn new(sql: Arc<SqlStore>, schema: Arc<SchemaManager>, bus: Arc<PubSub>) -> Self {
        Self { sql, schema, bus }
    }

    /// Creates a thing. Emits `thing:created`.
    #[instrument(skip_all, fields(ns = %input.ns, kind = %input.kind, id = %input.id))]
    pub fn create(&self, input: NewThing) -> Result<Thing> {
        self.schema.ensure_initialized(&self.sql)?;
        let now = Timestamp::now();
        let thing = Thing {
            ns: input.ns,
            kind: input.kind,
            id: input.id,
            url: input.url,
            data: input.data,
            context: input.context,
            created_at: now,
            updated_at: now,
        };
        self.sql.execute(
            "INSERT INTO things (ns, type, id, url, data, context, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                thing.ns,
                thing.kind,
                thing.id,
                thing.url,
                serde_json::to_string(&thing.data)?,
                thing.context,
                thing.created_at.as_millis(),
                thing.updated_at.as_millis(),
            ],
        )?;
        debug!("Thing created");
        self.bus
            .emit("thing:created", &serde_json::to_value(&thing)?);
        Ok(thing)
    }

    /// Reads a thing by key.
    pub fn get(&self, ns: &str, kind: &str, id: &str) -> Result<Option<Thing>> {
        self.schema.ensure_initialized(&self.sql)?;
        self.sql.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT ns, type, id, url, data, context, created_at, updated_at \
                 FROM things WHERE ns = ?1 AND type = ?2 AND id = ?3",
            )?;
            let mut rows = stmt.query(params![ns, kind, id])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_thing(row)?)),
                None => Ok(None),
            }
        })
    }

    /// Merges `patch` into a thing's data and touches `updated_at`.
    /// Emits `thing:updated`. Returns `None` if the thing is missing.
    pub fn update(&self, ns: &str, kind: &str, id: &str, patch: &Value) -> Result<Option<Thing>> {
        let Some(mut thing) = self.get(ns, kind, id)? else {
            return Ok(None);
        };
        thing.data = merge_data(thing.data, patch);
        thing.updated_at = Timestamp::from_millis(
            Timestamp::now()
                .as_millis()
                .max(thing.created_at.as_millis()),
        );

        self.sql.execute(
            "UPDATE things SET data = ?1, updated_at = ?2 WHERE ns = ?3 AND type = ?4 AND id = ?5",
            params![
                serde_json::to_string(&thing.data)?,
                thing.updated_at.as_millis(),
                ns,
                kind,
                id,
            ],
        )?;
        self.bus
            .emit("thing:updated", &serde_json::to_value(&thing)?);
        Ok(Some(thing))
    }

    /// Deletes a thing. Emits `thing:deleted`. Returns `false` when it
    /// did not exist.
    pub fn delete(&self, ns: &str, kind: &str, id: &str) -> Result<bool> {
        self.schema.ensure_initialized(&self.sql)?;
        let deleted = self.sql.execute(
            "DELETE FROM things WHERE ns = ?1 AND type = ?2 AND id = ?3",
            params![ns, kind, id],
        )?;
        if deleted > 0 {
            self.bus.emit(
                "thing:deleted",
                &serde_json::json!({ "ns": ns, "type": kind, "id": id }),
            );
        }
        Ok(deleted > 0)
    }

    /// Lists things with optional filters, whitelisted ordering, and
    /// paging.
    pub fn list(&self, opts: &ListOptions) -> Result<Vec<Thing>> {
        self.schema.ensure_initialized(&self.sql)?;

        let mut sql = String::from(
            "SELECT ns, type, id, url, data, context, created_at, updated_at FROM things WHERE 1=1",
        );
        let mut bindings: Vec<rusqlite::types::Value> = Vec::new();
        if let Some(ns) = &opts.ns {
            bindings.push(rusqlite::types::Value::Text(ns.clone()));
            sql.push_str(&format!(" AND ns = ?{}", bindings.len()));
        }
        if let Some(kind) = &opts.kind {
            bindings.push(rusqlite::types::Value::Text(kind.clone()));
            sql.push_str(&format!(" AND type = ?{}", bindings.len()));
        }
        // Column and direction come from closed enums, never the caller
        sql.push_str(&format!(
            " ORDER BY {} {}",
            opts.order_by.column(),
            opts.order.keyword()
        ));
        if let Some(limit) = opts.limit {
            bindings.push(rusqlite::types::Value::Integer(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", bindings.len()));
            if let Some(offset) = opts.offset {
                bindings.push(rusqlite::types::Value::Integer(offset as i64));
                sql.push_str(&format!(" OFFSET ?{}", bindings.len()));
            }
        }

        self.sql.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let things = stmt
                .query_map(rusqlite::params_from_iter(bindings), |row| {
                    row_to_thing(row)
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(things)
        })
    }

    /// Substring search over the JSON document (LIKE fallback for
    /// deployments not using the FTS index).
    pub fn search(
        &self,
        query: &str,
        ns: Option<&str>,
        kind: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<Thing>> {
        self.schema.ensure_initialized(&self.sql)?;
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let mut sql = String::from(
            "SELECT ns, type, id, url, data, context, created_at, updated_at \
             FROM things WHERE data LIKE ?1",
        );
        let mut bindings: Vec<rusqlite::types::Value> =
            vec![rusqlite::types::Value::Text(format!("%{}%", query))];
        if let Some(ns) = ns {
            bindings.push(rusqlite::types::Value::Text(ns.to_string()));
            sql.push_str(&format!(" AND ns = ?{}", bindings.len()));
        }
        if let Some(kind) = kind {
            bindings.push(rusqlite::types::Value::Text(kind.to_string()));
            sql.push_str(&format!(" AND type = ?{}", bindings.len()));
        }
        sql.push_str(" ORDER BY updated_at DESC");
        if let Some(limit) = limit {
            bindings.push(rusqlite::types::Value::Integer(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", bindings.len()));
        }

        self.sql.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let things = stmt
                .query_map(rusqlite::params_from_iter(bindings), |row| {
                    row_to_thing(row)
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(things)
        })
    }
}

fn row_to_thing(row: &rusqlite::Row<'_>) -> rusqlite::Result<Thing> {
    let data: String = row.get(4)?;
    Ok(Thing {
        ns: row.get(0)?,
        kind: row.get(1)?,
        id: row.get(2)?,
        url: row.get(3)?,
        data: serde_json::from_str(&data).unwrap_or(Value::Null),
        context: row.get(5)?,
        created_at: Timestamp::from_millis(row.get(6)?),
        updated_at: Timestamp::from_millis(row.get(7)?),
    })
}
