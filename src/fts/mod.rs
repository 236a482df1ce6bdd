//! FTS5 full-text index.
//!
//! A single virtual table carries text for any source table:
//!
//! ```sql
//! CREATE VIRTUAL TABLE fts_search USING fts5(
//!     source_table, source_rowid UNINDEXED, text_content,
//!     ns UNINDEXED, type UNINDEXED, tokenize='porter unicode61')
//! ```
//!
//! FTS5 has no in-place update, so [`FtsIndex::update_text`] deletes
//! and re-inserts, reading the unindexed columns first so `ns`/`type`
//! survive the rewrite. Ranking uses BM25, which SQLite exposes as a
//! negative cost: lower `rank` means a better match, hence
//! `ORDER BY rank ASC`.

use std::sync::Arc;

use rusqlite::params;
use tracing::debug;

use crate::error::Result;
use crate::schema::SchemaManager;
use crate::storage::SqlStore;

/// Input for [`FtsIndex::index_text`].
#[derive(Clone, Debug)]
pub struct TextEntry {
    /// Source table the text belongs to.
    pub source_table: String,
    /// Row within the source table.
    pub source_rowid: i64,
    /// Text to index.
    pub text_content: String,
    /// Namespace tag (defaults to `default`).
    pub ns: String,
    /// Optional type tag.
    pub kind: Option<String>,
}

impl TextEntry {
    /// Creates an entry in the default namespace with no type.
    pub fn new(
        source_table: impl Into<String>,
        source_rowid: i64,
        text_content: impl Into<String>,
    ) -> Self {
        Self {
            source_table: source_table.into(),
            source_rowid,
            text_content: text_content.into(),
            ns: "default".to_string(),
            kind: None,
        }
    }
}

/// Filters for [`FtsIndex::search`].
#[derive(Clone, Debug, Default)]
pub struct FtsFilter {
    /// Only entries in this namespace.
    pub ns: Option<String>,
    /// Only entries of this type.
    pub kind: Option<String>,
    /// Only entries from this source table.
    pub source_table: Option<String>,
    /// At most this many hits.
    pub limit: Option<usize>,
}

/// One full-text hit.
#[derive(Clone, Debug, PartialEq)]
pub struct FtsHit {
    /// Source table of the match.
    pub source_table: String,
    /// Row within the source table.
    pub source_rowid: i64,
    /// Indexed text.
    pub text_content: String,
    /// Namespace tag.
    pub ns: String,
    /// Type tag.
    pub kind: Option<String>,
    /// BM25 rank; lower is better.
    pub rank: f64,
}

/// Repository over the `fts_search` virtual table.
pub struct FtsIndex {
    sql: Arc<SqlStore>,
    schema: Arc<SchemaManager>,
}

impl std::fmt::Debug for FtsIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtsIndex").finish_non_exhaustive()
    }
}

impl FtsIndex {
    /// Creates an index over the instance's SQL store.
    pub fn new(sql: Arc<SqlStore>, schema: Arc<SchemaManager>) -> Self {
        Self { sql, schema }
    }

    /// Indexes one text entry.
    pub fn index_text(&self, entry: &TextEntry) -> Result<()> {
        self.schema.ensure_initialized(&self.sql)?;
        self.sql.execute(
            "INSERT INTO fts_search (source_table, source_rowid, text_content, ns, type) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.source_table,
                entry.source_rowid,
                entry.text_content,
                entry.ns,
                entry.kind,
            ],
        )?;
        debug!(source = %entry.source_table, rowid = entry.source_rowid, "Text indexed");
        Ok(())
    }

    /// Replaces the text for `(source_table, source_rowid)`.
    ///
    /// Reads the unindexed columns before the delete so the new row
    /// keeps the original `ns`/`type`. Returns `false` when no entry
    /// exists.
    pub fn update_text(
        &self,
        source_table: &str,
        source_rowid: i64,
        new_text: &str,
    ) -> Result<bool> {
        self.schema.ensure_initialized(&self.sql)?;

        let existing: Option<(String, Option<String>)> = self.sql.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT ns, type FROM fts_search WHERE source_table = ?1 AND source_rowid = ?2",
            )?;
            let mut rows = stmt.query(params![source_table, source_rowid])?;
            match rows.next()? {
                Some(row) => Ok(Some((row.get(0)?, row.get(1)?))),
                None => Ok(None),
            }
        })?;
        let Some((ns, kind)) = existing else {
            return Ok(false);
        };

        // FTS5 update pattern: delete, then insert
        self.sql.execute(
            "DELETE FROM fts_search WHERE source_table = ?1 AND source_rowid = ?2",
            params![source_table, source_rowid],
        )?;
        self.sql.execute(
            "INSERT INTO fts_search (source_table, source_rowid, text_content, ns, type) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![source_table, source_rowid, new_text, ns, kind],
        )?;
        Ok(true)
    }

    /// Removes the entry for `(source_table, source_rowid)`.
    /// Returns `false` when nothing was indexed there.
    pub fn delete_text(&self, source_table: &str, source_rowid: i64) -> Result<bool> {
        self.schema.ensure_initialized(&self.sql)?;
        let deleted = self.sql.execute(
            "DELETE FROM fts_search WHERE source_table = ?1 AND source_rowid = ?2",
            params![source_table, source_rowid],
        )?;
        Ok(deleted > 0)
    }

    /// Runs an FTS5 match query, best hits first.
    ///
    /// An empty query returns `[]` without touching SQL. The query
    /// string uses FTS5 match syntax.
    pub fn search(&self, query: &str, filter: &FtsFilter) -> Result<Vec<FtsHit>> {
        if query.is_empty() {
            return Ok(Vec::new());
        }
        self.schema.ensure_initialized(&self.sql)?;

        let mut sql = String::from(
            "SELECT source_table, source_rowid, text_content, ns, type, rank \
             FROM fts_search WHERE fts_search MATCH ?1",
        );
        let mut bindings: Vec<rusqlite::types::Value> =
            vec![rusqlite::types::Value::Text(query.to_string())];
        if let Some(ns) = &filter.ns {
            bindings.push(rusqlite::types::Value::Text(ns.clone()));
            sql.push_str(&format!(" AND ns = ?{}", bindings.len()));
        }
        if let Some(kind) = &filter.kind {
            bindings.push(rusqlite::types::Value::Text(kind.clone()));
            sql.push_str(&format!(" AND type = ?{}", bindings.len()));
        }
        if let Some(source_table) = &filter.source_table {
            bindings.push(rusqlite::types::Value::Text(source_table.clone()));
            sql.push_str(&format!(" AND source_table = ?{}", bindings.len()));
        }
        // BM25 is a negative cost: ascending rank = most relevant first
        sql.push_str(" ORDER BY rank ASC");
        if let Some(limit) = filter.limit {
            bindings.push(rusqlite::types::Value::Integer(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", bindings.len()));
        }

        self.sql.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let hits = stmt
                .query_map(rusqlite::params_from_iter(bindings), |row| {
                    Ok(FtsHit {
                        source_table: row.get(0)?,
                        source_rowid: row.get(1)?,
                        text_content: row.get(2)?,
                        ns: row.get(3)?,
                        kind: row.get(4)?,
                        rank: row.get(5)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(hits)
        })
    }
}
