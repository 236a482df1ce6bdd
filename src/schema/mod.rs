//! Lazy schema manager.
//!
//! Brings the instance's SQL tables, indexes, and virtual tables into
//! existence exactly once per instance lifetime. Subsystems call
//! [`SchemaManager::ensure_initialized`] before their first SQL
//! statement; only the first call does work, and concurrent callers
//! observe exactly one initialization thanks to the instance gate.
//!
//! The constructor issues no SQL. A failed initialization leaves the
//! manager uninitialized so a later call can retry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::error::{Result, ValidationError};
use crate::gate::Gate;
use crate::storage::SqlStore;
use crate::types::Timestamp;

/// One column of a declared table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// SQL type (`TEXT`, `INTEGER`, `REAL`, `BLOB`).
    pub col_type: String,
    /// Part of the primary key.
    #[serde(default)]
    pub primary_key: bool,
    /// NOT NULL constraint.
    #[serde(default)]
    pub not_null: bool,
}

impl ColumnDef {
    /// Shorthand for a plain column.
    pub fn new(name: &str, col_type: &str) -> Self {
        Self {
            name: name.to_string(),
            col_type: col_type.to_string(),
            primary_key: false,
            not_null: false,
        }
    }

    /// Marks this column as (part of) the primary key.
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    /// Adds a NOT NULL constraint.
    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }
}

/// One declared table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    /// Table name, unique within the schema.
    pub name: String,
    /// Columns; at least one required.
    pub columns: Vec<ColumnDef>,
}

impl TableDef {
    /// Renders the `CREATE TABLE IF NOT EXISTS` statement.
    fn to_sql(&self) -> String {
        let pk_cols: Vec<&str> = self
            .columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect();
        let inline_pk = pk_cols.len() == 1;

        let mut parts: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                let mut part = format!("{} {}", c.name, c.col_type);
                if inline_pk && c.primary_key {
                    part.push_str(" PRIMARY KEY");
                }
                if c.not_null {
                    part.push_str(" NOT NULL");
                }
                part
            })
            .collect();
        if pk_cols.len() > 1 {
            parts.push(format!("PRIMARY KEY ({})", pk_cols.join(", ")));
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.name,
            parts.join(", ")
        )
    }
}

/// One declared index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    /// Index name.
    pub name: String,
    /// Indexed table.
    pub table: String,
    /// Indexed columns, in order.
    pub columns: Vec<String>,
    /// UNIQUE constraint.
    #[serde(default)]
    pub unique: bool,
}

impl IndexDef {
    fn to_sql(&self) -> String {
        format!(
            "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
            if self.unique { "UNIQUE " } else { "" },
            self.name,
            self.table,
            self.columns.join(", ")
        )
    }
}

/// The full declared schema.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDef {
    /// Schema version, starting at 1.
    pub version: u32,
    /// Plain tables.
    pub tables: Vec<TableDef>,
    /// Secondary indexes.
    pub indexes: Vec<IndexDef>,
    /// Complete `CREATE VIRTUAL TABLE` statements (FTS5 etc.).
    pub virtual_tables: Vec<String>,
}

impl SchemaDef {
    /// Validates the declaration.
    ///
    /// # Errors
    /// Rejects empty table names, empty column names, and tables with
    /// zero columns.
    pub fn validate(&self) -> Result<()> {
        if self.version == 0 {
            return Err(
                ValidationError::invalid_field("version", "must be at least 1").into(),
            );
        }
        for table in &self.tables {
            if table.name.is_empty() {
                return Err(ValidationError::required_field("table.name").into());
            }
            if table.columns.is_empty() {
                return Err(ValidationError::invalid_field(
                    "table.columns",
                    format!("table '{}' declares zero columns", table.name),
                )
                .into());
            }
            for column in &table.columns {
                if column.name.is_empty() {
                    return Err(ValidationError::invalid_field(
                        "column.name",
                        format!("table '{}' has an unnamed column", table.name),
                    )
                    .into());
                }
            }
        }
        Ok(())
    }
}

/// Exact FTS5 virtual-table declaration for the search subsystem.
pub const FTS_TABLE_SQL: &str = "CREATE VIRTUAL TABLE IF NOT EXISTS fts_search USING fts5(source_table, source_rowid UNINDEXED, text_content, ns UNINDEXED, type UNINDEXED, tokenize='porter unicode61')";

/// Builds the default instance schema.
///
/// Covers every SQL subsystem plus the reserved `documents` and
/// `schema_version` tables.
pub fn default_schema() -> SchemaDef {
    SchemaDef {
        version: 1,
        tables: vec![
            TableDef {
                name: "documents".to_string(),
                columns: vec![
                    ColumnDef::new("id", "TEXT").primary_key(),
                    ColumnDef::new("content", "TEXT"),
                    ColumnDef::new("created_at", "INTEGER").not_null(),
                ],
            },
            // Reserved for future migrations
            TableDef {
                name: "schema_version".to_string(),
                columns: vec![
                    ColumnDef::new("version", "INTEGER").primary_key(),
                    ColumnDef::new("applied_at", "INTEGER").not_null(),
                ],
            },
            TableDef {
                name: "events".to_string(),
                columns: vec![
                    ColumnDef::new("id", "TEXT").primary_key(),
                    ColumnDef::new("stream_id", "TEXT").not_null(),
                    ColumnDef::new("type", "TEXT").not_null(),
                    ColumnDef::new("data", "TEXT").not_null(),
                    ColumnDef::new("version", "INTEGER").not_null(),
                    ColumnDef::new("timestamp", "INTEGER").not_null(),
                    ColumnDef::new("metadata", "TEXT"),
                ],
            },
            TableDef {
                name: "things".to_string(),
                columns: vec![
                    ColumnDef::new("ns", "TEXT").primary_key().not_null(),
                    ColumnDef::new("type", "TEXT").primary_key().not_null(),
                    ColumnDef::new("id", "TEXT").primary_key().not_null(),
                    ColumnDef::new("url", "TEXT"),
                    ColumnDef::new("data", "TEXT").not_null(),
                    ColumnDef::new("context", "TEXT"),
                    ColumnDef::new("created_at", "INTEGER").not_null(),
                    ColumnDef::new("updated_at", "INTEGER").not_null(),
                ],
            },
            TableDef {
                name: "saga_transactions".to_string(),
                columns: vec![
                    ColumnDef::new("id", "TEXT").primary_key(),
                    ColumnDef::new("state", "TEXT").not_null(),
                    ColumnDef::new("created_at", "INTEGER").not_null(),
                    ColumnDef::new("updated_at", "INTEGER").not_null(),
                    ColumnDef::new("definition", "TEXT").not_null(),
                ],
            },
            TableDef {
                name: "saga_step_results".to_string(),
                columns: vec![
                    ColumnDef::new("transaction_id", "TEXT").primary_key().not_null(),
                    ColumnDef::new("step_id", "TEXT").primary_key().not_null(),
                    ColumnDef::new("is_compensation", "INTEGER").primary_key().not_null(),
                    ColumnDef::new("success", "INTEGER").not_null(),
                    ColumnDef::new("data", "TEXT"),
                    ColumnDef::new("error", "TEXT"),
                    ColumnDef::new("retry_count", "INTEGER").not_null(),
                    ColumnDef::new("started_at", "INTEGER").not_null(),
                    ColumnDef::new("completed_at", "INTEGER").not_null(),
                ],
            },
            TableDef {
                name: "saga_locks".to_string(),
                columns: vec![
                    ColumnDef::new("lock_id", "TEXT").primary_key(),
                    ColumnDef::new("resource", "TEXT").not_null(),
                    ColumnDef::new("owner", "TEXT").not_null(),
                    ColumnDef::new("mode", "TEXT").not_null(),
                    ColumnDef::new("acquired_at", "INTEGER").not_null(),
                    ColumnDef::new("expires_at", "INTEGER").not_null(),
                ],
            },
        ],
        indexes: vec![
            IndexDef {
                name: "idx_events_stream_version".to_string(),
                table: "events".to_string(),
                columns: vec!["stream_id".to_string(), "version".to_string()],
                unique: true,
            },
            IndexDef {
                name: "idx_things_ns_type".to_string(),
                table: "things".to_string(),
                columns: vec!["ns".to_string(), "type".to_string()],
                unique: false,
            },
            IndexDef {
                name: "idx_saga_locks_resource".to_string(),
                table: "saga_locks".to_string(),
                columns: vec!["resource".to_string()],
                unique: false,
            },
        ],
        virtual_tables: vec![FTS_TABLE_SQL.to_string()],
    }
}

/// Initialization statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SchemaStats {
    /// Successful initializations over the manager's lifetime
    /// (greater than 1 only after `reset`).
    pub initialization_count: u64,
    /// When the last successful initialization finished.
    pub last_init_at: Option<Timestamp>,
    /// Duration of the last successful initialization.
    pub last_init_duration_ms: u64,
}

/// Single-flight lazy schema initializer.
#[derive(Debug)]
pub struct SchemaManager {
    schema: SchemaDef,
    gate: Arc<Gate>,
    initialized: AtomicBool,
    stats: Mutex<SchemaStats>,
}

impl SchemaManager {
    /// Creates a manager over the given schema. Issues no SQL.
    pub fn new(schema: SchemaDef, gate: Arc<Gate>) -> Self {
        Self {
            schema,
            gate,
            initialized: AtomicBool::new(false),
            stats: Mutex::new(SchemaStats::default()),
        }
    }

    /// Creates a manager over [`default_schema`].
    pub fn with_default_schema(gate: Arc<Gate>) -> Self {
        Self::new(default_schema(), gate)
    }

    /// Whether initialization has completed. Pure, no I/O.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Runs initialization if it has not happened yet.
    ///
    /// Idempotent: later calls return immediately. The whole first pass
    /// runs inside the instance gate so concurrent callers observe
    /// exactly one initialization.
    ///
    /// # Errors
    /// `ValidationError` for a bad schema declaration, `StorageError`
    /// if a statement fails. Either way the manager stays
    /// uninitialized and may be retried.
    #[instrument(skip_all)]
    pub fn ensure_initialized(&self, sql: &SqlStore) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }
        self.gate.run(|| {
            // A racing caller may have finished while we waited
            if self.is_initialized() {
                return Ok(());
            }
            self.schema.validate()?;

            let started = Instant::now();
            for table in &self.schema.tables {
                debug!(table = %table.name, "Creating table");
                sql.execute_batch(&table.to_sql())?;
            }
            for index in &self.schema.indexes {
                sql.execute_batch(&index.to_sql())?;
            }
            for statement in &self.schema.virtual_tables {
                sql.execute_batch(statement)?;
            }

            let elapsed_ms = started.elapsed().as_millis() as u64;
            {
                let mut stats = self.stats.lock().unwrap();
                stats.initialization_count += 1;
                stats.last_init_at = Some(Timestamp::now());
                stats.last_init_duration_ms = elapsed_ms;
            }
            self.initialized.store(true, Ordering::Release);
            info!(
                version = self.schema.version,
                tables = self.schema.tables.len(),
                elapsed_ms,
                "Schema initialized"
            );
            Ok(())
        })
    }

    /// Ensures initialization, then returns the schema definition.
    ///
    /// The returned reference is the manager's own cached definition,
    /// so repeated calls return the same object.
    pub fn schema(&self, sql: &SqlStore) -> Result<&SchemaDef> {
        self.ensure_initialized(sql)?;
        Ok(&self.schema)
    }

    /// Returns the declared schema without touching storage.
    pub fn definition(&self) -> &SchemaDef {
        &self.schema
    }

    /// Clears the initialized flag so the next call re-runs
    /// initialization. Does not drop tables.
    pub fn reset(&self) {
        self.initialized.store(false, Ordering::Release);
    }

    /// Returns initialization statistics.
    pub fn stats(&self) -> SchemaStats {
        *self.stats.lock().unwrap()
    }
}
