//! Append-only event log with per-stream versioning.
//!
//! Two flavors share the record shapes in [`types`]:
//!
//! - [`EventLog`]: the SQL log. Versions are strictly monotonic per
//!   stream and appends support optimistic concurrency via
//!   `expected_version`.
//! - [`KvEventLog`]: a KV-only variant for deployments without the
//!   relational engine. Ordering comes from `events:<timestamp>:<id>`
//!   key encoding; there is no version check.
//!
//! Appends optionally dual-write to an external [`EventSink`]. The
//! emit is best-effort: a sink failure is logged and never fails or
//! undoes the local write.

mod types;

pub use types::{DomainEvent, EventFilter, NewEvent, StoredEvent};

use std::sync::{Arc, RwLock};

use rusqlite::params;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::error::{Result, VersionConflictError};
use crate::gate::Gate;
use crate::schema::SchemaManager;
use crate::storage::{KvStore, SqlStore};
use crate::types::{key_segment, EventId, Timestamp};

/// External stream sink for the dual write.
///
/// Implementations forward events to an external pipeline. They may
/// fail freely; the log only logs the failure.
pub trait EventSink: Send + Sync {
    /// Forwards one appended event.
    fn emit(&self, event: &StoredEvent) -> Result<()>;
}

/// Sink that does nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &StoredEvent) -> Result<()> {
        Ok(())
    }
}

/// SQL-backed event log.
pub struct EventLog {
    sql: Arc<SqlStore>,
    schema: Arc<SchemaManager>,
    gate: Arc<Gate>,
    sink: RwLock<Option<Arc<dyn EventSink>>>,
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog").finish_non_exhaustive()
    }
}

impl EventLog {
    /// Creates a log over the instance's SQL store.
    pub fn new(sql: Arc<SqlStore>, schema: Arc<SchemaManager>, gate: Arc<Gate>) -> Self {
        Self {
            sql,
            schema,
            gate,
            sink: RwLock::new(None),
        }
    }

    /// Installs the external dual-write sink.
    pub fn set_sink(&self, sink: Arc<dyn EventSink>) {
        *self.sink.write().unwrap() = Some(sink);
    }

    /// Appends an event to its stream.
    ///
    /// The `MAX(version)` read and the insert run inside the instance
    /// gate so the version sequence has no gaps. After the row is
    /// durable the sink (if any) is invoked; its failure is logged and
    /// ignored.
    ///
    /// # Errors
    /// [`VersionConflictError`] when `expected_version` is set and the
    /// stream has moved past it.
    #[instrument(skip_all, fields(stream_id = %new.stream_id, event_type = %new.event_type))]
    pub fn append(&self, new: NewEvent) -> Result<StoredEvent> {
        self.schema.ensure_initialized(&self.sql)?;

        let event = self.gate.run(|| -> Result<StoredEvent> {
            let (current_version, last_timestamp): (u64, i64) = self.sql.with_conn(|conn| {
                conn.query_row(
                    "SELECT COALESCE(MAX(version), 0), COALESCE(MAX(timestamp), 0) \
                     FROM events WHERE stream_id = ?1",
                    params![new.stream_id],
                    |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)?)),
                )
            })?;

            if let Some(expected) = new.expected_version {
                if expected != current_version {
                    return Err(VersionConflictError {
                        stream_id: new.stream_id.clone(),
                        expected_version: expected,
                        actual_version: current_version,
                    }
                    .into());
                }
            }

            let event = StoredEvent {
                id: EventId::new(),
                stream_id: new.stream_id.clone(),
                event_type: new.event_type.clone(),
                version: current_version + 1,
                // Clamp so timestamps never regress within a stream
                timestamp: Timestamp::from_millis(Timestamp::now().as_millis().max(last_timestamp)),
                data: new.data.clone(),
                metadata: new.metadata.clone(),
            };

            let metadata_json = match &event.metadata {
                Some(value) => Some(serde_json::to_string(value)?),
                None => None,
            };
            self.sql.execute(
                "INSERT INTO events (id, stream_id, type, data, version, timestamp, metadata) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    event.id.to_string(),
                    event.stream_id,
                    event.event_type,
                    serde_json::to_string(&event.data)?,
                    event.version as i64,
                    event.timestamp.as_millis(),
                    metadata_json,
                ],
            )?;
            debug!(version = event.version, "Event appended");
            Ok(event)
        })?;

        // Best-effort dual write, after local persistence
        let sink = self.sink.read().unwrap().clone();
        if let Some(sink) = sink {
            if let Err(err) = sink.emit(&event) {
                warn!(error = %err, "External emit failed; event remains persisted");
            }
        }

        Ok(event)
    }

    /// Reads a stream's events in ascending version order.
    ///
    /// Filter fields become SQL predicates only when present.
    pub fn events(&self, stream_id: &str, filter: &EventFilter) -> Result<Vec<StoredEvent>> {
        self.schema.ensure_initialized(&self.sql)?;

        let mut sql = String::from(
            "SELECT id, stream_id, type, data, version, timestamp, metadata \
             FROM events WHERE stream_id = ?1",
        );
        let mut bindings: Vec<rusqlite::types::Value> =
            vec![rusqlite::types::Value::Text(stream_id.to_string())];

        if let Some(after) = filter.after_version {
            bindings.push(rusqlite::types::Value::Integer(after as i64));
            sql.push_str(&format!(" AND version > ?{}", bindings.len()));
        }
        if let Some(event_type) = &filter.event_type {
            bindings.push(rusqlite::types::Value::Text(event_type.clone()));
            sql.push_str(&format!(" AND type = ?{}", bindings.len()));
        }
        sql.push_str(" ORDER BY version ASC");
        if let Some(limit) = filter.limit {
            bindings.push(rusqlite::types::Value::Integer(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", bindings.len()));
        }

        self.sql.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let events = stmt
                .query_map(rusqlite::params_from_iter(bindings), row_to_event)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(events)
        })
    }

    /// Returns the stream's current version, 0 for an empty stream.
    pub fn latest_version(&self, stream_id: &str) -> Result<u64> {
        self.schema.ensure_initialized(&self.sql)?;
        let version: i64 = self.sql.with_conn(|conn| {
            conn.query_row(
                "SELECT COALESCE(MAX(version), 0) FROM events WHERE stream_id = ?1",
                params![stream_id],
                |row| row.get(0),
            )
        })?;
        Ok(version as u64)
    }

    /// Deletes a stream's events. Test/admin use only.
    pub fn clear_stream(&self, stream_id: &str) -> Result<usize> {
        self.schema.ensure_initialized(&self.sql)?;
        self.sql
            .execute("DELETE FROM events WHERE stream_id = ?1", params![stream_id])
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredEvent> {
    let id: String = row.get(0)?;
    let data: String = row.get(3)?;
    let metadata: Option<String> = row.get(6)?;
    Ok(StoredEvent {
        id: uuid::Uuid::parse_str(&id).map(EventId).unwrap_or_default(),
        stream_id: row.get(1)?,
        event_type: row.get(2)?,
        version: row.get::<_, i64>(4)? as u64,
        timestamp: Timestamp::from_millis(row.get(5)?),
        data: serde_json::from_str(&data).unwrap_or(Value::Null),
        metadata: metadata.and_then(|raw| serde_json::from_str(&raw).ok()),
    })
}

/// KV-backed domain event log.
///
/// Keys are `events:<zero-padded timestamp>:<id>`, so a prefix scan
/// yields timestamp order.
pub struct KvEventLog {
    kv: Arc<dyn KvStore>,
}

/// Persisted shape of a domain event. JSON payloads ride along as
/// strings inside the bincode record; bincode cannot revive a bare
/// `serde_json::Value`.
#[derive(serde::Serialize, serde::Deserialize)]
struct DomainEventRecord {
    id: EventId,
    event_type: String,
    data_json: String,
    timestamp: Timestamp,
    aggregate_id: Option<String>,
    metadata_json: Option<String>,
}

fn encode_domain_event(event: &DomainEvent) -> Result<Vec<u8>> {
    let record = DomainEventRecord {
        id: event.id,
        event_type: event.event_type.clone(),
        data_json: serde_json::to_string(&event.data)?,
        timestamp: event.timestamp,
        aggregate_id: event.aggregate_id.clone(),
        metadata_json: match &event.metadata {
            Some(value) => Some(serde_json::to_string(value)?),
            None => None,
        },
    };
    Ok(bincode::serialize(&record).map_err(crate::error::StorageError::from)?)
}

fn decode_domain_event(raw: &[u8]) -> Result<DomainEvent> {
    let record: DomainEventRecord =
        bincode::deserialize(raw).map_err(crate::error::StorageError::from)?;
    Ok(DomainEvent {
        id: record.id,
        event_type: record.event_type,
        data: serde_json::from_str(&record.data_json)?,
        timestamp: record.timestamp,
        aggregate_id: record.aggregate_id,
        metadata: match record.metadata_json {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        },
    })
}

impl std::fmt::Debug for KvEventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvEventLog").finish_non_exhaustive()
    }
}

impl KvEventLog {
    const PREFIX: &'static str = "events:";

    /// Creates a log over the instance's KV store.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Appends a domain event, assigning id and timestamp.
    pub fn append(
        &self,
        event_type: impl Into<String>,
        data: Value,
        aggregate_id: Option<String>,
        metadata: Option<Value>,
    ) -> Result<DomainEvent> {
        let event = DomainEvent {
            id: EventId::new(),
            event_type: event_type.into(),
            data,
            timestamp: Timestamp::now(),
            aggregate_id,
            metadata,
        };
        let key = format!(
            "{}{}:{}",
            Self::PREFIX,
            key_segment(event.timestamp.as_millis()),
            event.id
        );
        self.kv.put(&key, &encode_domain_event(&event)?)?;
        Ok(event)
    }

    /// Lists events in timestamp order, optionally capped.
    pub fn list(&self, limit: Option<usize>) -> Result<Vec<DomainEvent>> {
        let entries = self.kv.list_prefix(Self::PREFIX)?;
        let mut events = Vec::with_capacity(entries.len());
        for (_, raw) in entries {
            events.push(decode_domain_event(&raw)?);
            if limit.is_some_and(|cap| events.len() >= cap) {
                break;
            }
        }
        Ok(events)
    }

    /// Deletes every domain event. Test/admin use only.
    pub fn clear(&self) -> Result<usize> {
        let entries = self.kv.list_prefix(Self::PREFIX)?;
        let count = entries.len();
        for (key, _) in entries {
            self.kv.delete(&key)?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKv;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn log() -> EventLog {
        let gate = Arc::new(Gate::new());
        let sql = Arc::new(SqlStore::open_in_memory().unwrap());
        let schema = Arc::new(SchemaManager::with_default_schema(Arc::clone(&gate)));
        EventLog::new(sql, schema, gate)
    }

    fn append_n(log: &EventLog, stream: &str, n: usize) {
        for i in 0..n {
            log.append(NewEvent::new(
                stream,
                format!("type-{}", i),
                serde_json::json!({ "i": i }),
            ))
            .unwrap();
        }
    }

    #[test]
    fn test_versions_start_at_one_and_increment() {
        let log = log();
        let e1 = log
            .append(NewEvent::new("s", "a", Value::Null))
            .unwrap();
        let e2 = log
            .append(NewEvent::new("s", "b", Value::Null))
            .unwrap();
        assert_eq!(e1.version, 1);
        assert_eq!(e2.version, 2);
        assert_eq!(log.latest_version("s").unwrap(), 2);
    }

    #[test]
    fn test_streams_version_independently() {
        let log = log();
        append_n(&log, "s1", 3);
        append_n(&log, "s2", 1);
        assert_eq!(log.latest_version("s1").unwrap(), 3);
        assert_eq!(log.latest_version("s2").unwrap(), 1);
        assert_eq!(log.latest_version("empty").unwrap(), 0);
    }

    #[test]
    fn test_expected_version_conflict() {
        let log = log();
        append_n(&log, "s1", 2);

        let err = log
            .append(
                NewEvent::new("s1", "x", serde_json::json!({})).expecting_version(1),
            )
            .unwrap_err();
        match err {
            crate::error::CellStoreError::Conflict(conflict) => {
                assert_eq!(conflict.stream_id, "s1");
                assert_eq!(conflict.expected_version, 1);
                assert_eq!(conflict.actual_version, 2);
            }
            other => panic!("expected conflict, got {other}"),
        }
        // Nothing was written
        assert_eq!(log.latest_version("s1").unwrap(), 2);
    }

    #[test]
    fn test_expected_version_match_appends() {
        let log = log();
        append_n(&log, "s1", 2);
        let event = log
            .append(NewEvent::new("s1", "x", Value::Null).expecting_version(2))
            .unwrap();
        assert_eq!(event.version, 3);
    }

    #[test]
    fn test_expected_version_zero_on_fresh_stream() {
        let log = log();
        let event = log
            .append(NewEvent::new("fresh", "x", Value::Null).expecting_version(0))
            .unwrap();
        assert_eq!(event.version, 1);
    }

    #[test]
    fn test_events_ascending_with_filters() {
        let log = log();
        append_n(&log, "s", 5);

        let all = log.events("s", &EventFilter::default()).unwrap();
        assert_eq!(all.len(), 5);
        assert!(all.windows(2).all(|w| w[0].version < w[1].version));

        let after = log
            .events(
                "s",
                &EventFilter {
                    after_version: Some(3),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(after.len(), 2);
        assert_eq!(after[0].version, 4);

        let typed = log
            .events(
                "s",
                &EventFilter {
                    event_type: Some("type-2".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(typed.len(), 1);
        assert_eq!(typed[0].version, 3);

        let limited = log
            .events(
                "s",
                &EventFilter {
                    limit: Some(2),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[1].version, 2);
    }

    #[test]
    fn test_data_and_metadata_roundtrip() {
        let log = log();
        let appended = log
            .append(
                NewEvent::new("s", "t", serde_json::json!({ "nested": { "k": [1, 2, 3] } }))
                    .with_metadata(serde_json::json!({ "trace": "abc" })),
            )
            .unwrap();
        let read = log.events("s", &EventFilter::default()).unwrap();
        assert_eq!(read[0], appended);
    }

    #[test]
    fn test_timestamps_non_decreasing() {
        let log = log();
        append_n(&log, "s", 10);
        let events = log.events("s", &EventFilter::default()).unwrap();
        assert!(events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn test_sink_failure_does_not_fail_append() {
        struct FailingSink;
        impl EventSink for FailingSink {
            fn emit(&self, _event: &StoredEvent) -> Result<()> {
                Err(crate::error::StorageError::transaction("sink down"))?
            }
        }

        let log = log();
        log.set_sink(Arc::new(FailingSink));
        let event = log.append(NewEvent::new("s", "t", Value::Null)).unwrap();
        assert_eq!(event.version, 1);
        assert_eq!(log.latest_version("s").unwrap(), 1);
    }

    #[test]
    fn test_sink_receives_persisted_event() {
        struct CountingSink(AtomicU32);
        impl EventSink for CountingSink {
            fn emit(&self, event: &StoredEvent) -> Result<()> {
                assert!(event.version >= 1);
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let log = log();
        let sink = Arc::new(CountingSink(AtomicU32::new(0)));
        log.set_sink(Arc::clone(&sink) as Arc<dyn EventSink>);
        append_n(&log, "s", 3);
        assert_eq!(sink.0.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_clear_stream() {
        let log = log();
        append_n(&log, "s", 3);
        assert_eq!(log.clear_stream("s").unwrap(), 3);
        assert_eq!(log.latest_version("s").unwrap(), 0);
    }

    #[test]
    fn test_kv_log_orders_by_timestamp() {
        let kv_log = KvEventLog::new(Arc::new(MemoryKv::new()));
        for i in 0..3 {
            kv_log
                .append("tick", serde_json::json!({ "i": i }), None, None)
                .unwrap();
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        let events = kv_log.list(None).unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(events[0].data["i"], 0);
    }

    #[test]
    fn test_kv_log_limit_and_clear() {
        let kv_log = KvEventLog::new(Arc::new(MemoryKv::new()));
        for _ in 0..5 {
            kv_log.append("tick", Value::Null, None, None).unwrap();
        }
        assert_eq!(kv_log.list(Some(2)).unwrap().len(), 2);
        assert_eq!(kv_log.clear().unwrap(), 5);
        assert!(kv_log.list(None).unwrap().is_empty());
    }

    #[test]
    fn test_kv_log_aggregate_and_metadata() {
        let kv_log = KvEventLog::new(Arc::new(MemoryKv::new()));
        let event = kv_log
            .append(
                "user:signup",
                serde_json::json!({ "email": "a@b.c" }),
                Some("user-1".to_string()),
                Some(serde_json::json!({ "ip": "127.0.0.1" })),
            )
            .unwrap();
        let listed = kv_log.list(None).unwrap();
        assert_eq!(listed[0], event);
        assert_eq!(listed[0].aggregate_id.as_deref(), Some("user-1"));
    }
}
