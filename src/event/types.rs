//! Event log record types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{EventId, Timestamp};

/// A persisted event in the SQL log.
///
/// `(stream_id, version)` is unique; versions are strictly monotonic
/// per stream, starting at 1 with no gaps.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Event identity.
    pub id: EventId,
    /// Stream this event belongs to.
    pub stream_id: String,
    /// Event type tag; projections dispatch on this.
    pub event_type: String,
    /// Position within the stream, starting at 1.
    pub version: u64,
    /// Append time; non-decreasing within a stream.
    pub timestamp: Timestamp,
    /// Event payload, round-tripped as JSON.
    pub data: Value,
    /// Optional metadata blob.
    pub metadata: Option<Value>,
}

/// Input for [`EventLog::append`](super::EventLog::append).
#[derive(Clone, Debug)]
pub struct NewEvent {
    /// Target stream.
    pub stream_id: String,
    /// Event type tag.
    pub event_type: String,
    /// Payload.
    pub data: Value,
    /// Optional metadata.
    pub metadata: Option<Value>,
    /// Optimistic concurrency check: append fails unless the stream's
    /// current version equals this.
    pub expected_version: Option<u64>,
}

impl NewEvent {
    /// Creates an append request with no metadata or version check.
    pub fn new(
        stream_id: impl Into<String>,
        event_type: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            event_type: event_type.into(),
            data,
            metadata: None,
            expected_version: None,
        }
    }

    /// Attaches metadata.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Requires the stream to be at `version` for the append to land.
    pub fn expecting_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

/// Read filters for [`EventLog::events`](super::EventLog::events).
///
/// Each `Some` field becomes a SQL predicate; `None` fields add
/// nothing to the query.
#[derive(Clone, Debug, Default)]
pub struct EventFilter {
    /// Only events with `version > after_version`.
    pub after_version: Option<u64>,
    /// Only events of this type.
    pub event_type: Option<String>,
    /// At most this many events.
    pub limit: Option<usize>,
}

/// A domain event in the KV log variant.
///
/// Stored under `events:<timestamp>:<id>` so lexicographic key order
/// equals timestamp order. No per-stream versioning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Event identity.
    pub id: EventId,
    /// Event type tag.
    pub event_type: String,
    /// Payload.
    pub data: Value,
    /// Append time.
    pub timestamp: Timestamp,
    /// Aggregate the event concerns, if any.
    pub aggregate_id: Option<String>,
    /// Optional metadata blob.
    pub metadata: Option<Value>,
}
