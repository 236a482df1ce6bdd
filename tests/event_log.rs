//! Integration tests for the event log.
//!
//! Tests the full stack: Instance facade -> lazy schema -> SQLite.
//! Covers monotonic versioning, optimistic concurrency, filtered
//! reads, the KV log variant, and the best-effort dual write.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use cellstore::{
    CellStoreError, Config, EventFilter, EventSink, Instance, NewEvent, Result, StoredEvent,
};
use tempfile::tempdir;

fn open_instance() -> (Instance, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let instance = Instance::open(dir.path(), Config::default()).unwrap();
    (instance, dir)
}

// ============================================================================
// Versioning
// ============================================================================

#[test]
fn test_append_three_events_reaches_version_three() {
    let (instance, _dir) = open_instance();

    for event_type in ["a", "b", "c"] {
        instance
            .events()
            .append(NewEvent::new("order-1", event_type, serde_json::json!({})))
            .unwrap();
    }

    assert_eq!(instance.events().latest_version("order-1").unwrap(), 3);

    let events = instance
        .events()
        .events("order-1", &EventFilter::default())
        .unwrap();
    assert_eq!(events.len(), 3);
    assert_eq!(
        events.iter().map(|e| e.version).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    // No gaps, types in append order
    assert_eq!(
        events.iter().map(|e| e.event_type.as_str()).collect::<Vec<_>>(),
        vec!["a", "b", "c"]
    );
}

#[test]
fn test_appended_version_always_equals_latest() {
    let (instance, _dir) = open_instance();
    for i in 0..10 {
        let event = instance
            .events()
            .append(NewEvent::new("s", "tick", serde_json::json!({ "i": i })))
            .unwrap();
        assert_eq!(event.version, instance.events().latest_version("s").unwrap());
    }
}

// ============================================================================
// Optimistic concurrency
// ============================================================================

#[test]
fn test_version_conflict_carries_both_versions() {
    let (instance, _dir) = open_instance();
    instance
        .events()
        .append(NewEvent::new("s1", "a", serde_json::json!({})))
        .unwrap();
    instance
        .events()
        .append(NewEvent::new("s1", "b", serde_json::json!({})))
        .unwrap();

    let err = instance
        .events()
        .append(NewEvent::new("s1", "x", serde_json::json!({})).expecting_version(1))
        .unwrap_err();

    match err {
        CellStoreError::Conflict(conflict) => {
            assert_eq!(conflict.stream_id, "s1");
            assert_eq!(conflict.expected_version, 1);
            assert_eq!(conflict.actual_version, 2);
        }
        other => panic!("expected VersionConflictError, got {other}"),
    }

    // The failed append left nothing behind
    assert_eq!(instance.events().latest_version("s1").unwrap(), 2);
}

#[test]
fn test_matching_expected_version_appends() {
    let (instance, _dir) = open_instance();
    instance
        .events()
        .append(NewEvent::new("s1", "a", serde_json::json!({})))
        .unwrap();

    let event = instance
        .events()
        .append(NewEvent::new("s1", "b", serde_json::json!({})).expecting_version(1))
        .unwrap();
    assert_eq!(event.version, 2);
}

// ============================================================================
// Filtered reads
// ============================================================================

#[test]
fn test_filters_compose() {
    let (instance, _dir) = open_instance();
    for i in 0..6 {
        let event_type = if i % 2 == 0 { "even" } else { "odd" };
        instance
            .events()
            .append(NewEvent::new("s", event_type, serde_json::json!({ "i": i })))
            .unwrap();
    }

    let filtered = instance
        .events()
        .events(
            "s",
            &EventFilter {
                after_version: Some(2),
                event_type: Some("even".to_string()),
                limit: Some(1),
            },
        )
        .unwrap();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].version, 3);
    assert_eq!(filtered[0].event_type, "even");
}

// ============================================================================
// Dual write
// ============================================================================

#[test]
fn test_failing_sink_never_fails_appends() {
    struct DownSink;
    impl EventSink for DownSink {
        fn emit(&self, _event: &StoredEvent) -> Result<()> {
            Err(cellstore::StorageError::transaction("stream sink offline"))?
        }
    }

    let (instance, _dir) = open_instance();
    instance.events().set_sink(Arc::new(DownSink));

    for i in 0..3 {
        let event = instance
            .events()
            .append(NewEvent::new("s", "t", serde_json::json!({ "i": i })))
            .unwrap();
        assert_eq!(event.version, i + 1);
    }
    assert_eq!(instance.events().latest_version("s").unwrap(), 3);
}

#[test]
fn test_sink_invoked_after_local_write() {
    struct VerifyingSink {
        seen: AtomicU32,
    }
    impl EventSink for VerifyingSink {
        fn emit(&self, event: &StoredEvent) -> Result<()> {
            assert!(!event.stream_id.is_empty());
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let (instance, _dir) = open_instance();
    let sink = Arc::new(VerifyingSink {
        seen: AtomicU32::new(0),
    });
    instance.events().set_sink(sink.clone());

    instance
        .events()
        .append(NewEvent::new("s", "t", serde_json::json!({})))
        .unwrap();
    assert_eq!(sink.seen.load(Ordering::SeqCst), 1);
}

// ============================================================================
// KV variant
// ============================================================================

#[test]
fn test_kv_events_keep_timestamp_order() {
    let (instance, _dir) = open_instance();
    for i in 0..4 {
        instance
            .kv_events()
            .append("audit", serde_json::json!({ "seq": i }), None, None)
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
    }

    let events = instance.kv_events().list(None).unwrap();
    assert_eq!(events.len(), 4);
    assert!(events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    assert_eq!(events[3].data["seq"], 3);
}

#[test]
fn test_events_survive_reopen() {
    let dir = tempdir().unwrap();
    {
        let instance = Instance::open(dir.path(), Config::default()).unwrap();
        instance
            .events()
            .append(NewEvent::new("durable", "t", serde_json::json!({ "v": 1 })))
            .unwrap();
    }

    let instance = Instance::open(dir.path(), Config::default()).unwrap();
    assert_eq!(instance.events().latest_version("durable").unwrap(), 1);
    let events = instance
        .events()
        .events("durable", &EventFilter::default())
        .unwrap();
    assert_eq!(events[0].data["v"], 1);
}
