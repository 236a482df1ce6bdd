//! Integration tests for saga execution through the instance facade.
//!
//! Wires scripted participants into `Instance::open_with` and checks
//! the state machine, compensation ordering, retry accounting, and
//! the 2PC participant role.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use cellstore::{
    CellStoreError, CompensationStrategy, Config, Instance, RetryOverride, RetryPolicy,
    SagaDefinition, SagaError, SagaParticipant, SagaState, SagaStep, SagaStepError,
    StaticDirectory, StaticNamespace, TransactionId, TwoPhaseParticipant,
};
use serde_json::Value;
use tempfile::tempdir;

/// Participant that records invocations and fails listed methods.
struct Scripted {
    calls: Mutex<Vec<String>>,
    fail: Vec<String>,
    retryable: bool,
}

impl Scripted {
    fn new(fail: &[&str], retryable: bool) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            fail: fail.iter().map(|s| s.to_string()).collect(),
            retryable,
        })
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl SagaParticipant for Scripted {
    fn invoke(&self, method: &str, _params: &Value) -> Result<Value, SagaStepError> {
        self.calls.lock().unwrap().push(method.to_string());
        if self.fail.iter().any(|f| f == method) {
            Err(SagaStepError::new(
                method,
                "E_SCRIPTED",
                "scripted failure",
                self.retryable,
            ))
        } else {
            Ok(serde_json::json!({ "done": method }))
        }
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay_ms: 0,
        backoff_multiplier: 1.0,
        max_delay_ms: 0,
        jitter: 0.0,
    }
}

fn open_with_participant(participant: Arc<Scripted>) -> (Instance, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let config = Config {
        saga_retry: fast_retry(),
        ..Default::default()
    };
    let instance = Instance::open_with(
        dir.path(),
        config,
        Arc::new(StaticNamespace::new()),
        Arc::new(StaticDirectory::new().register("svc", participant)),
    )
    .unwrap();
    (instance, dir)
}

fn step(id: &str, deps: &[&str]) -> SagaStep {
    SagaStep {
        id: id.to_string(),
        participant_id: "svc".to_string(),
        method: format!("do_{}", id),
        params: Value::Null,
        compensation_method: Some(format!("undo_{}", id)),
        depends_on: deps.iter().map(|s| s.to_string()).collect(),
        retry: None,
    }
}

fn chain() -> SagaDefinition {
    SagaDefinition {
        id: TransactionId::new(),
        name: Some("order-fulfillment".to_string()),
        steps: vec![step("a", &[]), step("b", &["a"]), step("c", &["b"])],
        compensation_strategy: CompensationStrategy::Sequential,
    }
}

// ============================================================================
// Happy path
// ============================================================================

#[test]
fn test_saga_commits_and_persists_results() {
    let participant = Scripted::new(&[], true);
    let (instance, _dir) = open_with_participant(Arc::clone(&participant));
    let definition = chain();
    let id = definition.id;

    let txn = instance.sagas().execute(definition).unwrap();
    assert_eq!(txn.state, SagaState::Committed);
    assert_eq!(participant.calls(), vec!["do_a", "do_b", "do_c"]);

    let results = instance.sagas().step_results(id).unwrap();
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.success && !r.is_compensation));
    assert!(results.iter().all(|r| r.retry_count == 0));
}

// ============================================================================
// Compensation
// ============================================================================

#[test]
fn test_failed_final_step_compensates_in_reverse_order() {
    let participant = Scripted::new(&["do_c"], false);
    let (instance, _dir) = open_with_participant(Arc::clone(&participant));
    let definition = chain();
    let id = definition.id;

    let err = instance.sagas().execute(definition).unwrap_err();
    assert!(matches!(
        err,
        CellStoreError::Saga(SagaError::Aborted { .. })
    ));

    // Compensation order is exactly [undo_b, undo_a]
    assert_eq!(
        participant.calls(),
        vec!["do_a", "do_b", "do_c", "undo_b", "undo_a"]
    );

    let txn = instance.sagas().transaction(id).unwrap().unwrap();
    assert_eq!(txn.state, SagaState::Aborted);

    // Every successfully completed step has a compensation record
    let results = instance.sagas().step_results(id).unwrap();
    for completed_step in ["a", "b"] {
        assert!(results
            .iter()
            .any(|r| r.is_compensation && r.step_id == completed_step && r.success));
    }
    // The failed step has no compensation record
    assert!(!results.iter().any(|r| r.is_compensation && r.step_id == "c"));
}

#[test]
fn test_terminal_state_is_always_reached() {
    for failing in [&[] as &[&str], &["do_a"], &["do_b"], &["do_c"]] {
        let participant = Scripted::new(failing, false);
        let (instance, _dir) = open_with_participant(participant);
        let definition = chain();
        let id = definition.id;

        let _ = instance.sagas().execute(definition);
        let txn = instance.sagas().transaction(id).unwrap().unwrap();
        assert!(
            matches!(txn.state, SagaState::Committed | SagaState::Aborted),
            "non-terminal state {:?}",
            txn.state
        );
    }
}

#[test]
fn test_parallel_compensation_covers_all_completed_steps() {
    let participant = Scripted::new(&["do_c"], false);
    let (instance, _dir) = open_with_participant(Arc::clone(&participant));
    let definition = SagaDefinition {
        compensation_strategy: CompensationStrategy::Parallel,
        ..chain()
    };
    let id = definition.id;

    instance.sagas().execute(definition).unwrap_err();
    let calls = participant.calls();
    assert!(calls.contains(&"undo_a".to_string()));
    assert!(calls.contains(&"undo_b".to_string()));
    assert_eq!(
        instance.sagas().transaction(id).unwrap().unwrap().state,
        SagaState::Aborted
    );
}

// ============================================================================
// Retry
// ============================================================================

#[test]
fn test_retry_count_is_retries_not_attempts() {
    let participant = Scripted::new(&["do_a"], true);
    let (instance, _dir) = open_with_participant(Arc::clone(&participant));
    let definition = SagaDefinition {
        id: TransactionId::new(),
        name: None,
        steps: vec![step("a", &[])],
        compensation_strategy: CompensationStrategy::Sequential,
    };
    let id = definition.id;

    instance.sagas().execute(definition).unwrap_err();
    // max_attempts = 3 total invocations
    assert_eq!(participant.calls().len(), 3);
    let results = instance.sagas().step_results(id).unwrap();
    assert_eq!(results[0].retry_count, 2);
}

#[test]
fn test_step_override_limits_attempts() {
    let participant = Scripted::new(&["do_a"], true);
    let (instance, _dir) = open_with_participant(Arc::clone(&participant));
    let mut only = step("a", &[]);
    only.retry = Some(RetryOverride {
        max_attempts: Some(1),
        ..Default::default()
    });
    let definition = SagaDefinition {
        id: TransactionId::new(),
        name: None,
        steps: vec![only],
        compensation_strategy: CompensationStrategy::Sequential,
    };

    instance.sagas().execute(definition).unwrap_err();
    assert_eq!(participant.calls().len(), 1);
}

#[test]
fn test_dependency_cycle_rejected_up_front() {
    let participant = Scripted::new(&[], true);
    let (instance, _dir) = open_with_participant(Arc::clone(&participant));
    let definition = SagaDefinition {
        id: TransactionId::new(),
        name: None,
        steps: vec![step("a", &["b"]), step("b", &["a"])],
        compensation_strategy: CompensationStrategy::Sequential,
    };
    let id = definition.id;

    let err = instance.sagas().execute(definition).unwrap_err();
    assert!(err.is_validation());
    assert!(participant.calls().is_empty());
    assert!(instance.sagas().transaction(id).unwrap().is_none());
}

// ============================================================================
// 2PC participant role
// ============================================================================

#[test]
fn test_two_phase_prepare_commit_abort_via_instance() {
    let (instance, _dir) = open_with_participant(Scripted::new(&[], true));

    let executed = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&executed);
    let participant = Arc::new(TwoPhaseParticipant::new(
        Arc::clone(instance.kv()),
        Box::new(move |method, _params| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::json!({ "committed": method }))
        }),
    ));
    participant.allow_method("reserve-stock");
    instance.install_two_phase(participant);

    let txid = TransactionId::new();
    assert!(instance
        .saga_prepare(txid, "reserve-stock", &serde_json::json!({ "qty": 2 }))
        .unwrap());
    // Prepared but not executed
    assert_eq!(executed.load(Ordering::SeqCst), 0);

    let result = instance.saga_commit(txid).unwrap();
    assert_eq!(result["committed"], "reserve-stock");
    assert_eq!(executed.load(Ordering::SeqCst), 1);

    // Commit consumed the pending record
    let err = instance.saga_commit(txid).unwrap_err();
    assert!(err.to_string().contains("No pending transaction"));
}

#[test]
fn test_two_phase_abort_discards_pending() {
    let (instance, _dir) = open_with_participant(Scripted::new(&[], true));
    let participant = Arc::new(TwoPhaseParticipant::new(
        Arc::clone(instance.kv()),
        Box::new(|_, _| Ok(Value::Null)),
    ));
    participant.allow_method("reserve-stock");
    instance.install_two_phase(participant);

    let txid = TransactionId::new();
    instance
        .saga_prepare(txid, "reserve-stock", &Value::Null)
        .unwrap();
    instance.saga_abort(txid).unwrap();

    let err = instance.saga_commit(txid).unwrap_err();
    assert!(err.to_string().contains("No pending transaction"));
}
