//! Saga executor: multi-participant transactions with compensation.
//!
//! A saga is a DAG of participant-invoked steps. The executor
//! topologically sorts the steps, runs them with per-step retry, and on
//! failure compensates every completed step (reverse order or all
//! concurrently, per the definition's strategy). Transactions and step
//! results persist in SQL so a host can inspect outcomes after the
//! fact.
//!
//! ```text
//!  Pending ─► Executing ─► Committing ─► Committed (terminal)
//!                 │
//!                 └► Compensating ─► Aborted (terminal)
//! ```

pub mod lock;
pub mod two_phase;
mod types;

pub use lock::{Lock, LockMode, LockOptions, LockService};
pub use two_phase::TwoPhaseParticipant;
pub use types::{
    CompensationStrategy, RetryOverride, RetryPolicy, SagaDefinition, SagaState, SagaStep,
    SagaTransaction, StepResult, DEFAULT_RETRY_POLICY,
};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::params;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, SagaError, SagaStepError, ValidationError};
use crate::gate::Gate;
use crate::schema::SchemaManager;
use crate::storage::SqlStore;
use crate::types::{Timestamp, TransactionId};

/// A saga participant: anything that can be invoked by method name.
///
/// Production participants are cross-instance handles; tests inject
/// in-process fakes.
pub trait SagaParticipant: Send + Sync {
    /// Invokes `method` with `params`, returning the step result.
    fn invoke(&self, method: &str, params: &Value) -> std::result::Result<Value, SagaStepError>;
}

/// Resolves participant ids to handles.
pub trait ParticipantDirectory: Send + Sync {
    /// Returns the participant registered under `participant_id`.
    fn get(&self, participant_id: &str) -> Option<Arc<dyn SagaParticipant>>;
}

/// In-memory directory for composing participants by name.
#[derive(Default)]
pub struct StaticDirectory {
    participants: HashMap<String, Arc<dyn SagaParticipant>>,
}

impl StaticDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a participant under `id`, replacing any prior entry.
    pub fn register(mut self, id: impl Into<String>, participant: Arc<dyn SagaParticipant>) -> Self {
        self.participants.insert(id.into(), participant);
        self
    }
}

impl ParticipantDirectory for StaticDirectory {
    fn get(&self, participant_id: &str) -> Option<Arc<dyn SagaParticipant>> {
        self.participants.get(participant_id).cloned()
    }
}

/// Drives sagas to a terminal state.
pub struct SagaExecutor {
    sql: Arc<SqlStore>,
    schema: Arc<SchemaManager>,
    gate: Arc<Gate>,
    directory: Arc<dyn ParticipantDirectory>,
    default_retry: RetryPolicy,
}

impl std::fmt::Debug for SagaExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaExecutor")
            .field("default_retry", &self.default_retry)
            .finish_non_exhaustive()
    }
}

impl SagaExecutor {
    /// Creates an executor over the instance's SQL store.
    pub fn new(
        sql: Arc<SqlStore>,
        schema: Arc<SchemaManager>,
        gate: Arc<Gate>,
        directory: Arc<dyn ParticipantDirectory>,
    ) -> Self {
        Self {
            sql,
            schema,
            gate,
            directory,
            default_retry: DEFAULT_RETRY_POLICY,
        }
    }

    /// Replaces the executor-wide default retry policy.
    pub fn with_default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }

    /// Executes a saga to a terminal state.
    ///
    /// Returns the committed transaction on success. When any step
    /// fails after retries, completed steps are compensated, the
    /// transaction lands in `Aborted`, and `SagaError::Aborted` with
    /// the aggregated failure messages is returned; the persisted
    /// transaction remains readable via [`Self::transaction`].
    ///
    /// # Errors
    /// `ValidationError` for malformed definitions (including
    /// dependency cycles) before anything is persisted.
    #[instrument(skip_all, fields(transaction_id = %definition.id))]
    pub fn execute(&self, definition: SagaDefinition) -> Result<SagaTransaction> {
        self.schema.ensure_initialized(&self.sql)?;
        definition.validate()?;
        let order = topological_order(&definition.steps)?;

        let now = Timestamp::now();
        let definition_json = serde_json::to_string(&definition)?;
        self.sql.execute(
            "INSERT OR REPLACE INTO saga_transactions (id, state, created_at, updated_at, definition) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                definition.id.to_string(),
                SagaState::Pending.as_str(),
                now.as_millis(),
                now.as_millis(),
                definition_json,
            ],
        )?;

        self.transition(definition.id, SagaState::Executing)?;

        let steps_by_id: HashMap<&str, &SagaStep> = definition
            .steps
            .iter()
            .map(|step| (step.id.as_str(), step))
            .collect();

        let mut completed: Vec<&SagaStep> = Vec::new();
        let mut failure: Option<SagaStepError> = None;

        for step_id in &order {
            let step = steps_by_id[step_id.as_str()];
            // Dependencies already succeeded or we would have bailed
            match self.run_step(definition.id, step, false) {
                Ok(()) => completed.push(step),
                Err(err) => {
                    warn!(step = %step.id, error = %err, "Step failed; compensating");
                    failure = Some(err);
                    break;
                }
            }
        }

        if let Some(step_error) = failure {
            self.transition(definition.id, SagaState::Compensating)?;
            let mut errors = vec![step_error.to_string()];
            errors.extend(self.compensate(
                definition.id,
                &completed,
                definition.compensation_strategy,
            )?);
            self.transition(definition.id, SagaState::Aborted)?;
            return Err(SagaError::Aborted {
                transaction_id: definition.id.to_string(),
                errors,
            }
            .into());
        }

        self.transition(definition.id, SagaState::Committing)?;
        self.transition(definition.id, SagaState::Committed)?;
        info!("Saga committed");

        self.transaction(definition.id)?
            .ok_or_else(|| crate::error::StorageError::corrupted("transaction row vanished").into())
    }

    /// Reads a persisted transaction.
    pub fn transaction(&self, id: TransactionId) -> Result<Option<SagaTransaction>> {
        self.schema.ensure_initialized(&self.sql)?;
        let row = self.sql.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT state, created_at, updated_at, definition \
                 FROM saga_transactions WHERE id = ?1",
            )?;
            let mut rows = stmt.query(params![id.to_string()])?;
            match rows.next()? {
                Some(row) => Ok(Some((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                ))),
                None => Ok(None),
            }
        })?;

        let Some((state, created_at, updated_at, definition_json)) = row else {
            return Ok(None);
        };
        let state = SagaState::parse(&state)
            .ok_or_else(|| crate::error::StorageError::corrupted("unknown saga state"))?;
        let definition: SagaDefinition = serde_json::from_str(&definition_json)?;
        Ok(Some(SagaTransaction {
            id,
            state,
            definition,
            created_at: Timestamp::from_millis(created_at),
            updated_at: Timestamp::from_millis(updated_at),
        }))
    }

    /// Reads all persisted step results for a transaction, forward
    /// results before compensations, in execution order.
    pub fn step_results(&self, id: TransactionId) -> Result<Vec<StepResult>> {
        self.schema.ensure_initialized(&self.sql)?;
        self.sql.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT step_id, is_compensation, success, data, error, retry_count, started_at, completed_at \
                 FROM saga_step_results WHERE transaction_id = ?1 \
                 ORDER BY is_compensation, started_at, rowid",
            )?;
            let results = stmt
                .query_map(params![id.to_string()], |row| {
                    let data: Option<String> = row.get(3)?;
                    Ok(StepResult {
                        transaction_id: id,
                        step_id: row.get(0)?,
                        is_compensation: row.get(1)?,
                        success: row.get(2)?,
                        data: data.and_then(|raw| serde_json::from_str(&raw).ok()),
                        error: row.get(4)?,
                        retry_count: row.get(5)?,
                        started_at: Timestamp::from_millis(row.get(6)?),
                        completed_at: Timestamp::from_millis(row.get(7)?),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(results)
        })
    }

    /// Runs one step (or compensation) with retry, persisting the result.
    fn run_step(
        &self,
        transaction_id: TransactionId,
        step: &SagaStep,
        is_compensation: bool,
    ) -> std::result::Result<(), SagaStepError> {
        let method = if is_compensation {
            match &step.compensation_method {
                Some(method) => method.as_str(),
                // Nothing to undo
                None => return Ok(()),
            }
        } else {
            step.method.as_str()
        };

        let policy = match &step.retry {
            Some(over) => self.default_retry.merged(over),
            None => self.default_retry,
        };

        let participant = self.directory.get(&step.participant_id);
        let started_at = Timestamp::now();
        let mut retries: u32 = 0;
        let mut rng = rand::thread_rng();

        let outcome = loop {
            let attempt_result = match &participant {
                Some(participant) => participant.invoke(method, &step.params),
                None => Err(SagaStepError::permanent(
                    &step.id,
                    "E_NO_PARTICIPANT",
                    format!("no participant registered as '{}'", step.participant_id),
                )),
            };

            match attempt_result {
                Ok(value) => break Ok(value),
                Err(err) => {
                    let attempts_made = retries + 1;
                    if err.retryable && attempts_made < policy.max_attempts {
                        let delay = policy.delay_for_attempt(retries, &mut rng);
                        debug!(step = %step.id, retries, delay_ms = delay, "Retrying step");
                        if delay > 0 {
                            std::thread::sleep(Duration::from_millis(delay));
                        }
                        retries += 1;
                        continue;
                    }
                    break Err(err);
                }
            }
        };

        let completed_at = Timestamp::now();
        let (success, data, error) = match &outcome {
            Ok(value) => (true, Some(value.clone()), None),
            Err(err) => (false, None, Some(err.to_string())),
        };
        if let Err(persist_err) = self.persist_step_result(&StepResult {
            transaction_id,
            step_id: step.id.clone(),
            is_compensation,
            success,
            data,
            error,
            retry_count: retries,
            started_at,
            completed_at,
        }) {
            warn!(step = %step.id, error = %persist_err, "Failed to persist step result");
        }

        outcome.map(|_| ())
    }

    /// Compensates completed steps. Returns failure messages; a failed
    /// compensation is recorded but never re-compensated.
    fn compensate(
        &self,
        transaction_id: TransactionId,
        completed: &[&SagaStep],
        strategy: CompensationStrategy,
    ) -> Result<Vec<String>> {
        let mut errors = Vec::new();
        match strategy {
            CompensationStrategy::Sequential => {
                for step in completed.iter().rev() {
                    if let Err(err) = self.run_step(transaction_id, step, true) {
                        errors.push(format!("compensation '{}' failed: {}", step.id, err));
                    }
                }
            }
            CompensationStrategy::Parallel => {
                let failures: Vec<String> = std::thread::scope(|scope| {
                    let handles: Vec<_> = completed
                        .iter()
                        .map(|step| {
                            scope.spawn(move || {
                                self.run_step(transaction_id, step, true)
                                    .err()
                                    .map(|err| format!("compensation '{}' failed: {}", step.id, err))
                            })
                        })
                        .collect();
                    handles
                        .into_iter()
                        .filter_map(|handle| handle.join().unwrap_or(None))
                        .collect()
                });
                errors.extend(failures);
            }
        }
        Ok(errors)
    }

    /// Persists a state transition. In-memory and persisted state must
    /// agree, so the write runs inside the instance gate.
    fn transition(&self, id: TransactionId, state: SagaState) -> Result<()> {
        self.gate.run(|| {
            self.sql.execute(
                "UPDATE saga_transactions SET state = ?1, updated_at = ?2 WHERE id = ?3",
                params![
                    state.as_str(),
                    Timestamp::now().as_millis(),
                    id.to_string()
                ],
            )?;
            debug!(state = state.as_str(), "Saga transition");
            Ok(())
        })
    }

    fn persist_step_result(&self, result: &StepResult) -> Result<()> {
        let data_json = match &result.data {
            Some(value) => Some(serde_json::to_string(value)?),
            None => None,
        };
        self.sql.execute(
            "INSERT OR REPLACE INTO saga_step_results \
             (transaction_id, step_id, is_compensation, success, data, error, retry_count, started_at, completed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                result.transaction_id.to_string(),
                result.step_id,
                result.is_compensation,
                result.success,
                data_json,
                result.error,
                result.retry_count,
                result.started_at.as_millis(),
                result.completed_at.as_millis(),
            ],
        )?;
        Ok(())
    }
}

/// Stable topological order: steps appear as early as their
/// dependencies allow, preserving definition order among peers.
///
/// # Errors
/// `ValidationError::DependencyCycle` naming a step on the cycle.
fn topological_order(steps: &[SagaStep]) -> Result<Vec<String>> {
    let mut order = Vec::with_capacity(steps.len());
    let mut placed: HashSet<&str> = HashSet::new();

    while order.len() < steps.len() {
        let mut advanced = false;
        for step in steps {
            if placed.contains(step.id.as_str()) {
                continue;
            }
            if step
                .depends_on
                .iter()
                .all(|dep| placed.contains(dep.as_str()))
            {
                placed.insert(step.id.as_str());
                order.push(step.id.clone());
                advanced = true;
            }
        }
        if !advanced {
            let stuck = steps
                .iter()
                .find(|step| !placed.contains(step.id.as_str()))
                .map(|step| step.id.clone())
                .unwrap_or_default();
            return Err(ValidationError::DependencyCycle { step_id: stuck }.into());
        }
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

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

    /// Participant that records invocations and fails named methods.
    struct ScriptedParticipant {
        calls: Mutex<Vec<String>>,
        fail: Vec<String>,
        retryable: bool,
    }

    impl ScriptedParticipant {
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

    impl SagaParticipant for ScriptedParticipant {
        fn invoke(
            &self,
            method: &str,
            _params: &Value,
        ) -> std::result::Result<Value, SagaStepError> {
            self.calls.lock().unwrap().push(method.to_string());
            if self.fail.iter().any(|f| f == method) {
                Err(SagaStepError::new(method, "E_SCRIPTED", "scripted failure", self.retryable))
            } else {
                Ok(serde_json::json!({ "ok": method }))
            }
        }
    }

    fn executor(participant: Arc<ScriptedParticipant>) -> SagaExecutor {
        let gate = Arc::new(Gate::new());
        let sql = Arc::new(SqlStore::open_in_memory().unwrap());
        let schema = Arc::new(SchemaManager::with_default_schema(Arc::clone(&gate)));
        let directory = Arc::new(StaticDirectory::new().register("svc", participant));
        SagaExecutor::new(sql, schema, gate, directory).with_default_retry(RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 0,
            backoff_multiplier: 1.0,
            max_delay_ms: 0,
            jitter: 0.0,
        })
    }

    fn chain_abc() -> SagaDefinition {
        SagaDefinition {
            id: TransactionId::new(),
            name: Some("chain".to_string()),
            steps: vec![step("a", &[]), step("b", &["a"]), step("c", &["b"])],
            compensation_strategy: CompensationStrategy::Sequential,
        }
    }

    #[test]
    fn test_topological_order_stable() {
        let steps = vec![step("c", &["a", "b"]), step("a", &[]), step("b", &["a"])];
        let order = topological_order(&steps).unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_cycle_detected() {
        let steps = vec![step("a", &["b"]), step("b", &["a"])];
        let err = topological_order(&steps).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_successful_saga_commits() {
        let participant = ScriptedParticipant::new(&[], true);
        let exec = executor(Arc::clone(&participant));
        let def = chain_abc();
        let id = def.id;

        let txn = exec.execute(def).unwrap();
        assert_eq!(txn.state, SagaState::Committed);
        assert_eq!(participant.calls(), vec!["do_a", "do_b", "do_c"]);

        let results = exec.step_results(id).unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.success && !r.is_compensation));
    }

    #[test]
    fn test_failed_step_compensates_in_reverse() {
        let participant = ScriptedParticipant::new(&["do_c"], false);
        let exec = executor(Arc::clone(&participant));
        let def = chain_abc();
        let id = def.id;

        let err = exec.execute(def).unwrap_err();
        assert!(matches!(
            err,
            crate::error::CellStoreError::Saga(SagaError::Aborted { .. })
        ));

        assert_eq!(
            participant.calls(),
            vec!["do_a", "do_b", "do_c", "undo_b", "undo_a"]
        );

        let txn = exec.transaction(id).unwrap().unwrap();
        assert_eq!(txn.state, SagaState::Aborted);

        let compensations: Vec<_> = exec
            .step_results(id)
            .unwrap()
            .into_iter()
            .filter(|r| r.is_compensation)
            .collect();
        assert_eq!(compensations.len(), 2);
        assert!(compensations.iter().all(|r| r.success));
    }

    #[test]
    fn test_retryable_failure_retries_to_success_count() {
        // Fails every time: with max_attempts 3 we expect 2 retries recorded
        let participant = ScriptedParticipant::new(&["do_a"], true);
        let exec = executor(Arc::clone(&participant));
        let def = SagaDefinition {
            id: TransactionId::new(),
            name: None,
            steps: vec![step("a", &[])],
            compensation_strategy: CompensationStrategy::Sequential,
        };
        let id = def.id;

        exec.execute(def).unwrap_err();
        assert_eq!(participant.calls().len(), 3);

        let results = exec.step_results(id).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].retry_count, 2);
        assert!(!results[0].success);
    }

    #[test]
    fn test_non_retryable_failure_does_not_retry() {
        let participant = ScriptedParticipant::new(&["do_a"], false);
        let exec = executor(Arc::clone(&participant));
        let def = SagaDefinition {
            id: TransactionId::new(),
            name: None,
            steps: vec![step("a", &[])],
            compensation_strategy: CompensationStrategy::Sequential,
        };
        let id = def.id;

        exec.execute(def).unwrap_err();
        assert_eq!(participant.calls().len(), 1);
        assert_eq!(exec.step_results(id).unwrap()[0].retry_count, 0);
    }

    #[test]
    fn test_parallel_compensation_compensates_all() {
        let participant = ScriptedParticipant::new(&["do_c"], false);
        let exec = executor(Arc::clone(&participant));
        let def = SagaDefinition {
            compensation_strategy: CompensationStrategy::Parallel,
            ..chain_abc()
        };
        let id = def.id;

        exec.execute(def).unwrap_err();
        let calls = participant.calls();
        assert!(calls.contains(&"undo_a".to_string()));
        assert!(calls.contains(&"undo_b".to_string()));

        let txn = exec.transaction(id).unwrap().unwrap();
        assert_eq!(txn.state, SagaState::Aborted);
    }

    #[test]
    fn test_compensation_failure_recorded_not_recompensated() {
        let participant = ScriptedParticipant::new(&["do_c", "undo_b"], false);
        let exec = executor(Arc::clone(&participant));
        let def = chain_abc();
        let id = def.id;

        let err = exec.execute(def).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("undo_b") || message.contains("compensation 'b'"));

        // undo_b appears exactly once even though it failed
        let undo_b_calls = participant
            .calls()
            .iter()
            .filter(|c| c.as_str() == "undo_b")
            .count();
        assert_eq!(undo_b_calls, 1);

        let comp_b = exec
            .step_results(id)
            .unwrap()
            .into_iter()
            .find(|r| r.is_compensation && r.step_id == "b")
            .unwrap();
        assert!(!comp_b.success);
    }

    #[test]
    fn test_unknown_participant_aborts() {
        let participant = ScriptedParticipant::new(&[], true);
        let exec = executor(participant);
        let def = SagaDefinition {
            id: TransactionId::new(),
            name: None,
            steps: vec![SagaStep {
                participant_id: "ghost".to_string(),
                ..step("a", &[])
            }],
            compensation_strategy: CompensationStrategy::Sequential,
        };
        let id = def.id;

        exec.execute(def).unwrap_err();
        let txn = exec.transaction(id).unwrap().unwrap();
        assert_eq!(txn.state, SagaState::Aborted);
    }

    #[test]
    fn test_transaction_not_found() {
        let exec = executor(ScriptedParticipant::new(&[], true));
        assert!(exec.transaction(TransactionId::new()).unwrap().is_none());
    }

    #[test]
    fn test_cycle_fails_before_persisting() {
        let exec = executor(ScriptedParticipant::new(&[], true));
        let def = SagaDefinition {
            id: TransactionId::new(),
            name: None,
            steps: vec![step("a", &["b"]), step("b", &["a"])],
            compensation_strategy: CompensationStrategy::Sequential,
        };
        let id = def.id;
        assert!(exec.execute(def).unwrap_err().is_validation());
        assert!(exec.transaction(id).unwrap().is_none());
    }
}
