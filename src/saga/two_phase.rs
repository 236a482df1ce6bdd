//! Two-phase-commit participant role.
//!
//! An instance can itself participate in another coordinator's saga.
//! `prepare` validates a call and persists a pending record without
//! executing side effects; `commit` executes the recorded call;
//! `abort` discards it. Pending records live in the KV store under
//! `saga:pending:<transaction_id>` so they survive restarts.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{Result, SagaError};
use crate::storage::KvStore;
use crate::types::{Timestamp, TransactionId};

const PENDING_PREFIX: &str = "saga:pending:";

/// A prepared-but-unexecuted call.
///
/// The params round-trip as a JSON string inside the bincode record;
/// bincode cannot revive a bare `serde_json::Value`.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct PendingOp {
    method: String,
    params_json: String,
    prepared_at: Timestamp,
}

/// Handler invoked at commit time to execute the prepared side effects.
pub type CommitHandler = dyn Fn(&str, &Value) -> Result<Value> + Send + Sync;

/// The participant side of the 2PC protocol.
pub struct TwoPhaseParticipant {
    kv: Arc<dyn KvStore>,
    /// Methods this participant is willing to prepare.
    methods: RwLock<HashSet<String>>,
    handler: Box<CommitHandler>,
}

impl std::fmt::Debug for TwoPhaseParticipant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwoPhaseParticipant")
            .field("methods", &self.methods.read().unwrap().len())
            .finish_non_exhaustive()
    }
}

impl TwoPhaseParticipant {
    /// Creates a participant whose `handler` executes committed calls.
    pub fn new(kv: Arc<dyn KvStore>, handler: Box<CommitHandler>) -> Self {
        Self {
            kv,
            methods: RwLock::new(HashSet::new()),
            handler,
        }
    }

    /// Registers a method name this participant accepts.
    pub fn allow_method(&self, method: impl Into<String>) {
        self.methods.write().unwrap().insert(method.into());
    }

    /// Phase 1: validate and stake the call without executing it.
    ///
    /// Returns `true` iff the record was persisted. Unknown methods
    /// refuse to prepare (returning `false`) rather than erroring, so
    /// the coordinator can vote-abort cleanly.
    pub fn prepare(
        &self,
        transaction_id: TransactionId,
        method: &str,
        params: &Value,
    ) -> Result<bool> {
        if !self.methods.read().unwrap().contains(method) {
            debug!(method, "Refusing to prepare unknown method");
            return Ok(false);
        }
        let op = PendingOp {
            method: method.to_string(),
            params_json: serde_json::to_string(params)?,
            prepared_at: Timestamp::now(),
        };
        self.kv
            .put(&pending_key(transaction_id), &bincode::serialize(&op)?)?;
        debug!(%transaction_id, method, "Prepared");
        Ok(true)
    }

    /// Phase 2: execute the prepared call's side effects.
    ///
    /// # Errors
    /// `SagaError::NoPendingTransaction` if there is nothing prepared
    /// under this id (including after an `abort`).
    pub fn commit(&self, transaction_id: TransactionId) -> Result<Value> {
        let key = pending_key(transaction_id);
        let raw = self
            .kv
            .get(&key)?
            .ok_or_else(|| SagaError::NoPendingTransaction {
                transaction_id: transaction_id.to_string(),
            })?;
        let op: PendingOp = bincode::deserialize(&raw)?;
        let params: Value = serde_json::from_str(&op.params_json)?;

        let result = (self.handler)(&op.method, &params)?;
        self.kv.delete(&key)?;
        info!(%transaction_id, method = %op.method, "Committed");
        Ok(result)
    }

    /// Discards the pending record. Idempotent.
    pub fn abort(&self, transaction_id: TransactionId) -> Result<()> {
        self.kv.delete(&pending_key(transaction_id))?;
        debug!(%transaction_id, "Aborted");
        Ok(())
    }

    /// Whether a pending record exists for this transaction.
    pub fn has_pending(&self, transaction_id: TransactionId) -> Result<bool> {
        Ok(self.kv.get(&pending_key(transaction_id))?.is_some())
    }
}

fn pending_key(transaction_id: TransactionId) -> String {
    format!("{}{}", PENDING_PREFIX, transaction_id)
}
