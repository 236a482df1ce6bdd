//! Error types for cellstore.
//!
//! cellstore uses a hierarchical error system:
//! - `CellStoreError` is the top-level error returned by all public APIs
//! - Specific error types (`StorageError`, `ValidationError`) provide detail
//! - Structured errors (`VersionConflictError`, `SagaStepError`) carry the
//!   fields callers need to react programmatically
//!
//! # Error Handling Pattern
//! ```rust,ignore
//! use cellstore::{Instance, Config, Result};
//!
//! fn example() -> Result<()> {
//!     let instance = Instance::open("./cell", Config::default())?;
//!     // ... operations that may fail ...
//!     Ok(())
//! }
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for cellstore operations.
pub type Result<T> = std::result::Result<T, CellStoreError>;

/// Top-level error enum for all cellstore operations.
///
/// This is the only error type returned by public APIs.
/// Use pattern matching to handle specific error cases.
#[derive(Debug, Error)]
pub enum CellStoreError {
    /// Storage layer error (KV, SQL, serialization, transactions).
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Input validation error.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Optimistic concurrency conflict during event append.
    #[error("{0}")]
    Conflict(#[from] VersionConflictError),

    /// Saga execution error.
    #[error("Saga error: {0}")]
    Saga(#[from] SagaError),

    /// A `restrict` cascade target refused the operation.
    #[error("{0}")]
    Restricted(#[from] RestrictedError),

    /// Configuration error.
    #[error("Configuration error: {reason}")]
    Config {
        /// Description of what's wrong with the configuration.
        reason: String,
    },

    /// General I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A base-class placeholder was invoked without an override.
    #[error("Not implemented: {what}")]
    NotImplemented {
        /// Name of the unimplemented operation (e.g. `alarm`, `fetch`).
        what: String,
    },
}

impl CellStoreError {
    /// Creates a configuration error with the given reason.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Creates a not-implemented error for the named operation.
    pub fn not_implemented(what: impl Into<String>) -> Self {
        Self::NotImplemented { what: what.into() }
    }

    /// Returns true if this is a validation error.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is a storage error.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Returns true if this is a version conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Returns true if this is a restrict-cascade conflict.
    pub fn is_restricted(&self) -> bool {
        matches!(self, Self::Restricted(_))
    }
}

/// Storage-related errors.
///
/// These errors indicate problems with the underlying storage layers.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database file or data is corrupted.
    #[error("Database corrupted: {0}")]
    Corrupted(String),

    /// Database is locked by another process.
    #[error("Database is locked by another writer")]
    DatabaseLocked,

    /// Transaction failed (commit, rollback, etc.).
    #[error("Transaction failed: {0}")]
    Transaction(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error from the redb key/value engine.
    #[error("KV engine error: {0}")]
    Kv(String),

    /// Error from the SQLite relational engine.
    #[error("SQL engine error: {0}")]
    Sql(String),
}

impl StorageError {
    /// Creates a corruption error with the given message.
    pub fn corrupted(msg: impl Into<String>) -> Self {
        Self::Corrupted(msg.into())
    }

    /// Creates a transaction error with the given message.
    pub fn transaction(msg: impl Into<String>) -> Self {
        Self::Transaction(msg.into())
    }

    /// Creates a serialization error with the given message.
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Creates a KV engine error with the given message.
    pub fn kv(msg: impl Into<String>) -> Self {
        Self::Kv(msg.into())
    }

    /// Creates a SQL engine error with the given message.
    pub fn sql(msg: impl Into<String>) -> Self {
        Self::Sql(msg.into())
    }
}

// Conversions from redb error types
impl From<redb::Error> for StorageError {
    fn from(err: redb::Error) -> Self {
        StorageError::Kv(err.to_string())
    }
}

impl From<redb::DatabaseError> for StorageError {
    fn from(err: redb::DatabaseError) -> Self {
        StorageError::Kv(err.to_string())
    }
}

impl From<redb::TransactionError> for StorageError {
    fn from(err: redb::TransactionError) -> Self {
        StorageError::Transaction(err.to_string())
    }
}

impl From<redb::CommitError> for StorageError {
    fn from(err: redb::CommitError) -> Self {
        StorageError::Transaction(format!("Commit failed: {}", err))
    }
}

impl From<redb::TableError> for StorageError {
    fn from(err: redb::TableError) -> Self {
        StorageError::Kv(format!("Table error: {}", err))
    }
}

impl From<redb::StorageError> for StorageError {
    fn from(err: redb::StorageError) -> Self {
        StorageError::Kv(format!("Storage error: {}", err))
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Sql(err.to_string())
    }
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

// Also allow direct conversion to CellStoreError for convenience
impl From<redb::Error> for CellStoreError {
    fn from(err: redb::Error) -> Self {
        CellStoreError::Storage(StorageError::from(err))
    }
}

impl From<redb::DatabaseError> for CellStoreError {
    fn from(err: redb::DatabaseError) -> Self {
        CellStoreError::Storage(StorageError::from(err))
    }
}

impl From<redb::TransactionError> for CellStoreError {
    fn from(err: redb::TransactionError) -> Self {
        CellStoreError::Storage(StorageError::from(err))
    }
}

impl From<redb::CommitError> for CellStoreError {
    fn from(err: redb::CommitError) -> Self {
        CellStoreError::Storage(StorageError::from(err))
    }
}

impl From<redb::TableError> for CellStoreError {
    fn from(err: redb::TableError) -> Self {
        CellStoreError::Storage(StorageError::from(err))
    }
}

impl From<redb::StorageError> for CellStoreError {
    fn from(err: redb::StorageError) -> Self {
        CellStoreError::Storage(StorageError::from(err))
    }
}

impl From<rusqlite::Error> for CellStoreError {
    fn from(err: rusqlite::Error) -> Self {
        CellStoreError::Storage(StorageError::from(err))
    }
}

impl From<bincode::Error> for CellStoreError {
    fn from(err: bincode::Error) -> Self {
        CellStoreError::Storage(StorageError::from(err))
    }
}

impl From<serde_json::Error> for CellStoreError {
    fn from(err: serde_json::Error) -> Self {
        CellStoreError::Storage(StorageError::from(err))
    }
}

/// Validation errors for input data.
///
/// These errors indicate problems with data provided by the caller and
/// fail fast at the call site.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A field has an invalid value.
    #[error("Invalid field '{field}': {reason}")]
    InvalidField {
        /// Name of the invalid field.
        field: String,
        /// Why the value is invalid.
        reason: String,
    },

    /// A required field is missing or empty.
    #[error("Required field missing: {field}")]
    RequiredField {
        /// Name of the missing field.
        field: String,
    },

    /// A projection registered a second reducer for the same event type.
    #[error("Duplicate handler for event type '{event_type}'")]
    DuplicateHandler {
        /// Event type that already has a reducer.
        event_type: String,
    },

    /// Saga step dependencies form a cycle.
    #[error("Dependency cycle detected at step '{step_id}'")]
    DependencyCycle {
        /// A step participating in the cycle.
        step_id: String,
    },

    /// A truncation dimension outside the supported MRL set was requested.
    #[error("Unsupported truncation dimension: {got} (supported: 64, 128, 256, 512, 768)")]
    UnsupportedDimension {
        /// The requested dimension.
        got: usize,
    },

    /// A vector is shorter than the requested truncation dimension.
    #[error("Vector too short to truncate: {len} < {dim}")]
    VectorTooShort {
        /// Actual vector length.
        len: usize,
        /// Requested truncation dimension.
        dim: usize,
    },

    /// Two vectors passed to a kernel have different lengths.
    #[error("Vector length mismatch: {left} vs {right}")]
    LengthMismatch {
        /// Length of the left operand.
        left: usize,
        /// Length of the right operand.
        right: usize,
    },

    /// An empty vector was passed where at least one component is required.
    #[error("Empty vector")]
    EmptyVector,

    /// A zero vector cannot be normalized.
    #[error("Cannot normalize a zero vector")]
    ZeroVector,
}

impl ValidationError {
    /// Creates an invalid field error.
    pub fn invalid_field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Creates a required field error.
    pub fn required_field(field: impl Into<String>) -> Self {
        Self::RequiredField {
            field: field.into(),
        }
    }
}

/// Optimistic concurrency conflict raised by `EventLog::append`.
///
/// Carries the stream and both versions so callers can reload and retry.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error(
    "Version conflict on stream '{stream_id}': expected {expected_version}, actual {actual_version}"
)]
pub struct VersionConflictError {
    /// Stream the append targeted.
    pub stream_id: String,
    /// Version the caller expected to be current.
    pub expected_version: u64,
    /// Version actually current at append time.
    pub actual_version: u64,
}

/// Saga execution errors.
#[derive(Debug, Error)]
pub enum SagaError {
    /// A participant step failed (after retries, if any).
    #[error("{0}")]
    Step(#[from] SagaStepError),

    /// A step exceeded its time budget.
    #[error("{0}")]
    Timeout(#[from] SagaTimeoutError),

    /// The saga reached `Aborted`; carries one message per failure.
    #[error("Saga {transaction_id} aborted: {}", errors.join("; "))]
    Aborted {
        /// Transaction that aborted.
        transaction_id: String,
        /// Step failure and compensation failure messages, in order.
        errors: Vec<String>,
    },

    /// `saga_commit`/`saga_abort` was called without a prior prepare.
    #[error("No pending transaction: {transaction_id}")]
    NoPendingTransaction {
        /// Transaction id the host referenced.
        transaction_id: String,
    },

    /// The executor has no participant registered under this id.
    #[error("Unknown participant: {participant_id}")]
    UnknownParticipant {
        /// Participant id named by a step.
        participant_id: String,
    },
}

/// A saga step failure reported by a participant.
///
/// `retryable` drives the executor's retry loop: non-retryable errors
/// go straight to compensation. The captured stack preserves where the
/// failure originated across persistence and aggregation.
#[derive(Clone, Debug, Error, Serialize, Deserialize)]
#[error("Step '{step_id}' failed [{code}]: {message}")]
pub struct SagaStepError {
    /// Step that failed.
    pub step_id: String,
    /// Machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Whether the executor may retry this step.
    pub retryable: bool,
    /// Captured stack trace at construction time.
    pub stack: String,
}

impl SagaStepError {
    /// Creates a step error, capturing the current stack trace.
    pub fn new(
        step_id: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            code: code.into(),
            message: message.into(),
            retryable,
            stack: std::backtrace::Backtrace::force_capture().to_string(),
        }
    }

    /// Creates a retryable step error.
    pub fn retryable(
        step_id: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(step_id, code, message, true)
    }

    /// Creates a permanent (non-retryable) step error.
    pub fn permanent(
        step_id: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(step_id, code, message, false)
    }
}

/// A saga step exceeded its time budget.
#[derive(Clone, Debug, Error, Serialize, Deserialize)]
#[error("Saga {transaction_id} timed out at step '{step_id}'")]
pub struct SagaTimeoutError {
    /// Transaction that timed out.
    pub transaction_id: String,
    /// Step in flight when the budget ran out.
    pub step_id: String,
    /// Captured stack trace at construction time.
    pub stack: String,
}

impl SagaTimeoutError {
    /// Creates a timeout error, capturing the current stack trace.
    pub fn new(transaction_id: impl Into<String>, step_id: impl Into<String>) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            step_id: step_id.into(),
            stack: std::backtrace::Backtrace::force_capture().to_string(),
        }
    }
}

/// A cascade target with `on_delete = Restrict` returned a conflict.
///
/// This is the only cascade failure that bubbles out of
/// `trigger_cascade`; everything else becomes a per-relationship result.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("Cascade restricted by relationship '{relationship}' (target returned {status})")]
pub struct RestrictedError {
    /// Relationship whose target refused the operation.
    pub relationship: String,
    /// HTTP-style status the target answered with (409).
    pub status: u16,
}

// ============================================================================
// Wire-level error shape (JSON-RPC)
// ============================================================================

/// Wire-level error exposed to the host transport.
///
/// Maps onto the six JSON-RPC error codes the host understands.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum McpError {
    /// Malformed payload (-32700).
    #[error("Parse error: {0}")]
    Parse(String),

    /// Structurally invalid request (-32600).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No such method (-32601).
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// Parameters failed validation (-32602).
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// Internal failure (-32603).
    #[error("Internal error: {0}")]
    Internal(String),

    /// Application-defined server error (-32000).
    #[error("Server error: {0}")]
    Server(String),
}

impl McpError {
    /// Returns the JSON-RPC error code for this variant.
    pub const fn code(&self) -> i64 {
        match self {
            Self::Parse(_) => -32700,
            Self::InvalidRequest(_) => -32600,
            Self::MethodNotFound(_) => -32601,
            Self::InvalidParams(_) => -32602,
            Self::Internal(_) => -32603,
            Self::Server(_) => -32000,
        }
    }

    /// Serializes to the `{ code, message }` JSON-RPC error object.
    pub fn to_json_rpc(&self) -> serde_json::Value {
        serde_json::json!({
            "code": self.code(),
            "message": self.to_string(),
        })
    }
}

/// Returns true iff `n` is one of the six JSON-RPC codes cellstore emits.
pub fn is_mcp_error_code(n: i64) -> bool {
    matches!(n, -32700 | -32600 | -32601 | -32602 | -32603 | -32000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CellStoreError::config("missing hot dimension");
        assert_eq!(
            err.to_string(),
            "Configuration error: missing hot dimension"
        );
    }

    #[test]
    fn test_version_conflict_display() {
        let err = VersionConflictError {
            stream_id: "order-1".to_string(),
            expected_version: 1,
            actual_version: 2,
        };
        assert_eq!(
            err.to_string(),
            "Version conflict on stream 'order-1': expected 1, actual 2"
        );
    }

    #[test]
    fn test_is_conflict() {
        let err: CellStoreError = VersionConflictError {
            stream_id: "s".into(),
            expected_version: 0,
            actual_version: 1,
        }
        .into();
        assert!(err.is_conflict());
        assert!(!err.is_validation());
    }

    #[test]
    fn test_is_validation() {
        let err: CellStoreError = ValidationError::required_field("name").into();
        assert!(err.is_validation());
        assert!(!err.is_storage());
    }

    #[test]
    fn test_saga_step_error_captures_stack() {
        let err = SagaStepError::retryable("charge", "E_TIMEOUT", "gateway timeout");
        assert!(err.retryable);
        assert!(!err.stack.is_empty());
        assert_eq!(
            err.to_string(),
            "Step 'charge' failed [E_TIMEOUT]: gateway timeout"
        );
    }

    #[test]
    fn test_saga_aborted_display() {
        let err = SagaError::Aborted {
            transaction_id: "tx-1".to_string(),
            errors: vec![
                "step C failed".to_string(),
                "compensation B failed".to_string(),
            ],
        };
        assert_eq!(
            err.to_string(),
            "Saga tx-1 aborted: step C failed; compensation B failed"
        );
    }

    #[test]
    fn test_restricted_error_bubbles_identity() {
        let err: CellStoreError = RestrictedError {
            relationship: "user-orders".to_string(),
            status: 409,
        }
        .into();
        assert!(err.is_restricted());
    }

    #[test]
    fn test_mcp_error_codes() {
        assert_eq!(McpError::Parse("x".into()).code(), -32700);
        assert_eq!(McpError::InvalidRequest("x".into()).code(), -32600);
        assert_eq!(McpError::MethodNotFound("x".into()).code(), -32601);
        assert_eq!(McpError::InvalidParams("x".into()).code(), -32602);
        assert_eq!(McpError::Internal("x".into()).code(), -32603);
        assert_eq!(McpError::Server("x".into()).code(), -32000);
    }

    #[test]
    fn test_is_mcp_error_code() {
        for code in [-32700, -32600, -32601, -32602, -32603, -32000] {
            assert!(is_mcp_error_code(code));
        }
        assert!(!is_mcp_error_code(0));
        assert!(!is_mcp_error_code(-32001));
    }

    #[test]
    fn test_to_json_rpc_shape() {
        let obj = McpError::MethodNotFound("things.frobnicate".into()).to_json_rpc();
        assert_eq!(obj["code"], -32601);
        assert!(obj["message"]
            .as_str()
            .unwrap()
            .contains("things.frobnicate"));
    }

    #[test]
    fn test_error_conversion_chain() {
        fn inner() -> Result<()> {
            Err(StorageError::corrupted("bad page"))?
        }
        let result = inner();
        assert!(result.unwrap_err().is_storage());
    }
}
