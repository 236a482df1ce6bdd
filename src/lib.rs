//! # cellstore
//!
//! Embedded stateful-object runtime: one addressable instance with
//! private key/value storage, an embedded relational engine, and a set
//! of composable subsystems layered on top - event-sourced aggregates,
//! CQRS projections, distributed sagas with compensation, cross-
//! instance cascading relationships, full-text and two-phase vector
//! search, and tiered-storage migration policy.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use cellstore::{Config, Instance, NewEvent};
//!
//! // Open an instance rooted at a directory
//! let instance = Instance::open("./cell", Config::default())?;
//!
//! // Append an event with optimistic concurrency
//! let event = instance.events().append(
//!     NewEvent::new("order-1", "order:created", serde_json::json!({ "total": 42 }))
//!         .expecting_version(0),
//! )?;
//! assert_eq!(event.version, 1);
//!
//! // Full-text search over indexed rows
//! let hits = instance.fts().search("quarterly report", &Default::default())?;
//! ```
//!
//! ## Key Concepts
//!
//! ### Instance
//!
//! An **instance** is the single addressable unit everything runs
//! inside. It exclusively owns its storage; other instances are
//! reached by address (binding + id) through the injected
//! [`Namespace`] seam, never by shared state.
//!
//! ### Streams and projections
//!
//! Events append to per-stream logs with strictly monotonic versions;
//! projections fold them into read models and track their position
//! for catch-up and rebuild.
//!
//! ### Sagas
//!
//! Multi-participant transactions execute as dependency-ordered steps
//! with retry; failures compensate completed steps in reverse order
//! and land the transaction in a terminal `Aborted` state.
//!
//! ## Concurrency
//!
//! The host serializes an instance cooperatively. Inside the library
//! that shows up as [`Gate`], used exactly for schema bring-up, the
//! event-append read-modify-write, and saga state transitions. All
//! facade types are `Send + Sync`.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

// ============================================================================
// Module declarations
// ============================================================================

mod config;
mod error;
mod gate;
mod instance;
mod types;

pub mod storage;

// Shared L1 services
pub mod alarm;
pub mod boundary;
pub mod broadcast;
pub mod host;
pub mod pubsub;
pub mod schema;

// Domain subsystems
pub mod event;
pub mod fts;
pub mod migration;
pub mod projection;
pub mod relationship;
pub mod saga;
pub mod thing;
pub mod vector;

// ============================================================================
// Public API re-exports
// ============================================================================

// Main facade
pub use instance::Instance;

// Configuration
pub use config::Config;

// Error handling
pub use error::{
    is_mcp_error_code, CellStoreError, McpError, RestrictedError, Result, SagaError,
    SagaStepError, SagaTimeoutError, StorageError, ValidationError, VersionConflictError,
};

// Core types
pub use gate::Gate;
pub use types::{CascadeId, EventId, InstanceId, LockId, Timestamp, TransactionId};

// Events and projections
pub use event::{DomainEvent, EventFilter, EventLog, EventSink, KvEventLog, NewEvent, StoredEvent};
pub use projection::{Projection, ProjectionRegistry};

// Sagas
pub use saga::{
    CompensationStrategy, Lock, LockMode, LockOptions, LockService, ParticipantDirectory,
    RetryOverride, RetryPolicy, SagaDefinition, SagaExecutor, SagaParticipant, SagaState,
    SagaStep, SagaTransaction, StaticDirectory, StepResult, TwoPhaseParticipant,
    DEFAULT_RETRY_POLICY,
};

// Relationships and the cascade protocol
pub use host::{CascadeRequest, CascadeResponse, InstanceStub, Namespace, StaticNamespace};
pub use relationship::{
    CascadeOp, CascadePolicy, CascadeResult, QueuedCascade, RelationKind, RelationshipDef,
    RelationshipEngine,
};

// Things and search
pub use fts::{FtsFilter, FtsHit, FtsIndex, TextEntry};
pub use thing::{ListOptions, NewThing, SortOrder, Thing, ThingOrder, ThingStore};
pub use vector::{
    cosine_similarity, dot_product, euclidean_distance, normalize, truncate_and_normalize,
    truncate_embedding, FullEmbeddingProvider, HotDimension, HotMeta, SearchHit, SearchOptions,
    SearchStats, TwoPhaseSearch,
};

// Migration policy
pub use migration::{
    AccessStats, BatchPolicy, DecisionPriority, DecisionReason, HotToWarmPolicy, MigrationBatch,
    MigrationDecision, MigrationEngine, MigrationItem, MigrationPolicy, MigrationStats,
    PolicyUpdate, Tier, TierUsage, WarmToColdPolicy,
};

// Error boundary
pub use boundary::{BoundaryMetrics, CallContext, ErrorBoundary, ErrorContext};

// ============================================================================
// Prelude module for convenient imports
// ============================================================================

/// Convenient imports for common cellstore usage.
///
/// ```rust
/// use cellstore::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{CellStoreError, Result};
    pub use crate::event::{EventFilter, NewEvent, StoredEvent};
    pub use crate::instance::Instance;
    pub use crate::projection::Projection;
    pub use crate::saga::{SagaDefinition, SagaState, SagaStep};
    pub use crate::thing::NewThing;
    pub use crate::types::Timestamp;
    pub use crate::vector::{HotDimension, SearchOptions};
}
