//! Relationship definitions and cascade record types.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::types::{CascadeId, Timestamp};

/// Relationship arrow type.
///
/// Hard arrows (`->`, `<-`) cascade synchronously; soft arrows
/// (`~>`, `<~`) enqueue for later draining. Direction is metadata for
/// the application; the engine treats both directions alike.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationKind {
    /// Hard, forward.
    HardForward,
    /// Hard, reverse.
    HardReverse,
    /// Soft, forward.
    SoftForward,
    /// Soft, reverse.
    SoftReverse,
}

impl RelationKind {
    /// Parses the arrow notation.
    pub fn parse(arrow: &str) -> Option<Self> {
        match arrow {
            "->" => Some(Self::HardForward),
            "<-" => Some(Self::HardReverse),
            "~>" => Some(Self::SoftForward),
            "<~" => Some(Self::SoftReverse),
            _ => None,
        }
    }

    /// The arrow notation.
    pub const fn arrow(&self) -> &'static str {
        match self {
            Self::HardForward => "->",
            Self::HardReverse => "<-",
            Self::SoftForward => "~>",
            Self::SoftReverse => "<~",
        }
    }

    /// True for synchronous cascade arrows.
    pub const fn is_hard(&self) -> bool {
        matches!(self, Self::HardForward | Self::HardReverse)
    }
}

/// What to do at the target when the source mutates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CascadePolicy {
    /// Propagate the operation (default).
    #[default]
    Cascade,
    /// Null out the reference instead of deleting.
    Nullify,
    /// Refuse the source operation if the target objects.
    Restrict,
    /// Do nothing.
    Ignore,
}

/// Cascaded operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CascadeOp {
    /// Source entity created.
    Create,
    /// Source entity updated.
    Update,
    /// Source entity deleted.
    Delete,
}

impl CascadeOp {
    /// Lowercase operation name used in actions and queue records.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Resolves the target instance id from the triggering entity.
pub type IdResolver = Arc<dyn Fn(&Value) -> Result<String> + Send + Sync>;

/// A registered relationship.
#[derive(Clone)]
pub struct RelationshipDef {
    /// Unique name within the instance.
    pub name: String,
    /// Arrow type.
    pub kind: RelationKind,
    /// Namespace binding the target lives under.
    pub target_binding: String,
    /// Maps the entity to the target instance id.
    pub id_resolver: IdResolver,
    /// Fields forwarded on update cascades; `None` forwards everything.
    pub cascade_fields: Option<Vec<String>>,
    /// Policy for delete cascades.
    pub on_delete: CascadePolicy,
    /// Policy for update cascades.
    pub on_update: CascadePolicy,
}

impl std::fmt::Debug for RelationshipDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationshipDef")
            .field("name", &self.name)
            .field("kind", &self.kind.arrow())
            .field("target_binding", &self.target_binding)
            .field("on_delete", &self.on_delete)
            .field("on_update", &self.on_update)
            .finish_non_exhaustive()
    }
}

impl RelationshipDef {
    /// Creates a definition with default `Cascade` policies.
    pub fn new(
        name: impl Into<String>,
        kind: RelationKind,
        target_binding: impl Into<String>,
        id_resolver: impl Fn(&Value) -> Result<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            target_binding: target_binding.into(),
            id_resolver: Arc::new(id_resolver),
            cascade_fields: None,
            on_delete: CascadePolicy::Cascade,
            on_update: CascadePolicy::Cascade,
        }
    }

    /// Sets the delete policy.
    pub fn on_delete(mut self, policy: CascadePolicy) -> Self {
        self.on_delete = policy;
        self
    }

    /// Sets the update policy.
    pub fn on_update(mut self, policy: CascadePolicy) -> Self {
        self.on_update = policy;
        self
    }

    /// Limits update cascades to the named fields.
    pub fn cascade_fields(mut self, fields: Vec<String>) -> Self {
        self.cascade_fields = Some(fields);
        self
    }
}

/// Outcome of one relationship's cascade attempt.
#[derive(Clone, Debug, PartialEq)]
pub struct CascadeResult {
    /// Relationship name.
    pub relationship: String,
    /// Resolved target id, when resolution succeeded.
    pub target_id: Option<String>,
    /// Whether this was a synchronous (hard) cascade.
    pub is_hard: bool,
    /// Whether the attempt (or enqueue, for soft) succeeded.
    pub success: bool,
    /// Failure description.
    pub error: Option<String>,
    /// Target's HTTP-style status, when a call was made.
    pub status: Option<u16>,
}

/// A soft cascade waiting in the queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueuedCascade {
    /// Queue entry identity.
    pub id: CascadeId,
    /// Relationship that enqueued it.
    pub relationship_name: String,
    /// Operation to replay.
    pub operation: CascadeOp,
    /// Resolved target id.
    pub target_id: String,
    /// Entity snapshot at trigger time.
    pub entity: Value,
    /// Enqueue time.
    pub enqueued_at: Timestamp,
    /// Failed drain attempts so far.
    pub retry_count: u32,
    /// Most recent drain failure.
    pub last_error: Option<String>,
}
