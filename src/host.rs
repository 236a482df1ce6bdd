//! Host-provided seams: cross-instance addressing and the cascade
//! wire protocol.
//!
//! The host runtime owns actual transport. The core only needs a
//! factory ([`Namespace`]) that turns `(binding, id)` into a callable
//! handle ([`InstanceStub`]). Tests inject in-process fakes; production
//! wires these to the host's fetch transport.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{CellStoreError, Result};

/// Header name carrying the cascade action.
pub const CASCADE_ACTION_HEADER: &str = "X-Cascade-Action";
/// Header name carrying the relationship name.
pub const CASCADE_RELATIONSHIP_HEADER: &str = "X-Cascade-Relationship";

/// An HTTP-style cascade request sent to a target instance.
#[derive(Clone, Debug, PartialEq)]
pub struct CascadeRequest {
    /// `cascade-create`, `cascade-update`, `cascade-delete`, or
    /// `cascade-nullify`.
    pub action: String,
    /// Relationship the cascade belongs to.
    pub relationship: String,
    /// Entity payload.
    pub body: Value,
}

impl CascadeRequest {
    /// Renders the protocol headers, including `Content-Type`.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            (CASCADE_ACTION_HEADER, self.action.clone()),
            (CASCADE_RELATIONSHIP_HEADER, self.relationship.clone()),
            ("Content-Type", "application/json".to_string()),
        ]
    }
}

/// An HTTP-style response from a cascade target.
#[derive(Clone, Debug, PartialEq)]
pub struct CascadeResponse {
    /// HTTP-style status code.
    pub status: u16,
    /// Optional response payload.
    pub body: Option<Value>,
}

impl CascadeResponse {
    /// A 200 response with no body.
    pub fn ok() -> Self {
        Self {
            status: 200,
            body: None,
        }
    }

    /// A response with the given status and no body.
    pub fn status(status: u16) -> Self {
        Self { status, body: None }
    }

    /// True for any 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// True for a 409 restrict conflict.
    pub fn is_conflict(&self) -> bool {
        self.status == 409
    }
}

/// A handle to another addressable instance.
///
/// The default `fetch` is a detectable placeholder: concrete stubs
/// must override it.
pub trait InstanceStub: Send + Sync {
    /// Delivers a cascade request to the instance.
    fn fetch(&self, request: &CascadeRequest) -> Result<CascadeResponse> {
        let _ = request;
        Err(CellStoreError::not_implemented("fetch"))
    }
}

/// Factory resolving `(binding, id)` to instance handles.
pub trait Namespace: Send + Sync {
    /// Returns a handle for `id` under `binding`, or `None` when the
    /// binding is not configured.
    fn get(&self, binding: &str, id: &str) -> Option<Arc<dyn InstanceStub>>;
}

/// Test/static namespace: one stub per binding, any id.
#[derive(Default)]
pub struct StaticNamespace {
    bindings: HashMap<String, Arc<dyn InstanceStub>>,
}

impl StaticNamespace {
    /// Creates an empty namespace.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a stub for a binding.
    pub fn bind(mut self, binding: impl Into<String>, stub: Arc<dyn InstanceStub>) -> Self {
        self.bindings.insert(binding.into(), stub);
        self
    }
}

impl Namespace for StaticNamespace {
    fn get(&self, binding: &str, _id: &str) -> Option<Arc<dyn InstanceStub>> {
        self.bindings.get(binding).cloned()
    }
}
