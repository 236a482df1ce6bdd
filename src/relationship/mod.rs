//! Relationship / cascade engine.
//!
//! Relationships declare how mutations on this instance fan out to
//! entities owned by other instances. Hard arrows (`->`, `<-`) call
//! the target synchronously through the injected [`Namespace`]; soft
//! arrows (`~>`, `<~`) enqueue a [`QueuedCascade`] in the KV store and
//! drain it later with [`RelationshipEngine::process_soft_cascades`].
//!
//! Every attempt emits `cascade:{started,completed,failed,queued}` on
//! the instance bus. Only a `Restrict` conflict (target answered 409)
//! bubbles out of [`RelationshipEngine::trigger_cascade`]; every other
//! failure becomes a per-relationship [`CascadeResult`].

mod types;

pub use types::{
    CascadeOp, CascadePolicy, CascadeResult, IdResolver, QueuedCascade, RelationKind,
    RelationshipDef,
};

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::error::{Result, RestrictedError, ValidationError};
use crate::host::{CascadeRequest, Namespace};
use crate::pubsub::PubSub;
use crate::storage::KvStore;
use crate::types::{key_segment, CascadeId, Timestamp};

const QUEUE_PREFIX: &str = "cascade:queue:";

/// Persisted queue-entry shape. The entity rides along as a JSON
/// string inside the bincode record; bincode cannot revive a bare
/// `serde_json::Value`.
#[derive(serde::Serialize, serde::Deserialize)]
struct QueueRecord {
    id: CascadeId,
    relationship_name: String,
    operation: CascadeOp,
    target_id: String,
    entity_json: String,
    enqueued_at: Timestamp,
    retry_count: u32,
    last_error: Option<String>,
}

fn encode_entry(entry: &QueuedCascade) -> Result<Vec<u8>> {
    let record = QueueRecord {
        id: entry.id,
        relationship_name: entry.relationship_name.clone(),
        operation: entry.operation,
        target_id: entry.target_id.clone(),
        entity_json: serde_json::to_string(&entry.entity)?,
        enqueued_at: entry.enqueued_at,
        retry_count: entry.retry_count,
        last_error: entry.last_error.clone(),
    };
    Ok(bincode::serialize(&record).map_err(crate::error::StorageError::from)?)
}

fn decode_entry(raw: &[u8]) -> Result<QueuedCascade> {
    let record: QueueRecord = bincode::deserialize(raw).map_err(crate::error::StorageError::from)?;
    Ok(QueuedCascade {
        id: record.id,
        relationship_name: record.relationship_name,
        operation: record.operation,
        target_id: record.target_id,
        entity: serde_json::from_str(&record.entity_json)?,
        enqueued_at: record.enqueued_at,
        retry_count: record.retry_count,
        last_error: record.last_error,
    })
}

/// Per-instance relationship registry and cascade dispatcher.
pub struct RelationshipEngine {
    defs: RwLock<HashMap<String, RelationshipDef>>,
    kv: Arc<dyn KvStore>,
    namespace: Arc<dyn Namespace>,
    bus: Arc<PubSub>,
}

impl std::fmt::Debug for RelationshipEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationshipEngine")
            .field("relations", &self.defs.read().unwrap().len())
            .finish_non_exhaustive()
    }
}

impl RelationshipEngine {
    /// Creates an engine over the instance's KV store, namespace, and
    /// bus.
    pub fn new(kv: Arc<dyn KvStore>, namespace: Arc<dyn Namespace>, bus: Arc<PubSub>) -> Self {
        Self {
            defs: RwLock::new(HashMap::new()),
            kv,
            namespace,
            bus,
        }
    }

    /// Registers a relationship.
    ///
    /// # Errors
    /// Rejects an empty name or target binding, and a duplicate name.
    pub fn define_relation(&self, def: RelationshipDef) -> Result<()> {
        if def.name.is_empty() {
            return Err(ValidationError::required_field("name").into());
        }
        if def.target_binding.is_empty() {
            return Err(ValidationError::required_field("target_binding").into());
        }
        let mut defs = self.defs.write().unwrap();
        if defs.contains_key(&def.name) {
            return Err(ValidationError::invalid_field(
                "name",
                format!("relationship '{}' already defined", def.name),
            )
            .into());
        }
        debug!(name = %def.name, arrow = def.kind.arrow(), "Relationship defined");
        defs.insert(def.name.clone(), def);
        Ok(())
    }

    /// Removes a relationship. Returns `false` when it was not defined.
    /// Queued soft cascades referencing it are dropped at drain time.
    pub fn undefine_relation(&self, name: &str) -> bool {
        self.defs.write().unwrap().remove(name).is_some()
    }

    /// Whether a relationship is defined.
    pub fn has_relation(&self, name: &str) -> bool {
        self.defs.read().unwrap().contains_key(name)
    }

    /// Returns a relationship definition.
    pub fn get_relation(&self, name: &str) -> Option<RelationshipDef> {
        self.defs.read().unwrap().get(name).cloned()
    }

    /// Registered relationship names, sorted.
    pub fn list_relations(&self) -> Vec<String> {
        let mut names: Vec<String> = self.defs.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Fans `(operation, entity)` out across every defined
    /// relationship.
    ///
    /// Relationships whose effective policy for the operation is
    /// `Ignore` are skipped and produce no result.
    ///
    /// # Errors
    /// [`RestrictedError`] when a `Restrict` target answers 409; the
    /// results accumulated so far are discarded with it.
    #[instrument(skip(self, entity), fields(operation = operation.as_str()))]
    pub fn trigger_cascade(
        &self,
        operation: CascadeOp,
        entity: &Value,
    ) -> Result<Vec<CascadeResult>> {
        let defs: Vec<RelationshipDef> = {
            let defs = self.defs.read().unwrap();
            let mut ordered: Vec<RelationshipDef> = defs.values().cloned().collect();
            ordered.sort_by(|a, b| a.name.cmp(&b.name));
            ordered
        };

        let mut results = Vec::new();
        for def in defs {
            let policy = effective_policy(&def, operation);
            if policy == CascadePolicy::Ignore {
                continue;
            }
            self.emit(
                "cascade:started",
                &serde_json::json!({ "relationship": def.name, "operation": operation.as_str() }),
            );

            let target_id = match (def.id_resolver)(entity) {
                Ok(id) => id,
                Err(err) => {
                    let result = CascadeResult {
                        relationship: def.name.clone(),
                        target_id: None,
                        is_hard: def.kind.is_hard(),
                        success: false,
                        error: Some(format!("Failed to resolve target ID: {}", err)),
                        status: None,
                    };
                    self.emit_failed(&def.name, result.error.as_deref());
                    results.push(result);
                    continue;
                }
            };

            if def.kind.is_hard() {
                match self.call_target(&def, operation, policy, &target_id, entity)? {
                    CallOutcome::Success(status) => {
                        self.emit(
                            "cascade:completed",
                            &serde_json::json!({ "relationship": def.name, "targetId": target_id }),
                        );
                        results.push(CascadeResult {
                            relationship: def.name.clone(),
                            target_id: Some(target_id),
                            is_hard: true,
                            success: true,
                            error: None,
                            status: Some(status),
                        });
                    }
                    CallOutcome::Failure { error, status } => {
                        self.emit_failed(&def.name, Some(&error));
                        results.push(CascadeResult {
                            relationship: def.name.clone(),
                            target_id: Some(target_id),
                            is_hard: true,
                            success: false,
                            error: Some(error),
                            status,
                        });
                    }
                }
            } else {
                self.enqueue(&def, operation, &target_id, entity)?;
                self.emit(
                    "cascade:queued",
                    &serde_json::json!({ "relationship": def.name, "targetId": target_id }),
                );
                results.push(CascadeResult {
                    relationship: def.name.clone(),
                    target_id: Some(target_id),
                    is_hard: false,
                    success: true,
                    error: None,
                    status: None,
                });
            }
        }
        Ok(results)
    }

    /// Drains the soft-cascade queue once.
    ///
    /// Entries whose relationship has been undefined are dropped
    /// silently. Successful deliveries leave the queue; failures stay
    /// with `retry_count + 1` and `last_error` set.
    pub fn process_soft_cascades(&self) -> Result<Vec<CascadeResult>> {
        let entries = self.kv.list_prefix(QUEUE_PREFIX)?;
        let mut results = Vec::new();

        for (key, raw) in entries {
            let mut entry = match decode_entry(&raw) {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(key, error = %err, "Dropping undecodable queue entry");
                    self.kv.delete(&key)?;
                    continue;
                }
            };

            let Some(def) = self.get_relation(&entry.relationship_name) else {
                debug!(relationship = %entry.relationship_name, "Relationship gone; dropping entry");
                self.kv.delete(&key)?;
                continue;
            };

            let policy = effective_policy(&def, entry.operation);
            let outcome =
                self.call_target_soft(&def, entry.operation, policy, &entry.target_id, &entry.entity);
            match outcome {
                CallOutcome::Success(status) => {
                    self.kv.delete(&key)?;
                    self.emit(
                        "cascade:completed",
                        &serde_json::json!({ "relationship": def.name, "targetId": entry.target_id }),
                    );
                    results.push(CascadeResult {
                        relationship: entry.relationship_name,
                        target_id: Some(entry.target_id),
                        is_hard: false,
                        success: true,
                        error: None,
                        status: Some(status),
                    });
                }
                CallOutcome::Failure { error, status } => {
                    entry.retry_count += 1;
                    entry.last_error = Some(error.clone());
                    self.kv.put(&key, &encode_entry(&entry)?)?;
                    self.emit_failed(&entry.relationship_name, Some(&error));
                    results.push(CascadeResult {
                        relationship: entry.relationship_name,
                        target_id: Some(entry.target_id),
                        is_hard: false,
                        success: false,
                        error: Some(error),
                        status,
                    });
                }
            }
        }
        Ok(results)
    }

    /// Number of queued soft cascades.
    pub fn queued_cascades(&self) -> Result<Vec<QueuedCascade>> {
        let entries = self.kv.list_prefix(QUEUE_PREFIX)?;
        let mut queued = Vec::with_capacity(entries.len());
        for (_, raw) in entries {
            queued.push(decode_entry(&raw)?);
        }
        Ok(queued)
    }

    fn enqueue(
        &self,
        def: &RelationshipDef,
        operation: CascadeOp,
        target_id: &str,
        entity: &Value,
    ) -> Result<()> {
        let entry = QueuedCascade {
            id: CascadeId::new(),
            relationship_name: def.name.clone(),
            operation,
            target_id: target_id.to_string(),
            entity: entity.clone(),
            enqueued_at: Timestamp::now(),
            retry_count: 0,
            last_error: None,
        };
        let key = format!(
            "{}{}:{}",
            QUEUE_PREFIX,
            key_segment(entry.enqueued_at.as_millis()),
            entry.id
        );
        self.kv.put(&key, &encode_entry(&entry)?)
    }

    /// Hard-cascade call; only here can `Restrict` bubble.
    fn call_target(
        &self,
        def: &RelationshipDef,
        operation: CascadeOp,
        policy: CascadePolicy,
        target_id: &str,
        entity: &Value,
    ) -> Result<CallOutcome> {
        let outcome = self.call_target_soft(def, operation, policy, target_id, entity);
        if let CallOutcome::Failure {
            status: Some(409), ..
        } = outcome
        {
            if policy == CascadePolicy::Restrict {
                self.emit_failed(&def.name, Some("restricted"));
                return Err(RestrictedError {
                    relationship: def.name.clone(),
                    status: 409,
                }
                .into());
            }
        }
        Ok(outcome)
    }

    /// One delivery attempt; never bubbles, reports an outcome.
    fn call_target_soft(
        &self,
        def: &RelationshipDef,
        operation: CascadeOp,
        policy: CascadePolicy,
        target_id: &str,
        entity: &Value,
    ) -> CallOutcome {
        let Some(stub) = self.namespace.get(&def.target_binding, target_id) else {
            return CallOutcome::Failure {
                error: "DO binding not found".to_string(),
                status: None,
            };
        };

        let action = if operation == CascadeOp::Delete && policy == CascadePolicy::Nullify {
            "cascade-nullify".to_string()
        } else {
            format!("cascade-{}", operation.as_str())
        };
        let body = match (&def.cascade_fields, operation) {
            (Some(fields), CascadeOp::Update) => project_fields(entity, fields),
            _ => entity.clone(),
        };
        let request = CascadeRequest {
            action,
            relationship: def.name.clone(),
            body,
        };

        match stub.fetch(&request) {
            Ok(response) if response.is_success() => CallOutcome::Success(response.status),
            Ok(response) => CallOutcome::Failure {
                error: format!("target returned status {}", response.status),
                status: Some(response.status),
            },
            Err(err) => CallOutcome::Failure {
                error: err.to_string(),
                status: None,
            },
        }
    }

    fn emit(&self, topic: &str, payload: &Value) {
        self.bus.emit(topic, payload);
    }

    fn emit_failed(&self, relationship: &str, error: Option<&str>) {
        self.emit(
            "cascade:failed",
            &serde_json::json!({ "relationship": relationship, "error": error }),
        );
    }
}

enum CallOutcome {
    Success(u16),
    Failure {
        error: String,
        status: Option<u16>,
    },
}

fn effective_policy(def: &RelationshipDef, operation: CascadeOp) -> CascadePolicy {
    match operation {
        CascadeOp::Delete => def.on_delete,
        CascadeOp::Update => def.on_update,
        CascadeOp::Create => CascadePolicy::Cascade,
    }
}

/// Keeps only the named top-level fields of an object entity.
fn project_fields(entity: &Value, fields: &[String]) -> Value {
    match entity {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| fields.iter().any(|f| f == *key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}
