//! The composed instance facade.
//!
//! [`Instance`] owns the storage engines and one field per subsystem -
//! trait-object seams instead of an inheritance chain. It also speaks
//! the two inbound protocols an instance exposes to its peers: the
//! cascade-target protocol ([`Instance::handle_cascade`]) and the
//! saga-participant protocol (`saga_prepare` / `saga_commit` /
//! `saga_abort`).

use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;
use tracing::{info, instrument};

use crate::alarm::{AlarmHandler, AlarmSlot};
use crate::broadcast::Broadcaster;
use crate::config::Config;
use crate::error::{CellStoreError, Result};
use crate::event::{EventLog, KvEventLog};
use crate::fts::FtsIndex;
use crate::gate::Gate;
use crate::host::{CascadeRequest, CascadeResponse, Namespace, StaticNamespace};
use crate::migration::MigrationEngine;
use crate::projection::ProjectionRegistry;
use crate::pubsub::PubSub;
use crate::relationship::RelationshipEngine;
use crate::saga::{
    LockService, ParticipantDirectory, SagaExecutor, StaticDirectory, TwoPhaseParticipant,
};
use crate::schema::SchemaManager;
use crate::storage::{KvStore, RedbKv, SqlStore};
use crate::thing::{NewThing, ThingStore};
use crate::types::{InstanceId, TransactionId};
use crate::vector::TwoPhaseSearch;

type AlarmCallback = Box<dyn Fn() -> Result<()> + Send + Sync>;

/// One addressable stateful instance.
///
/// # Ownership
///
/// The instance exclusively owns its KV and SQL stores; peers hold
/// address references, never the data. `Instance` is `Send + Sync` and
/// can be shared behind an `Arc`.
pub struct Instance {
    id: InstanceId,
    config: Config,
    gate: Arc<Gate>,
    kv: Arc<dyn KvStore>,
    sql: Arc<SqlStore>,
    schema: Arc<SchemaManager>,
    bus: Arc<PubSub>,
    events: EventLog,
    kv_events: KvEventLog,
    projections: Mutex<ProjectionRegistry>,
    sagas: SagaExecutor,
    locks: LockService,
    relationships: RelationshipEngine,
    things: ThingStore,
    fts: FtsIndex,
    vectors: TwoPhaseSearch,
    migration: MigrationEngine,
    broadcaster: Broadcaster,
    alarm_slot: AlarmSlot,
    alarm_callback: RwLock<Option<AlarmCallback>>,
    two_phase: RwLock<Option<Arc<TwoPhaseParticipant>>>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("hot_dimension", &self.config.hot_dimension)
            .finish_non_exhaustive()
    }
}

impl Instance {
    /// Opens an instance rooted at `dir` with no cross-instance wiring.
    ///
    /// Creates `cell.redb` and `cell.sqlite` inside the directory.
    /// Cascades will see no bindings and sagas no participants; use
    /// [`Instance::open_with`] to wire them.
    pub fn open(dir: impl AsRef<Path>, config: Config) -> Result<Self> {
        Self::open_with(
            dir,
            config,
            Arc::new(StaticNamespace::new()),
            Arc::new(StaticDirectory::new()),
        )
    }

    /// Opens an instance with injected cross-instance seams.
    #[instrument(skip_all, fields(dir = %dir.as_ref().display()))]
    pub fn open_with(
        dir: impl AsRef<Path>,
        config: Config,
        namespace: Arc<dyn Namespace>,
        participants: Arc<dyn ParticipantDirectory>,
    ) -> Result<Self> {
        config.validate()?;
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        let id = InstanceId::new(dir.display().to_string());
        let kv: Arc<dyn KvStore> = Arc::new(RedbKv::open(dir.join("cell.redb"))?);
        let sql = Arc::new(SqlStore::open(dir.join("cell.sqlite"))?);
        let gate = Arc::new(Gate::new());
        let schema = Arc::new(SchemaManager::with_default_schema(Arc::clone(&gate)));
        let bus = Arc::new(PubSub::new());

        let instance = Self {
            events: EventLog::new(Arc::clone(&sql), Arc::clone(&schema), Arc::clone(&gate)),
            kv_events: KvEventLog::new(Arc::clone(&kv)),
            projections: Mutex::new(ProjectionRegistry::new()),
            sagas: SagaExecutor::new(
                Arc::clone(&sql),
                Arc::clone(&schema),
                Arc::clone(&gate),
                participants,
            )
            .with_default_retry(config.saga_retry),
            locks: LockService::new(Arc::clone(&sql), Arc::clone(&schema), Arc::clone(&gate)),
            relationships: RelationshipEngine::new(
                Arc::clone(&kv),
                namespace,
                Arc::clone(&bus),
            ),
            things: ThingStore::new(Arc::clone(&sql), Arc::clone(&schema), Arc::clone(&bus)),
            fts: FtsIndex::new(Arc::clone(&sql), Arc::clone(&schema)),
            vectors: TwoPhaseSearch::new(config.hot_dimension),
            migration: MigrationEngine::new(config.migration.clone())?,
            broadcaster: Broadcaster::new(),
            alarm_slot: AlarmSlot::new(Arc::clone(&kv)),
            alarm_callback: RwLock::new(None),
            two_phase: RwLock::new(None),
            id,
            config,
            gate,
            kv,
            sql,
            schema,
            bus,
        };
        info!(id = %instance.id, "Instance opened");
        Ok(instance)
    }

    /// The instance identity.
    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    /// The configuration the instance was opened with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The instance-wide critical-section gate.
    pub fn gate(&self) -> &Arc<Gate> {
        &self.gate
    }

    /// The shared KV store.
    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    /// The shared SQL store.
    pub fn sql(&self) -> &Arc<SqlStore> {
        &self.sql
    }

    /// The lazy schema manager.
    pub fn schema(&self) -> &Arc<SchemaManager> {
        &self.schema
    }

    /// The instance pub/sub bus.
    pub fn bus(&self) -> &Arc<PubSub> {
        &self.bus
    }

    /// The SQL event log.
    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// The KV domain-event log.
    pub fn kv_events(&self) -> &KvEventLog {
        &self.kv_events
    }

    /// The projection registry, behind its own lock.
    pub fn projections(&self) -> std::sync::MutexGuard<'_, ProjectionRegistry> {
        self.projections.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The saga executor.
    pub fn sagas(&self) -> &SagaExecutor {
        &self.sagas
    }

    /// The distributed lock service.
    pub fn locks(&self) -> &LockService {
        &self.locks
    }

    /// The relationship/cascade engine.
    pub fn relationships(&self) -> &RelationshipEngine {
        &self.relationships
    }

    /// The thing store.
    pub fn things(&self) -> &ThingStore {
        &self.things
    }

    /// The full-text index.
    pub fn fts(&self) -> &FtsIndex {
        &self.fts
    }

    /// The two-phase vector searcher.
    pub fn vectors(&self) -> &TwoPhaseSearch {
        &self.vectors
    }

    /// The migration policy engine.
    pub fn migration(&self) -> &MigrationEngine {
        &self.migration
    }

    /// The WebSocket broadcaster.
    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// The alarm slot.
    pub fn alarm_slot(&self) -> &AlarmSlot {
        &self.alarm_slot
    }

    /// Installs the alarm callback run by [`AlarmHandler::alarm`].
    pub fn set_alarm_handler(&self, handler: impl Fn() -> Result<()> + Send + Sync + 'static) {
        *self.alarm_callback.write().unwrap() = Some(Box::new(handler));
    }

    // ========================================================================
    // Saga participant protocol
    // ========================================================================

    /// Installs the 2PC participant role with the given commit handler.
    pub fn install_two_phase(&self, participant: Arc<TwoPhaseParticipant>) {
        *self.two_phase.write().unwrap() = Some(participant);
    }

    /// Host-invoked 2PC prepare.
    pub fn saga_prepare(
        &self,
        transaction_id: TransactionId,
        method: &str,
        params: &Value,
    ) -> Result<bool> {
        let participant = self.two_phase.read().unwrap().clone();
        match participant {
            Some(participant) => participant.prepare(transaction_id, method, params),
            None => Err(CellStoreError::not_implemented("saga_prepare")),
        }
    }

    /// Host-invoked 2PC commit.
    pub fn saga_commit(&self, transaction_id: TransactionId) -> Result<Value> {
        let participant = self.two_phase.read().unwrap().clone();
        match participant {
            Some(participant) => participant.commit(transaction_id),
            None => Err(CellStoreError::not_implemented("saga_commit")),
        }
    }

    /// Host-invoked 2PC abort.
    pub fn saga_abort(&self, transaction_id: TransactionId) -> Result<()> {
        let participant = self.two_phase.read().unwrap().clone();
        match participant {
            Some(participant) => participant.abort(transaction_id),
            None => Err(CellStoreError::not_implemented("saga_abort")),
        }
    }

    // ========================================================================
    // Cascade target protocol
    // ========================================================================

    /// Handles an inbound cascade request against the thing store.
    ///
    /// Entity shape: `{ "ns"?, "type"?, "id", "data"? }`. Responds 2xx
    /// on success, 404 when the target row is missing, 400 for a
    /// malformed request, 500 for storage failures.
    pub fn handle_cascade(&self, request: &CascadeRequest) -> CascadeResponse {
        let body = &request.body;
        let ns = body["ns"].as_str().unwrap_or("default").to_string();
        let kind = body["type"].as_str().unwrap_or("thing").to_string();
        let Some(id) = body["id"].as_str().map(|s| s.to_string()) else {
            return CascadeResponse::status(400);
        };
        let data = body.get("data").cloned().unwrap_or_else(|| body.clone());

        let outcome: Result<CascadeResponse> = match request.action.as_str() {
            "cascade-create" => self
                .things
                .create(NewThing {
                    ns,
                    kind,
                    id,
                    url: None,
                    data,
                    context: None,
                })
                .map(|_| CascadeResponse::ok()),
            "cascade-update" => self.things.update(&ns, &kind, &id, &data).map(|updated| {
                match updated {
                    Some(_) => CascadeResponse::ok(),
                    None => CascadeResponse::status(404),
                }
            }),
            "cascade-delete" => self.things.delete(&ns, &kind, &id).map(|deleted| {
                if deleted {
                    CascadeResponse::ok()
                } else {
                    CascadeResponse::status(404)
                }
            }),
            // Null out the reference field named by the relationship
            "cascade-nullify" => {
                let mut fields = serde_json::Map::new();
                fields.insert(request.relationship.clone(), Value::Null);
                let patch = Value::Object(fields);
                self.things.update(&ns, &kind, &id, &patch).map(|updated| {
                    match updated {
                        Some(_) => CascadeResponse::ok(),
                        None => CascadeResponse::status(404),
                    }
                })
            }
            _ => return CascadeResponse::status(400),
        };

        match outcome {
            Ok(response) => response,
            Err(err) if err.is_storage() && err.to_string().contains("UNIQUE") => {
                CascadeResponse::status(409)
            }
            Err(_) => CascadeResponse::status(500),
        }
    }
}

impl AlarmHandler for Instance {
    fn alarm(&self) -> Result<()> {
        let callback = self.alarm_callback.read().unwrap();
        match callback.as_ref() {
            Some(callback) => callback(),
            None => Err(CellStoreError::not_implemented("alarm")),
        }
    }
}
