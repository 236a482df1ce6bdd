//! CQRS projections: named read models folded from events.
//!
//! A projection owns a JSON state value, a dispatch table of reducers
//! keyed by event type, and a position (the max timestamp it has
//! applied). Unknown event types advance the position without touching
//! state, so a projection's position always reflects how far through
//! the log it has read.
//!
//! Positions persist through any [`KvStore`] under
//! `projection:<name>:position`, letting a restarted instance catch up
//! from where it left off.

use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use crate::error::{Result, ValidationError};
use crate::event::StoredEvent;
use crate::storage::KvStore;

type Reducer = Box<dyn Fn(&StoredEvent, Value) -> Value + Send + Sync>;
type InitialState = Box<dyn Fn() -> Value + Send + Sync>;

/// A named read model.
pub struct Projection {
    name: String,
    initial_state: InitialState,
    handlers: HashMap<String, Reducer>,
    state: Value,
    position: i64,
}

impl std::fmt::Debug for Projection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Projection")
            .field("name", &self.name)
            .field("position", &self.position)
            .field("handlers", &self.handlers.len())
            .finish_non_exhaustive()
    }
}

impl Projection {
    /// Creates a projection with the given initial-state factory.
    pub fn new(
        name: impl Into<String>,
        initial_state: impl Fn() -> Value + Send + Sync + 'static,
    ) -> Self {
        let state = initial_state();
        Self {
            name: name.into(),
            initial_state: Box::new(initial_state),
            handlers: HashMap::new(),
            state,
            position: 0,
        }
    }

    /// The projection's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers the reducer for one event type.
    ///
    /// # Errors
    /// `ValidationError::DuplicateHandler` when the type already has
    /// a reducer.
    pub fn when(
        &mut self,
        event_type: impl Into<String>,
        reducer: impl Fn(&StoredEvent, Value) -> Value + Send + Sync + 'static,
    ) -> Result<&mut Self> {
        let event_type = event_type.into();
        if self.handlers.contains_key(&event_type) {
            return Err(ValidationError::DuplicateHandler { event_type }.into());
        }
        self.handlers.insert(event_type, Box::new(reducer));
        Ok(self)
    }

    /// Applies one event.
    ///
    /// Runs the reducer if one is registered for the event's type;
    /// either way the position advances to
    /// `max(position, event.timestamp)`.
    pub fn apply(&mut self, event: &StoredEvent) {
        if let Some(reducer) = self.handlers.get(&event.event_type) {
            let state = std::mem::replace(&mut self.state, Value::Null);
            self.state = reducer(event, state);
        }
        self.position = self.position.max(event.timestamp.as_millis());
    }

    /// Applies events in the given order.
    pub fn apply_batch(&mut self, events: &[StoredEvent]) {
        for event in events {
            self.apply(event);
        }
    }

    /// Applies only events past the current position
    /// (`timestamp > position`).
    pub fn catch_up(&mut self, events: &[StoredEvent]) {
        let position = self.position;
        for event in events {
            if event.timestamp.as_millis() > position {
                self.apply(event);
            }
        }
    }

    /// Resets to the initial state and replays the given events.
    pub fn rebuild(&mut self, events: &[StoredEvent]) {
        debug!(projection = %self.name, events = events.len(), "Rebuilding");
        self.state = (self.initial_state)();
        self.position = 0;
        self.apply_batch(events);
    }

    /// Persists the position under `projection:<name>:position`.
    pub fn save_position(&self, kv: &dyn KvStore) -> Result<()> {
        kv.put(&self.position_key(), &self.position.to_be_bytes())
    }

    /// Restores a previously saved position, if one exists.
    pub fn load_position(&mut self, kv: &dyn KvStore) -> Result<()> {
        if let Some(raw) = kv.get(&self.position_key())? {
            if let Ok(bytes) = <[u8; 8]>::try_from(raw.as_slice()) {
                self.position = i64::from_be_bytes(bytes);
            }
        }
        Ok(())
    }

    /// The projection's current state.
    pub fn state(&self) -> &Value {
        &self.state
    }

    /// A detached copy of the state; mutating it cannot affect the
    /// projection.
    pub fn read_only_state(&self) -> Value {
        self.state.clone()
    }

    /// Max applied event timestamp, 0 before any event.
    pub fn position(&self) -> i64 {
        self.position
    }

    fn position_key(&self) -> String {
        format!("projection:{}:position", self.name)
    }
}

/// Holds projections by unique name.
#[derive(Debug, Default)]
pub struct ProjectionRegistry {
    projections: HashMap<String, Projection>,
}

impl ProjectionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a projection.
    ///
    /// # Errors
    /// `ValidationError` when the name is already taken.
    pub fn register(&mut self, projection: Projection) -> Result<()> {
        if self.projections.contains_key(projection.name()) {
            return Err(ValidationError::invalid_field(
                "name",
                format!("projection '{}' already registered", projection.name()),
            )
            .into());
        }
        self.projections
            .insert(projection.name().to_string(), projection);
        Ok(())
    }

    /// Applies one event to every projection.
    pub fn apply_to_all(&mut self, event: &StoredEvent) {
        for projection in self.projections.values_mut() {
            projection.apply(event);
        }
    }

    /// Rebuilds every projection from the same event sequence.
    pub fn rebuild_all(&mut self, events: &[StoredEvent]) {
        for projection in self.projections.values_mut() {
            projection.rebuild(events);
        }
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.projections.keys().cloned().collect();
        names.sort();
        names
    }

    /// Looks up a projection.
    pub fn get(&self, name: &str) -> Option<&Projection> {
        self.projections.get(name)
    }

    /// Looks up a projection mutably.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Projection> {
        self.projections.get_mut(name)
    }
}
