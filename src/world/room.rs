use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::net::connection::{ConnectionId, ConnectionSession, SessionRegistry};
use crate::net::delta;
use crate::net::protocol::Envelope;
use crate::world::entity::EntityRecord;
use crate::world::identity::EntityId;

/// Room-level hook run once per simulation pass, after the room's entities step
pub type RoomHook = Arc<dyn Fn(&mut Room, f64) + Send + Sync>;

/// A named partition of entities and the connections subscribed to them
pub struct Room {
    name: String,
    entities: Vec<EntityRecord>,
    clients: Vec<ConnectionId>,
    props: HashMap<String, Value>,
    step_hook: Option<RoomHook>,
}

impl Room {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entities: Vec::new(),
            clients: Vec::new(),
            props: HashMap::new(),
            step_hook: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set a room-scoped property
    pub fn set_prop(&mut self, key: impl Into<String>, value: Value) {
        self.props.insert(key.into(), value);
    }

    /// Get a room-scoped property
    pub fn get_prop(&self, key: &str) -> Option<&Value> {
        self.props.get(key)
    }

    pub fn remove_prop(&mut self, key: &str) -> Option<Value> {
        self.props.remove(key)
    }

    /// Install the per-tick room hook, replacing any previous one
    pub fn set_step_hook<F>(&mut self, hook: F)
    where
        F: Fn(&mut Room, f64) + Send + Sync + 'static,
    {
        self.step_hook = Some(Arc::new(hook));
    }

    pub fn clear_step_hook(&mut self) {
        self.step_hook = None;
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.clients.is_empty()
    }

    /// Subscribed connections, in join order
    pub fn clients(&self) -> &[ConnectionId] {
        &self.clients
    }

    pub fn has_client(&self, id: ConnectionId) -> bool {
        self.clients.contains(&id)
    }

    /// Identities of the entities in this room, in insertion order
    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.entities.iter().map(|record| record.id).collect()
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityRecord> {
        self.entities.iter()
    }

    pub fn get(&self, id: EntityId) -> Option<&EntityRecord> {
        self.entities.iter().find(|record| record.id == id)
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut EntityRecord> {
        self.entities.iter_mut().find(|record| record.id == id)
    }

    /// Insert an entity record. No delta is emitted here.
    pub(crate) fn insert_entity(&mut self, record: EntityRecord) {
        self.entities.push(record);
    }

    /// Detach an entity record without destroying it. No delta is emitted here.
    pub(crate) fn take_entity(&mut self, id: EntityId) -> Option<EntityRecord> {
        let index = self.entities.iter().position(|record| record.id == id)?;
        Some(self.entities.remove(index))
    }

    /// Subscribe a connection, queueing an add delta for every live entity
    pub fn add_client(&mut self, session: &mut ConnectionSession) {
        if !self.clients.contains(&session.id) {
            self.clients.push(session.id);
        }
        session.set_room(self.name.clone());

        for record in self.entities.iter().filter(|record| !record.is_dead()) {
            session.enqueue(delta::add_delta(record));
        }
    }

    /// Unsubscribe a connection, queueing a remove delta for every entity
    ///
    /// The teardown is queued even when the connection was not subscribed, so
    /// a peer that leaves always ends with a consistent view.
    pub fn remove_client(&mut self, session: &mut ConnectionSession) {
        self.clients.retain(|id| *id != session.id);

        for record in &self.entities {
            session.enqueue(delta::remove_delta(record));
        }
    }

    /// Drop a connection from the subscriber list without queueing anything
    pub(crate) fn forget_client(&mut self, id: ConnectionId) {
        self.clients.retain(|client| *client != id);
    }

    /// Queue a message for every subscribed connection
    pub fn broadcast(&self, sessions: &mut SessionRegistry, envelope: Envelope) {
        for id in &self.clients {
            sessions.enqueue(*id, envelope.clone());
        }
    }

    /// Build this room's `u` batch from the current entity state
    pub fn update_batch(&self) -> Option<Envelope> {
        delta::update_batch(&self.entities)
    }

    /// Step every entity, run the room hook, and return the identities of the dead ones
    pub(crate) fn step(&mut self, dt: f64) -> Vec<EntityId> {
        for record in self.entities.iter_mut() {
            record.entity.step(dt);
        }

        if let Some(hook) = self.step_hook.clone() {
            hook(self, dt);
        }

        self.entities
            .iter()
            .filter(|record| record.is_dead())
            .map(|record| record.id)
            .collect()
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("name", &self.name)
            .field("entities", &self.entities.len())
            .field("clients", &self.clients)
            .field("step_hook", &self.step_hook.is_some())
            .finish()
    }
}
