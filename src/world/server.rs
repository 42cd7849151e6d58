use std::sync::Arc;

use hashbrown::HashMap;
use serde_json::Value;
use smallvec::SmallVec;
use tracing::{debug, info, warn};

use crate::net::connection::{ConnectionId, ConnectionSession, FrameSink, SessionRegistry};
use crate::net::delta;
use crate::net::inbound::InboundEvent;
use crate::net::protocol::{self, Envelope};
use crate::world::entity::{Entity, EntityRecord};
use crate::world::identity::{EntityId, IdentityAllocator};
use crate::world::room::Room;

/// Name of the room every connection starts in. It can never be created or deleted.
pub const DEFAULT_ROOM: &str = "*";

/// Inbound message handler: receives the world, the sending connection and the payload
pub type Handler = Arc<dyn Fn(&mut World, ConnectionId, &Value) + Send + Sync>;

/// Connection lifecycle hook
pub type ConnectionHook = Arc<dyn Fn(&mut World, ConnectionId) + Send + Sync>;

/// Target of `World::emit_to`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Room(String),
    Connection(ConnectionId),
}

impl From<&str> for Target {
    fn from(name: &str) -> Self {
        Target::Room(name.to_string())
    }
}

impl From<String> for Target {
    fn from(name: String) -> Self {
        Target::Room(name)
    }
}

impl From<ConnectionId> for Target {
    fn from(id: ConnectionId) -> Self {
        Target::Connection(id)
    }
}

/// Result of a flush pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    /// Frames handed to transports
    pub frames: usize,
    /// Encoded bytes handed to transports
    pub bytes: usize,
    /// Messages contained in those frames
    pub messages: usize,
}

/// The authoritative world: rooms, entities, connections and message handlers
pub struct World {
    rooms: HashMap<String, Room>,
    entity_rooms: HashMap<EntityId, String>,
    identities: IdentityAllocator,
    sessions: SessionRegistry,
    handlers: HashMap<String, SmallVec<[Handler; 2]>>,
    on_connect: Option<ConnectionHook>,
    on_disconnect: Option<ConnectionHook>,
    decode_failures: u64,
}

impl World {
    pub fn new() -> Self {
        let mut rooms = HashMap::new();
        rooms.insert(DEFAULT_ROOM.to_string(), Room::new(DEFAULT_ROOM));

        Self {
            rooms,
            entity_rooms: HashMap::new(),
            identities: IdentityAllocator::new(),
            sessions: SessionRegistry::new(),
            handlers: HashMap::new(),
            on_connect: None,
            on_disconnect: None,
            decode_failures: 0,
        }
    }

    // ------------------------------------------------------------------
    // Rooms
    // ------------------------------------------------------------------

    /// Create a room
    pub fn create_room(&mut self, name: impl Into<String>) -> Result<&mut Room, WorldError> {
        let name = name.into();
        if name == DEFAULT_ROOM {
            return Err(WorldError::ReservedRoom(name));
        }
        if self.rooms.contains_key(&name) {
            return Err(WorldError::RoomExists(name));
        }

        info!("Room '{}' created", name);
        Ok(self
            .rooms
            .entry(name.clone())
            .or_insert_with(|| Room::new(name)))
    }

    /// Delete a room, removing its entities and moving its subscribers to the default room
    pub fn delete_room(&mut self, name: &str) -> Result<(), WorldError> {
        if name == DEFAULT_ROOM {
            return Err(WorldError::ReservedRoom(name.to_string()));
        }

        let room = self
            .rooms
            .get(name)
            .ok_or_else(|| WorldError::RoomNotFound(name.to_string()))?;
        let entity_ids = room.entity_ids();
        let clients = room.clients().to_vec();

        for id in entity_ids {
            self.remove_entity(id);
        }

        for conn in clients {
            self.join(conn, DEFAULT_ROOM)?;
        }

        self.rooms.remove(name);
        info!("Room '{}' deleted", name);
        Ok(())
    }

    pub fn room(&self, name: &str) -> Option<&Room> {
        self.rooms.get(name)
    }

    /// Run `hook` on the room once per simulation pass, after its entities step
    pub fn set_room_step<F>(&mut self, name: &str, hook: F) -> Result<(), WorldError>
    where
        F: Fn(&mut Room, f64) + Send + Sync + 'static,
    {
        let room = self
            .rooms
            .get_mut(name)
            .ok_or_else(|| WorldError::RoomNotFound(name.to_string()))?;
        room.set_step_hook(hook);
        Ok(())
    }

    pub fn room_mut(&mut self, name: &str) -> Option<&mut Room> {
        self.rooms.get_mut(name)
    }

    pub fn default_room(&self) -> &Room {
        // The default room is inserted in `new` and can never be removed
        &self.rooms[DEFAULT_ROOM]
    }

    pub fn room_names(&self) -> Vec<String> {
        self.rooms.keys().cloned().collect()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    // ------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------

    /// Add an entity to the default room
    pub fn add_entity<E: Entity>(&mut self, kind: impl Into<String>, entity: E) -> EntityId {
        self.insert_record(kind.into(), Box::new(entity), DEFAULT_ROOM.to_string())
    }

    /// Add an entity to a named room
    pub fn add_entity_to<E: Entity>(
        &mut self,
        kind: impl Into<String>,
        entity: E,
        room: &str,
    ) -> Result<EntityId, WorldError> {
        self.add_boxed_entity(kind, Box::new(entity), room)
    }

    /// Add an already boxed entity (e.g. one handed back by `remove_entity`)
    pub fn add_boxed_entity(
        &mut self,
        kind: impl Into<String>,
        entity: Box<dyn Entity>,
        room: &str,
    ) -> Result<EntityId, WorldError> {
        if !self.rooms.contains_key(room) {
            return Err(WorldError::RoomNotFound(room.to_string()));
        }
        Ok(self.insert_record(kind.into(), entity, room.to_string()))
    }

    fn insert_record(&mut self, kind: String, entity: Box<dyn Entity>, room_name: String) -> EntityId {
        let id = self.identities.allocate();
        let record = EntityRecord::new(id, kind, entity);
        let add = delta::add_delta(&record);

        let room = self
            .rooms
            .entry(room_name.clone())
            .or_insert_with(|| Room::new(room_name.clone()));
        room.insert_entity(record);
        room.broadcast(&mut self.sessions, add);

        self.entity_rooms.insert(id, room_name);
        id
    }

    /// Remove an entity, emitting its remove delta and releasing its identity
    ///
    /// Returns the detached entity so it can be re-added later. Removing an
    /// entity that is no longer in the world is a no-op.
    pub fn remove_entity(&mut self, id: EntityId) -> Option<Box<dyn Entity>> {
        let room_name = self.entity_rooms.remove(&id)?;
        let room = self.rooms.get_mut(&room_name)?;
        let record = room.take_entity(id)?;

        room.broadcast(&mut self.sessions, delta::remove_delta(&record));
        self.identities.release(id);

        Some(record.entity)
    }

    /// Move an entity to another room, keeping its identity and state
    ///
    /// Subscribers of the old room see it removed, subscribers of the new room
    /// see it added.
    pub fn move_entity(&mut self, id: EntityId, room: &str) -> Result<(), WorldError> {
        let from = self
            .entity_rooms
            .get(&id)
            .cloned()
            .ok_or(WorldError::EntityNotFound(id))?;
        if !self.rooms.contains_key(room) {
            return Err(WorldError::RoomNotFound(room.to_string()));
        }
        if from == room {
            return Ok(());
        }

        let record = {
            let old = self
                .rooms
                .get_mut(&from)
                .ok_or_else(|| WorldError::RoomNotFound(from.clone()))?;
            let record = old.take_entity(id).ok_or(WorldError::EntityNotFound(id))?;
            old.broadcast(&mut self.sessions, delta::remove_delta(&record));
            record
        };

        let add = delta::add_delta(&record);
        if let Some(new) = self.rooms.get_mut(room) {
            new.insert_entity(record);
            new.broadcast(&mut self.sessions, add);
        }
        self.entity_rooms.insert(id, room.to_string());
        Ok(())
    }

    pub fn entity(&self, id: EntityId) -> Option<&dyn Entity> {
        self.record(id).map(|record| &*record.entity)
    }

    pub fn entity_mut(&mut self, id: EntityId) -> Option<&mut dyn Entity> {
        match self.record_mut(id) {
            Some(record) => Some(&mut *record.entity),
            None => None,
        }
    }

    /// Borrow an entity as its concrete type
    pub fn entity_as<T: Entity>(&self, id: EntityId) -> Option<&T> {
        self.record(id)?.downcast_ref::<T>()
    }

    /// Mutably borrow an entity as its concrete type
    pub fn entity_as_mut<T: Entity>(&mut self, id: EntityId) -> Option<&mut T> {
        self.record_mut(id)?.downcast_mut::<T>()
    }

    /// Type tag the entity was added with
    pub fn entity_kind(&self, id: EntityId) -> Option<&str> {
        self.record(id).map(|record| record.kind.as_str())
    }

    /// Room the entity currently belongs to
    pub fn entity_room(&self, id: EntityId) -> Option<&str> {
        self.entity_rooms.get(&id).map(String::as_str)
    }

    pub fn entity_count(&self) -> usize {
        self.entity_rooms.len()
    }

    fn record(&self, id: EntityId) -> Option<&EntityRecord> {
        let room = self.entity_rooms.get(&id)?;
        self.rooms.get(room)?.get(id)
    }

    fn record_mut(&mut self, id: EntityId) -> Option<&mut EntityRecord> {
        let room = self.entity_rooms.get(&id)?;
        self.rooms.get_mut(room)?.get_mut(id)
    }

    // ------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------

    /// Register a handler for inbound messages of `kind`
    ///
    /// Handlers for the same type run in registration order.
    pub fn on<F>(&mut self, kind: impl Into<String>, handler: F)
    where
        F: Fn(&mut World, ConnectionId, &Value) + Send + Sync + 'static,
    {
        self.handlers
            .entry(kind.into())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Queue a message for every connection in every room
    pub fn emit(&mut self, kind: impl Into<String>, data: Value) {
        let envelope = Envelope::new(kind, data);
        for room in self.rooms.values() {
            room.broadcast(&mut self.sessions, envelope.clone());
        }
    }

    /// Queue a message for one room or one connection
    pub fn emit_to(
        &mut self,
        target: impl Into<Target>,
        kind: impl Into<String>,
        data: Value,
    ) -> Result<(), WorldError> {
        let envelope = Envelope::new(kind, data);

        match target.into() {
            Target::Room(name) => {
                let room = self
                    .rooms
                    .get(&name)
                    .ok_or(WorldError::RoomNotFound(name))?;
                room.broadcast(&mut self.sessions, envelope);
            }
            Target::Connection(id) => {
                if !self.sessions.enqueue(id, envelope) {
                    debug!("emit_to: connection {} already gone", id);
                }
            }
        }

        Ok(())
    }

    /// Decode an inbound frame and dispatch every message in it
    ///
    /// A frame that fails to decode is dropped; the connection stays open.
    /// Returns the number of messages dispatched.
    pub fn receive(&mut self, conn: ConnectionId, frame: &[u8]) -> usize {
        let messages = match protocol::decode(frame) {
            Ok(messages) => messages,
            Err(e) => {
                self.decode_failures += 1;
                warn!("Dropping malformed frame from {}: {}", conn, e);
                return 0;
            }
        };

        if let Some(session) = self.sessions.get_mut(conn) {
            session.record_received(frame.len(), messages.len());
        }

        let count = messages.len();
        for envelope in messages {
            self.dispatch(conn, envelope);
        }
        count
    }

    /// Run every handler registered for the message type
    pub fn dispatch(&mut self, conn: ConnectionId, envelope: Envelope) {
        let handlers = match self.handlers.get(&envelope.kind) {
            Some(handlers) => handlers.clone(),
            None => {
                debug!("No handler for message type '{}'", envelope.kind);
                return;
            }
        };

        for handler in handlers {
            handler(self, conn, &envelope.data);
        }
    }

    /// Frames that failed to decode since the world was created
    pub fn decode_failures(&self) -> u64 {
        self.decode_failures
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    pub fn set_on_connect<F>(&mut self, hook: F)
    where
        F: Fn(&mut World, ConnectionId) + Send + Sync + 'static,
    {
        self.on_connect = Some(Arc::new(hook));
    }

    pub fn set_on_disconnect<F>(&mut self, hook: F)
    where
        F: Fn(&mut World, ConnectionId) + Send + Sync + 'static,
    {
        self.on_disconnect = Some(Arc::new(hook));
    }

    /// Open a session with a freshly allocated connection ID
    pub fn connect(&mut self, sink: impl FrameSink + 'static) -> ConnectionId {
        let id = self.sessions.allocate_id();
        self.open_session(id, Box::new(sink));
        id
    }

    /// Open a session for a transport-assigned connection ID
    ///
    /// The on-connect hook runs first, then the connection joins the default
    /// room and receives an add delta for every entity already there. A hook
    /// that moves or closes the connection skips the default join.
    pub fn open_session(&mut self, id: ConnectionId, sink: Box<dyn FrameSink>) {
        if self.sessions.contains(id) {
            warn!("Connection {} opened twice, replacing stale session", id);
            self.close_session(id);
        }

        self.sessions.insert(ConnectionSession::new(id, DEFAULT_ROOM, sink));
        debug!("Connection {} opened", id);

        if let Some(hook) = self.on_connect.clone() {
            hook(self, id);
        }

        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        if session.room() != DEFAULT_ROOM {
            return;
        }
        if let Some(room) = self.rooms.get_mut(DEFAULT_ROOM) {
            if !room.has_client(id) {
                room.add_client(session);
            }
        }
    }

    /// Close a session. Closing an unknown connection is a no-op.
    pub fn disconnect(&mut self, id: ConnectionId) {
        if !self.sessions.contains(id) {
            return;
        }

        if let Some(hook) = self.on_disconnect.clone() {
            hook(self, id);
        }
        self.close_session(id);
        debug!("Connection {} closed", id);
    }

    fn close_session(&mut self, id: ConnectionId) {
        let Some(mut session) = self.sessions.remove(id) else {
            return;
        };

        match self.rooms.get_mut(session.room()) {
            Some(room) => room.remove_client(&mut session),
            None => {
                for room in self.rooms.values_mut() {
                    room.forget_client(id);
                }
            }
        }
    }

    /// Move a connection into another room
    ///
    /// The old room queues a remove delta per entity, the new room an add
    /// delta per live entity. Fails without touching membership when the
    /// destination does not exist.
    pub fn join(&mut self, conn: ConnectionId, room: &str) -> Result<(), WorldError> {
        if !self.rooms.contains_key(room) {
            return Err(WorldError::RoomNotFound(room.to_string()));
        }
        let Some(session) = self.sessions.get_mut(conn) else {
            debug!("join: connection {} already gone", conn);
            return Ok(());
        };

        let old = session.room().to_string();
        // Not yet subscribed while the on-connect hook runs, so nothing to tear down
        if let Some(old_room) = self.rooms.get_mut(&old).filter(|r| r.has_client(conn)) {
            old_room.remove_client(session);
        }
        if let Some(new_room) = self.rooms.get_mut(room) {
            new_room.add_client(session);
        }

        debug!("Connection {} moved from '{}' to '{}'", conn, old, room);
        Ok(())
    }

    /// Room the connection is currently subscribed to
    pub fn room_of(&self, conn: ConnectionId) -> Option<&str> {
        self.sessions.get(conn).map(ConnectionSession::room)
    }

    pub fn session(&self, conn: ConnectionId) -> Option<&ConnectionSession> {
        self.sessions.get(conn)
    }

    pub fn connection_count(&self) -> usize {
        self.sessions.count()
    }

    /// Apply an event coming from a transport task
    pub fn handle_event(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::Opened { id, sink } => self.open_session(id, sink),
            InboundEvent::Frame { id, bytes } => {
                self.receive(id, &bytes);
            }
            InboundEvent::Closed { id } => self.disconnect(id),
        }
    }

    // ------------------------------------------------------------------
    // Ticks
    // ------------------------------------------------------------------

    /// Step every entity by `dt` nominal frames, run room hooks, then reap the dead ones
    pub fn simulate(&mut self, dt: f64) {
        let mut dead = Vec::new();
        for room in self.rooms.values_mut() {
            dead.extend(room.step(dt));
        }

        for id in dead {
            self.remove_entity(id);
        }
    }

    /// Queue each room's update batch, then send every non-empty queue as one frame
    pub fn flush(&mut self) -> FlushReport {
        for room in self.rooms.values() {
            if let Some(batch) = room.update_batch() {
                room.broadcast(&mut self.sessions, batch);
            }
        }

        let mut report = FlushReport::default();
        for session in self.sessions.iter_mut() {
            if !session.has_pending() || !session.is_open() {
                continue;
            }

            let batch = session.take_queue();
            let frame = match protocol::encode(&batch) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Dropping {} messages for {}: {}", batch.len(), session.id, e);
                    continue;
                }
            };

            let bytes = frame.len();
            match session.send_frame(frame) {
                Ok(()) => {
                    report.frames += 1;
                    report.bytes += bytes;
                    report.messages += batch.len();
                }
                Err(e) => {
                    warn!("Flush to {} failed, keeping {} messages: {}", session.id, batch.len(), e);
                    session.restore_queue(batch);
                }
            }
        }

        report
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

/// World errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorldError {
    #[error("Room '{0}' already exists")]
    RoomExists(String),
    #[error("Room '{0}' is reserved")]
    ReservedRoom(String),
    #[error("Room '{0}' not found")]
    RoomNotFound(String),
    #[error("Entity {0} not found")]
    EntityNotFound(EntityId),
}
