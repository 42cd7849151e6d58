//! Entity capability interface
//!
//! Every capability is optional: an entity implements only the hooks it needs
//! and the defaults mean "absent".

use std::any::Any;

use serde_json::Value;

use crate::world::identity::EntityId;

/// Downcasting support for trait objects stored by the world and the mirror
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A server-owned object visible to clients through delta messages
pub trait Entity: AsAny + Send {
    /// Payload sent with the `a` message. `None` sends a null payload.
    fn add_packet(&self) -> Option<Value> {
        None
    }

    /// Payload sent in the `u` batch. `None` keeps the entity out of the batch.
    fn update_packet(&self) -> Option<Value> {
        None
    }

    /// Payload sent with the `r` message. `None` sends a null payload.
    fn remove_packet(&self) -> Option<Value> {
        None
    }

    /// Advance the entity by `dt` nominal frames
    fn step(&mut self, _dt: f64) {}

    /// Entities reporting `true` are removed on the next simulation tick
    fn is_dead(&self) -> bool {
        false
    }
}

/// An entity bound to a room, with the identity and type tag assigned on insertion
pub struct EntityRecord {
    pub id: EntityId,
    pub kind: String,
    pub entity: Box<dyn Entity>,
}

impl EntityRecord {
    pub fn new(id: EntityId, kind: String, entity: Box<dyn Entity>) -> Self {
        Self { id, kind, entity }
    }

    pub fn is_dead(&self) -> bool {
        self.entity.is_dead()
    }

    /// Downcast to the concrete entity type
    pub fn downcast_ref<T: Entity>(&self) -> Option<&T> {
        let entity: &dyn Entity = &*self.entity;
        entity.as_any().downcast_ref::<T>()
    }

    /// Downcast to the concrete entity type (mutable)
    pub fn downcast_mut<T: Entity>(&mut self) -> Option<&mut T> {
        let entity: &mut dyn Entity = &mut *self.entity;
        entity.as_any_mut().downcast_mut::<T>()
    }
}

impl std::fmt::Debug for EntityRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityRecord")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}
