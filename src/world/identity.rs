//! Entity identity allocation
//!
//! Identities ride over the wire on every add/update/remove message, so the
//! allocator keeps the identifier space compact: a released identity below the
//! cursor becomes the next candidate.

use hashbrown::HashSet;

/// Entity identifier as sent to clients
pub type EntityId = u32;

/// Issues and recycles small integer entity identities
#[derive(Debug, Default)]
pub struct IdentityAllocator {
    /// Next candidate identity
    cursor: EntityId,
    /// Identities currently assigned to live entities
    assigned: HashSet<EntityId>,
}

impl IdentityAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the lowest unused identity
    pub fn allocate(&mut self) -> EntityId {
        while self.assigned.contains(&self.cursor) {
            self.cursor += 1;
        }

        let id = self.cursor;
        self.assigned.insert(id);
        self.cursor += 1;
        id
    }

    /// Release an identity so it can be reused
    ///
    /// Releasing an identity that is not assigned is a no-op.
    pub fn release(&mut self, id: EntityId) {
        if !self.assigned.remove(&id) {
            return;
        }

        if id < self.cursor {
            self.cursor = id;
        }
    }

    /// Check whether an identity is currently assigned
    pub fn is_allocated(&self, id: EntityId) -> bool {
        self.assigned.contains(&id)
    }

    /// Number of assigned identities
    pub fn len(&self) -> usize {
        self.assigned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assigned.is_empty()
    }
}
