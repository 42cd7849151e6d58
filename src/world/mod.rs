//! Authoritative world state
//!
//! Rooms own entities, connections subscribe to exactly one room, and the
//! scheduler drives simulation and flush ticks over the whole world.

pub mod entity;
pub mod identity;
pub mod room;
pub mod scheduler;
pub mod server;

pub use entity::{AsAny, Entity, EntityRecord};
pub use identity::{EntityId, IdentityAllocator};
pub use room::{Room, RoomHook};
pub use scheduler::{normalized_dt, Scheduler, TickClock};
pub use server::{FlushReport, Target, World, WorldError, DEFAULT_ROOM};
