//! Glue Sync Server Library
//!
//! A room-based real-time state synchronization engine. Entities live in
//! named rooms, connections subscribe to one room at a time, and a dual-rate
//! scheduler steps the simulation and flushes quantized add/update/remove
//! deltas to every subscriber over WebTransport.
//!
//! # Features
//!
//! - `client` - Client-side mirror that applies delta batches to linked instances (enabled by default)

pub mod config;
pub mod metrics;
pub mod net;
pub mod world;

#[cfg(feature = "client")]
pub mod client;

pub use config::SyncConfig;
pub use net::protocol::{EntityPacket, Envelope};
pub use world::{Entity, EntityId, Room, Scheduler, World, WorldError, DEFAULT_ROOM};
