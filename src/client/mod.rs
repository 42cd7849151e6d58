//! Client-side entity mirror

pub mod mirror;

pub use mirror::{BoundInstance, ClientMirror, Instance, CLIENT_FRAME_RATE};
