//! Networking: wire protocol, delta derivation, sessions and the WebTransport server

pub mod connection;
pub mod delta;
pub mod framing;
pub mod inbound;
pub mod protocol;
pub mod tls;
pub mod transport;

pub use connection::{ConnectionId, ConnectionSession, FrameSink, SendError, SessionRegistry};
pub use inbound::{InboundBuffer, InboundEvent, InboundSender};
pub use protocol::{decode, encode, EntityPacket, Envelope};
