//! Lock-free inbound event buffer
//!
//! Transport tasks never touch the world. They push connection events into a
//! crossbeam channel and the scheduler task drains it before every tick.

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::net::connection::{ConnectionId, FrameSink};

/// Event produced by a transport task
pub enum InboundEvent {
    /// A peer finished its handshake; frames for it go to `sink`
    Opened {
        id: ConnectionId,
        sink: Box<dyn FrameSink>,
    },
    /// One encoded frame arrived from the peer
    Frame { id: ConnectionId, bytes: Vec<u8> },
    /// The transport closed, for whatever reason
    Closed { id: ConnectionId },
}

impl InboundEvent {
    pub fn connection(&self) -> ConnectionId {
        match self {
            InboundEvent::Opened { id, .. }
            | InboundEvent::Frame { id, .. }
            | InboundEvent::Closed { id } => *id,
        }
    }
}

impl std::fmt::Debug for InboundEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InboundEvent::Opened { id, .. } => f.debug_struct("Opened").field("id", id).finish(),
            InboundEvent::Frame { id, bytes } => f
                .debug_struct("Frame")
                .field("id", id)
                .field("len", &bytes.len())
                .finish(),
            InboundEvent::Closed { id } => f.debug_struct("Closed").field("id", id).finish(),
        }
    }
}

/// Multi-producer buffer drained by the world's owning task
///
/// Unbounded: inbound order is preserved and a slow tick never makes a
/// transport task drop a frame.
pub struct InboundBuffer {
    sender: Sender<InboundEvent>,
    receiver: Receiver<InboundEvent>,
}

impl InboundBuffer {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }

    /// Create a sender handle for a transport task
    pub fn sender(&self) -> InboundSender {
        InboundSender {
            sender: self.sender.clone(),
        }
    }

    /// Drain every pending event, oldest first
    pub fn drain(&self) -> Vec<InboundEvent> {
        self.receiver.try_iter().collect()
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.receiver.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

impl Default for InboundBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Clonable sender handle for transport tasks
#[derive(Clone)]
pub struct InboundSender {
    sender: Sender<InboundEvent>,
}

impl InboundSender {
    pub fn opened(&self, id: ConnectionId, sink: Box<dyn FrameSink>) -> Result<(), InboundError> {
        self.send(InboundEvent::Opened { id, sink })
    }

    pub fn frame(&self, id: ConnectionId, bytes: Vec<u8>) -> Result<(), InboundError> {
        self.send(InboundEvent::Frame { id, bytes })
    }

    pub fn closed(&self, id: ConnectionId) -> Result<(), InboundError> {
        self.send(InboundEvent::Closed { id })
    }

    #[inline]
    pub fn send(&self, event: InboundEvent) -> Result<(), InboundError> {
        self.sender
            .send(event)
            .map_err(|_| InboundError::Disconnected)
    }
}

/// Inbound buffer errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InboundError {
    /// The owning task dropped the buffer
    #[error("Inbound buffer disconnected")]
    Disconnected,
}
