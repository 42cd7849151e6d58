use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::mpsc::UnboundedSender;

use crate::net::protocol::Envelope;

/// Transport connection identifier
pub type ConnectionId = u64;

/// Outbound half of a transport connection
///
/// Implemented by whatever actually moves an encoded frame toward the peer.
/// The world never writes to the network itself, it only hands whole frames
/// to a sink.
pub trait FrameSink: Send {
    /// Whether the underlying transport can still accept frames
    fn is_open(&self) -> bool;

    /// Hand one encoded frame to the transport
    fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), SendError>;
}

impl FrameSink for UnboundedSender<Vec<u8>> {
    fn is_open(&self) -> bool {
        !self.is_closed()
    }

    fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), SendError> {
        self.send(frame).map_err(|_| SendError::Closed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("Transport closed")]
    Closed,
}

/// Per-connection state: room membership and the queue of unsent messages
pub struct ConnectionSession {
    pub id: ConnectionId,
    room: String,
    outbound: Vec<Envelope>,
    sink: Box<dyn FrameSink>,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub frames_sent: u64,
    pub messages_received: u64,
}

impl ConnectionSession {
    pub fn new(id: ConnectionId, room: impl Into<String>, sink: Box<dyn FrameSink>) -> Self {
        let now = Instant::now();
        Self {
            id,
            room: room.into(),
            outbound: Vec::new(),
            sink,
            created_at: now,
            last_activity: now,
            bytes_sent: 0,
            bytes_received: 0,
            frames_sent: 0,
            messages_received: 0,
        }
    }

    /// Name of the room this connection is subscribed to
    pub fn room(&self) -> &str {
        &self.room
    }

    pub(crate) fn set_room(&mut self, room: impl Into<String>) {
        self.room = room.into();
    }

    /// Queue a message for the next flush
    pub fn enqueue(&mut self, envelope: Envelope) {
        self.outbound.push(envelope);
    }

    /// Messages waiting for the next flush, oldest first
    pub fn queued(&self) -> &[Envelope] {
        &self.outbound
    }

    pub fn has_pending(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Take the whole queue, leaving it empty
    pub fn take_queue(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.outbound)
    }

    /// Put an unsent batch back ahead of anything queued since it was taken
    pub fn restore_queue(&mut self, mut batch: Vec<Envelope>) {
        batch.append(&mut self.outbound);
        self.outbound = batch;
    }

    pub fn is_open(&self) -> bool {
        self.sink.is_open()
    }

    /// Send an encoded frame and record it
    pub fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), SendError> {
        let len = frame.len();
        self.sink.send_frame(frame)?;
        self.record_sent(len);
        Ok(())
    }

    /// Update last activity timestamp
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Record bytes sent
    pub fn record_sent(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
        self.frames_sent += 1;
    }

    /// Record an inbound frame and the number of messages it held
    pub fn record_received(&mut self, bytes: usize, messages: usize) {
        self.bytes_received += bytes as u64;
        self.messages_received += messages as u64;
        self.touch();
    }
}

impl std::fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("id", &self.id)
            .field("room", &self.room)
            .field("queued", &self.outbound.len())
            .field("open", &self.sink.is_open())
            .finish()
    }
}

/// All live connection sessions
#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<ConnectionId, ConnectionSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick an unused random connection ID
    pub fn allocate_id(&self) -> ConnectionId {
        loop {
            let candidate = rand::random::<ConnectionId>();
            if !self.sessions.contains_key(&candidate) {
                break candidate;
            }
        }
    }

    /// Insert a session, replacing any stale one with the same ID
    pub fn insert(&mut self, session: ConnectionSession) -> Option<ConnectionSession> {
        self.sessions.insert(session.id, session)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&ConnectionSession> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut ConnectionSession> {
        self.sessions.get_mut(&id)
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<ConnectionSession> {
        self.sessions.remove(&id)
    }

    /// Queue a message on one connection. Unknown connections are ignored.
    pub fn enqueue(&mut self, id: ConnectionId, envelope: Envelope) -> bool {
        match self.sessions.get_mut(&id) {
            Some(session) => {
                session.enqueue(envelope);
                true
            }
            None => false,
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectionSession> {
        self.sessions.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ConnectionSession> {
        self.sessions.values_mut()
    }
}
