use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::world::identity::EntityId;

/// Message type of an entity-added envelope
pub const ADD: &str = "a";
/// Message type of a batched entity-update envelope
pub const UPDATE: &str = "u";
/// Message type of an entity-removed envelope
pub const REMOVE: &str = "r";

/// Check whether a message type is reserved for entity deltas
pub fn is_reserved(kind: &str) -> bool {
    matches!(kind, ADD | UPDATE | REMOVE)
}

/// A single message on the wire: `{t: <type>, d: <payload>}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "t")]
    pub kind: String,
    #[serde(rename = "d", default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    /// `{t: "a", d: {t, id, d}}`
    pub fn add(packet: EntityPacket) -> Self {
        Self::new(ADD, packet.into_value())
    }

    /// `{t: "r", d: {t, id, d}}`
    pub fn remove(packet: EntityPacket) -> Self {
        Self::new(REMOVE, packet.into_value())
    }

    /// `{t: "u", d: [{t, id, d}, ...]}`
    pub fn update(rows: Vec<EntityPacket>) -> Self {
        Self::new(
            UPDATE,
            Value::Array(rows.into_iter().map(EntityPacket::into_value).collect()),
        )
    }
}

/// Per-entity delta payload: `{t: <entityType>, id: <int>, d: <payload>}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityPacket {
    #[serde(rename = "t")]
    pub kind: String,
    pub id: EntityId,
    #[serde(rename = "d", default)]
    pub data: Value,
}

impl EntityPacket {
    pub fn new(kind: impl Into<String>, id: EntityId, data: Value) -> Self {
        Self {
            kind: kind.into(),
            id,
            data,
        }
    }

    pub fn into_value(self) -> Value {
        json!({ "t": self.kind, "id": self.id, "d": self.data })
    }

    /// Parse a packet out of an envelope payload
    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        serde_json::from_value(value).map_err(|e| DecodeError(e.to_string()))
    }
}

/// Encode a batch of envelopes as one MessagePack frame
///
/// Envelopes are written as maps so the frame stays readable by msgpack
/// clients that index fields by name.
pub fn encode(batch: &[Envelope]) -> Result<Vec<u8>, EncodeError> {
    rmp_serde::to_vec_named(batch).map_err(|e| EncodeError(e.to_string()))
}

/// Decode one MessagePack frame into its envelopes
pub fn decode(data: &[u8]) -> Result<Vec<Envelope>, DecodeError> {
    rmp_serde::from_slice(data).map_err(|e| DecodeError(e.to_string()))
}

#[derive(Debug, thiserror::Error)]
#[error("Encode error: {0}")]
pub struct EncodeError(String);

#[derive(Debug, thiserror::Error)]
#[error("Decode error: {0}")]
pub struct DecodeError(String);
