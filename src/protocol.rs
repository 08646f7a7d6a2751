//! Binary wire protocol for the collaborative knowledge tree.
//!
//! Every frame on the real-time channel is a bincode-encoded [`WireMessage`]:
//! ```text
//! ┌──────────┬────────────────────────────┐
//! │ event    │ payload                    │
//! │ 1 byte   │ variable (bincode-encoded) │
//! └──────────┴────────────────────────────┘
//! ```
//!
//! Payload shapes are typed per event: presence events carry [`Identity`]
//! values, document events carry opaque CRDT update bytes, and structural
//! events carry full node records so every client can refresh its tree view
//! without a re-fetch.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::NodeRecord;

/// Event types on the real-time channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventType {
    /// Server → client: the identity assigned to this connection
    ConnectionOpen = 1,
    /// Server → all: the complete ordered roster of connected clients
    RosterUpdate = 2,
    /// Client → server: rename this client
    SetName = 3,
    /// Client → server: join a node's editing room
    JoinNode = 4,
    /// Server → client: full replica snapshot for a joined node
    NodeSync = 5,
    /// Client → server: leave a node's editing room
    LeaveNode = 6,
    /// Server → room: a peer joined the room
    PeerJoined = 7,
    /// Server → room: a peer left the room
    PeerLeft = 8,
    /// Bidirectional: incremental CRDT update for one node
    DocumentUpdate = 9,
    /// Server → sender: an update could not be decoded and was dropped
    UpdateRejected = 10,
    /// Client → server → room: live cursor position (never persisted)
    CursorUpdate = 11,
    /// Server → all: a node was created
    NodeCreated = 12,
    /// Server → all: a node row changed
    NodeUpdated = 13,
    /// Server → all: a subtree was removed
    NodeDeleted = 14,
    /// Server → all: the server is going down
    ServerShutdown = 15,
    /// Server → room: cursor fan-out tagged with the moving client
    CursorBroadcast = 16,
}

/// 2D cursor position in canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPos {
    pub x: f32,
    pub y: f32,
}

impl CursorPos {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// A connected client as seen by every other client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: Uuid,
    pub name: String,
    /// Hex color assigned from the fixed palette at connect time
    pub color: String,
    /// Node this client is currently editing (at most one)
    pub current_node: Option<String>,
    /// Last known cursor position; presence-only, never persisted
    pub cursor: Option<CursorPos>,
}

/// Join request / sync response pairing for one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSync {
    pub node_id: String,
    /// Full encoded replica state for local hydration
    pub state: Vec<u8>,
}

/// Incremental CRDT update for one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentUpdate {
    pub node_id: String,
    /// Opaque encoded update; merged order-independently
    pub update: Vec<u8>,
}

/// Explicit rejection returned to the sender of an undecodable update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRejected {
    pub node_id: String,
    pub reason: String,
}

/// Client → server cursor report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorUpdate {
    pub node_id: String,
    pub cursor: CursorPos,
}

/// Server → room cursor fan-out, tagged with the moving client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorBroadcast {
    pub node_id: String,
    pub client: Identity,
    pub cursor: CursorPos,
}

/// Deletion notification carrying every removed id, top-level id first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDeleted {
    pub removed: Vec<String>,
}

/// Top-level protocol frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub event: EventType,
    /// Event-specific payload (bincode-encoded)
    pub payload: Vec<u8>,
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode_payload<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}

impl WireMessage {
    fn with_payload<T: Serialize>(event: EventType, payload: &T) -> Result<Self, ProtocolError> {
        Ok(Self {
            event,
            payload: encode_payload(payload)?,
        })
    }

    pub fn connection_open(identity: &Identity) -> Result<Self, ProtocolError> {
        Self::with_payload(EventType::ConnectionOpen, identity)
    }

    pub fn roster_update(roster: &[Identity]) -> Result<Self, ProtocolError> {
        Self::with_payload(EventType::RosterUpdate, &roster.to_vec())
    }

    pub fn set_name(name: impl Into<String>) -> Result<Self, ProtocolError> {
        Self::with_payload(EventType::SetName, &name.into())
    }

    pub fn join_node(node_id: impl Into<String>) -> Result<Self, ProtocolError> {
        Self::with_payload(EventType::JoinNode, &node_id.into())
    }

    pub fn leave_node(node_id: impl Into<String>) -> Result<Self, ProtocolError> {
        Self::with_payload(EventType::LeaveNode, &node_id.into())
    }

    pub fn node_sync(node_id: impl Into<String>, state: Vec<u8>) -> Result<Self, ProtocolError> {
        Self::with_payload(
            EventType::NodeSync,
            &NodeSync {
                node_id: node_id.into(),
                state,
            },
        )
    }

    pub fn peer_joined(identity: &Identity) -> Result<Self, ProtocolError> {
        Self::with_payload(EventType::PeerJoined, identity)
    }

    pub fn peer_left(identity: &Identity) -> Result<Self, ProtocolError> {
        Self::with_payload(EventType::PeerLeft, identity)
    }

    pub fn document_update(
        node_id: impl Into<String>,
        update: Vec<u8>,
    ) -> Result<Self, ProtocolError> {
        Self::with_payload(
            EventType::DocumentUpdate,
            &DocumentUpdate {
                node_id: node_id.into(),
                update,
            },
        )
    }

    pub fn update_rejected(
        node_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<Self, ProtocolError> {
        Self::with_payload(
            EventType::UpdateRejected,
            &UpdateRejected {
                node_id: node_id.into(),
                reason: reason.into(),
            },
        )
    }

    pub fn cursor_update(
        node_id: impl Into<String>,
        cursor: CursorPos,
    ) -> Result<Self, ProtocolError> {
        Self::with_payload(
            EventType::CursorUpdate,
            &CursorUpdate {
                node_id: node_id.into(),
                cursor,
            },
        )
    }

    pub fn cursor_broadcast(
        node_id: impl Into<String>,
        client: &Identity,
        cursor: CursorPos,
    ) -> Result<Self, ProtocolError> {
        Self::with_payload(
            EventType::CursorBroadcast,
            &CursorBroadcast {
                node_id: node_id.into(),
                client: client.clone(),
                cursor,
            },
        )
    }

    pub fn node_created(record: &NodeRecord) -> Result<Self, ProtocolError> {
        Self::with_payload(EventType::NodeCreated, record)
    }

    pub fn node_updated(record: &NodeRecord) -> Result<Self, ProtocolError> {
        Self::with_payload(EventType::NodeUpdated, record)
    }

    pub fn node_deleted(removed: Vec<String>) -> Result<Self, ProtocolError> {
        Self::with_payload(EventType::NodeDeleted, &NodeDeleted { removed })
    }

    pub fn server_shutdown(message: impl Into<String>) -> Result<Self, ProtocolError> {
        Self::with_payload(EventType::ServerShutdown, &message.into())
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    fn expect(&self, event: EventType) -> Result<(), ProtocolError> {
        if self.event != event {
            return Err(ProtocolError::InvalidEventType);
        }
        Ok(())
    }

    /// Parse an identity payload (ConnectionOpen, PeerJoined, PeerLeft).
    pub fn identity(&self) -> Result<Identity, ProtocolError> {
        match self.event {
            EventType::ConnectionOpen | EventType::PeerJoined | EventType::PeerLeft => {
                decode_payload(&self.payload)
            }
            _ => Err(ProtocolError::InvalidEventType),
        }
    }

    /// Parse a roster payload.
    pub fn roster(&self) -> Result<Vec<Identity>, ProtocolError> {
        self.expect(EventType::RosterUpdate)?;
        decode_payload(&self.payload)
    }

    /// Parse a bare string payload (SetName, JoinNode, LeaveNode, ServerShutdown).
    pub fn text(&self) -> Result<String, ProtocolError> {
        match self.event {
            EventType::SetName
            | EventType::JoinNode
            | EventType::LeaveNode
            | EventType::ServerShutdown => decode_payload(&self.payload),
            _ => Err(ProtocolError::InvalidEventType),
        }
    }

    pub fn node_sync_payload(&self) -> Result<NodeSync, ProtocolError> {
        self.expect(EventType::NodeSync)?;
        decode_payload(&self.payload)
    }

    pub fn document_update_payload(&self) -> Result<DocumentUpdate, ProtocolError> {
        self.expect(EventType::DocumentUpdate)?;
        decode_payload(&self.payload)
    }

    pub fn update_rejected_payload(&self) -> Result<UpdateRejected, ProtocolError> {
        self.expect(EventType::UpdateRejected)?;
        decode_payload(&self.payload)
    }

    pub fn cursor_update_payload(&self) -> Result<CursorUpdate, ProtocolError> {
        self.expect(EventType::CursorUpdate)?;
        decode_payload(&self.payload)
    }

    pub fn cursor_broadcast_payload(&self) -> Result<CursorBroadcast, ProtocolError> {
        self.expect(EventType::CursorBroadcast)?;
        decode_payload(&self.payload)
    }

    /// Parse a node record payload (NodeCreated, NodeUpdated).
    pub fn node_record(&self) -> Result<NodeRecord, ProtocolError> {
        match self.event {
            EventType::NodeCreated | EventType::NodeUpdated => decode_payload(&self.payload),
            _ => Err(ProtocolError::InvalidEventType),
        }
    }

    pub fn node_deleted_payload(&self) -> Result<NodeDeleted, ProtocolError> {
        self.expect(EventType::NodeDeleted)?;
        decode_payload(&self.payload)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidEventType,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidEventType => write!(f, "Invalid event type"),
        }
    }
}

impl std::error::Error for ProtocolError {}
