//! # arbor-collab — Real-time sync core for a collaborative knowledge tree
//!
//! Multiple clients edit a tree of knowledge nodes together: node documents
//! merge confluent CRDT updates, presence (names, colors, cursors) fans out
//! live, and dirty documents are persisted on a debounced quiet-period timer.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket       ┌──────────────────────┐
//! │   Client    │ ◄─────────────────► │    CollabServer      │
//! │ (per user)  │    Binary Proto     │                      │
//! └─────────────┘                     │  ConnectionRegistry  │
//!                                     │  RoomRouter          │
//!                                     │  DocumentReplicaStore│
//!                                     │  PersistenceCoalescer│
//!                                     │  TreeMutation-       │
//!                                     │     Coordinator      │
//!                                     └──────────┬───────────┘
//!                                                │
//!                                                ▼
//!                                     ┌──────────────────────┐
//!                                     │      TreeStore       │
//!                                     │ rows + tag catalog   │
//!                                     │ snapshot file (LZ4)  │
//!                                     └──────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded WireMessage)
//! - [`registry`] — Connected-client identities, roster, outbound senders
//! - [`rooms`] — Per-node subscriber rooms and room-scoped fan-out
//! - [`replica`] — Per-node Yrs replicas with lazy hydration and eviction
//! - [`coalescer`] — Debounced quiet-period persistence of dirty replicas
//! - [`tree`] — Structural create/update/delete with global broadcasts
//! - [`store`] — In-memory row store with whole-store snapshot durability
//! - [`server`] — WebSocket server wiring everything together

pub mod coalescer;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod replica;
pub mod rooms;
pub mod server;
pub mod store;
pub mod tree;

// Re-exports for convenience
pub use coalescer::PersistenceCoalescer;
pub use error::CoreError;
pub use protocol::{
    CursorBroadcast, CursorPos, CursorUpdate, DocumentUpdate, EventType, Identity, NodeDeleted,
    NodeSync, ProtocolError, UpdateRejected, WireMessage,
};
pub use registry::{ClientSender, ConnectionRegistry, PALETTE};
pub use replica::{ContentPayload, DocumentReplicaStore};
pub use rooms::RoomRouter;
pub use server::{CollabServer, ServerConfig};
pub use store::{
    NodePatch, NodeRecord, NodeRow, SearchHit, StoreConfig, StoreError, TreeStore, DEFAULT_TITLE,
    EMPTY_DOC,
};
pub use tree::{CreateNode, TreeMutationCoordinator};
