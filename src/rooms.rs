//! Per-node subscriber rooms.
//!
//! A room is the set of clients currently viewing/editing one node. The
//! router keeps membership consistent with the registry (a client is in at
//! most one room; a disconnect is an implicit leave) and routes room-scoped
//! fan-out through the registry's per-client senders.
//!
//! `evict_room` exists for structural deletes: nobody keeps editing a node
//! that no longer exists.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::CoreError;
use crate::registry::ConnectionRegistry;
use crate::replica::DocumentReplicaStore;
use crate::protocol::WireMessage;

/// Node id → members.
pub struct RoomRouter {
    rooms: RwLock<HashMap<String, HashSet<Uuid>>>,
    registry: Arc<ConnectionRegistry>,
    replicas: Arc<DocumentReplicaStore>,
}

impl RoomRouter {
    pub fn new(registry: Arc<ConnectionRegistry>, replicas: Arc<DocumentReplicaStore>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            registry,
            replicas,
        }
    }

    /// Join a client to a node's room.
    ///
    /// Leaves the previous room first (at most one room per client), notifies
    /// existing members of the join, and returns the full encoded replica
    /// state so the joiner can hydrate locally.
    pub async fn join(&self, client_id: &Uuid, node_id: &str) -> Result<Vec<u8>, CoreError> {
        let identity = self
            .registry
            .identity(client_id)
            .await
            .ok_or_else(|| CoreError::NotFound(client_id.to_string()))?;

        if let Some(previous) = identity.current_node.clone() {
            if previous != node_id {
                self.leave(client_id, &previous).await;
            }
        }

        let newly_joined = {
            let mut rooms = self.rooms.write().await;
            rooms
                .entry(node_id.to_string())
                .or_default()
                .insert(*client_id)
        };
        self.registry
            .set_current_node(client_id, Some(node_id.to_string()))
            .await;

        // Notify peers, excluding the joiner; a rejoin of the same room is
        // a no-op for everyone else
        if newly_joined {
            log::info!("Client {} joined room {node_id}", identity.name);
            let mut joined = identity.clone();
            joined.current_node = Some(node_id.to_string());
            if let Ok(frame) = WireMessage::peer_joined(&joined).and_then(|m| m.encode()) {
                self.broadcast_to_room(node_id, Arc::new(frame), Some(client_id))
                    .await;
            }
        }

        self.replicas.encode_full_state(node_id).await
    }

    /// Remove a client from a room and notify the remaining peers.
    pub async fn leave(&self, client_id: &Uuid, node_id: &str) {
        let was_member = {
            let mut rooms = self.rooms.write().await;
            match rooms.get_mut(node_id) {
                Some(members) => {
                    let removed = members.remove(client_id);
                    if members.is_empty() {
                        rooms.remove(node_id);
                    }
                    removed
                }
                None => false,
            }
        };
        if !was_member {
            return;
        }

        let identity = self.registry.identity(client_id).await;
        self.registry.set_current_node(client_id, None).await;

        if let Some(identity) = identity {
            log::info!("Client {} left room {node_id}", identity.name);
            if let Ok(frame) = WireMessage::peer_left(&identity).and_then(|m| m.encode()) {
                self.broadcast_to_room(node_id, Arc::new(frame), Some(client_id))
                    .await;
            }
        }
    }

    /// Treat a disconnect as an implicit leave of the client's current room.
    /// Returns the room left, if any.
    pub async fn disconnect(&self, client_id: &Uuid) -> Option<String> {
        let current = self
            .registry
            .identity(client_id)
            .await
            .and_then(|i| i.current_node);
        if let Some(node_id) = &current {
            self.leave(client_id, node_id).await;
        }
        current
    }

    /// Deliver a pre-encoded frame to every room member except `exclude`.
    pub async fn broadcast_to_room(
        &self,
        node_id: &str,
        frame: Arc<Vec<u8>>,
        exclude: Option<&Uuid>,
    ) -> usize {
        let members: Vec<Uuid> = {
            let rooms = self.rooms.read().await;
            match rooms.get(node_id) {
                Some(members) => members.iter().copied().collect(),
                None => return 0,
            }
        };
        let mut sent = 0;
        for member in members {
            if Some(&member) == exclude {
                continue;
            }
            if self.registry.send_to(&member, frame.clone()).await {
                sent += 1;
            }
        }
        sent
    }

    /// Forcibly drop a room; every member is marked as having no current node.
    /// Used on structural delete.
    pub async fn evict_room(&self, node_id: &str) -> usize {
        let members = {
            let mut rooms = self.rooms.write().await;
            rooms.remove(node_id).unwrap_or_default()
        };
        for member in &members {
            self.registry.set_current_node(member, None).await;
        }
        if !members.is_empty() {
            log::info!("Room {node_id} evicted ({} members)", members.len());
        }
        members.len()
    }

    /// Members of one room.
    pub async fn members(&self, node_id: &str) -> Vec<Uuid> {
        let rooms = self.rooms.read().await;
        rooms
            .get(node_id)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn member_count(&self, node_id: &str) -> usize {
        let rooms = self.rooms.read().await;
        rooms.get(node_id).map(|m| m.len()).unwrap_or(0)
    }

    /// Number of non-empty rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}
