//! Identity and roster for connected clients.
//!
//! The registry owns the full client lifecycle: it mints an [`Identity`] for
//! every new connection, holds the per-client outbound sender so fan-out is a
//! synchronous channel push, and rebroadcasts the complete roster on every
//! change. Full-roster broadcast (not diffs) is fine at the intended scale;
//! it becomes a bandwidth limit well before it becomes a correctness issue.
//!
//! Room departure on disconnect is routed through `RoomRouter` by the dispatch
//! layer before [`ConnectionRegistry::disconnect`] removes the identity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::error::CoreError;
use crate::protocol::{CursorPos, Identity, WireMessage};

/// Fixed color palette; one entry is assigned per connection.
pub const PALETTE: [&str; 10] = [
    "#00ffff", "#ff00ff", "#ffff00", "#00ff00", "#ff6b6b", "#4ecdc4", "#45b7d1", "#96ceb4",
    "#ffeaa7", "#dfe6e9",
];

/// Outbound channel handed over by the connection task.
pub type ClientSender = mpsc::UnboundedSender<Arc<Vec<u8>>>;

struct ClientEntry {
    identity: Identity,
    /// Connect order, used to keep the roster stable
    seq: u64,
    tx: ClientSender,
}

/// Roster of connected clients.
pub struct ConnectionRegistry {
    clients: RwLock<HashMap<Uuid, ClientEntry>>,
    next_seq: AtomicU64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Register a new connection: mint an identity, deliver it to the client,
    /// and rebroadcast the roster to everyone.
    pub async fn connect(&self, tx: ClientSender) -> Identity {
        let id = Uuid::new_v4();
        let identity = Identity {
            id,
            name: default_name(&id),
            color: pick_color(&id).to_string(),
            current_node: None,
            cursor: None,
        };

        {
            let mut clients = self.clients.write().await;
            clients.insert(
                id,
                ClientEntry {
                    identity: identity.clone(),
                    seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                    tx,
                },
            );
        }
        log::info!("Client connected: {} ({})", identity.name, id);

        if let Ok(frame) = WireMessage::connection_open(&identity).and_then(|m| m.encode()) {
            self.send_to(&id, Arc::new(frame)).await;
        }
        self.broadcast_roster().await;
        identity
    }

    /// Rename a client and rebroadcast the roster.
    pub async fn set_name(&self, client_id: &Uuid, name: &str) -> Result<(), CoreError> {
        if name.trim().is_empty() {
            return Err(CoreError::Validation("name must not be empty".into()));
        }
        {
            let mut clients = self.clients.write().await;
            let entry = clients
                .get_mut(client_id)
                .ok_or_else(|| CoreError::NotFound(client_id.to_string()))?;
            entry.identity.name = name.to_string();
        }
        log::debug!("Client {client_id} renamed to {name}");
        self.broadcast_roster().await;
        Ok(())
    }

    /// Remove a client and rebroadcast the roster.
    ///
    /// Returns the departed identity so the caller can notify room peers.
    /// The caller is expected to have already routed the implicit room leave.
    pub async fn disconnect(&self, client_id: &Uuid) -> Option<Identity> {
        let removed = {
            let mut clients = self.clients.write().await;
            clients.remove(client_id).map(|e| e.identity)
        };
        if let Some(identity) = &removed {
            log::info!("Client disconnected: {} ({})", identity.name, client_id);
            self.broadcast_roster().await;
        }
        removed
    }

    /// Current identity snapshot for one client.
    pub async fn identity(&self, client_id: &Uuid) -> Option<Identity> {
        let clients = self.clients.read().await;
        clients.get(client_id).map(|e| e.identity.clone())
    }

    /// Record which node a client is editing (None = no room).
    pub async fn set_current_node(&self, client_id: &Uuid, node_id: Option<String>) {
        let mut clients = self.clients.write().await;
        if let Some(entry) = clients.get_mut(client_id) {
            entry.identity.current_node = node_id;
            if entry.identity.current_node.is_none() {
                entry.identity.cursor = None;
            }
        }
    }

    /// Record a client's last known cursor position. Presence-only.
    pub async fn set_cursor(&self, client_id: &Uuid, cursor: CursorPos) -> Option<Identity> {
        let mut clients = self.clients.write().await;
        clients.get_mut(client_id).map(|entry| {
            entry.identity.cursor = Some(cursor);
            entry.identity.clone()
        })
    }

    /// Ordered list of all connected identities (connect order).
    pub async fn roster(&self) -> Vec<Identity> {
        let clients = self.clients.read().await;
        let mut entries: Vec<(&u64, &Identity)> =
            clients.values().map(|e| (&e.seq, &e.identity)).collect();
        entries.sort_by_key(|(seq, _)| **seq);
        entries.into_iter().map(|(_, i)| i.clone()).collect()
    }

    /// Number of connected clients.
    pub async fn count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Deliver a pre-encoded frame to one client. Returns false if the client
    /// is gone or its channel is closed.
    pub async fn send_to(&self, client_id: &Uuid, frame: Arc<Vec<u8>>) -> bool {
        let clients = self.clients.read().await;
        match clients.get(client_id) {
            Some(entry) => entry.tx.send(frame).is_ok(),
            None => false,
        }
    }

    /// Deliver a pre-encoded frame to every connected client except `exclude`.
    /// Returns the number of clients reached.
    pub async fn broadcast_all(&self, frame: Arc<Vec<u8>>, exclude: Option<&Uuid>) -> usize {
        let clients = self.clients.read().await;
        let mut sent = 0;
        for (id, entry) in clients.iter() {
            if Some(id) == exclude {
                continue;
            }
            if entry.tx.send(frame.clone()).is_ok() {
                sent += 1;
            }
        }
        sent
    }

    /// Encode and broadcast the complete roster.
    async fn broadcast_roster(&self) {
        let roster = self.roster().await;
        match WireMessage::roster_update(&roster).and_then(|m| m.encode()) {
            Ok(frame) => {
                self.broadcast_all(Arc::new(frame), None).await;
            }
            Err(e) => log::error!("Failed to encode roster: {e}"),
        }
    }
}

fn default_name(id: &Uuid) -> String {
    let short = &id.simple().to_string()[..4];
    format!("User-{short}")
}

fn pick_color(id: &Uuid) -> &'static str {
    // Uniform over the palette since v4 ids are uniformly random
    PALETTE[(id.as_u128() % PALETTE.len() as u128) as usize]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EventType;

    fn channel() -> (ClientSender, mpsc::UnboundedReceiver<Arc<Vec<u8>>>) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn test_connect_assigns_identity() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = channel();
        let identity = registry.connect(tx).await;

        assert!(identity.name.starts_with("User-"));
        assert!(PALETTE.contains(&identity.color.as_str()));
        assert!(identity.current_node.is_none());
        assert!(identity.cursor.is_none());

        // First frame is the identity, second the roster
        let frame = rx.recv().await.unwrap();
        let msg = WireMessage::decode(&frame).unwrap();
        assert_eq!(msg.event, EventType::ConnectionOpen);
        assert_eq!(msg.identity().unwrap().id, identity.id);

        let frame = rx.recv().await.unwrap();
        let msg = WireMessage::decode(&frame).unwrap();
        assert_eq!(msg.event, EventType::RosterUpdate);
        assert_eq!(msg.roster().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_roster_ordered_by_connect_sequence() {
        let registry = ConnectionRegistry::new();
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();
        let (tx3, _rx3) = channel();
        let a = registry.connect(tx1).await;
        let b = registry.connect(tx2).await;
        let c = registry.connect(tx3).await;

        let roster = registry.roster().await;
        let ids: Vec<Uuid> = roster.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![a.id, b.id, c.id]);
    }

    #[tokio::test]
    async fn test_set_name_rebroadcasts_roster() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = channel();
        let identity = registry.connect(tx).await;
        rx.recv().await.unwrap(); // ConnectionOpen
        rx.recv().await.unwrap(); // RosterUpdate

        registry.set_name(&identity.id, "Alice").await.unwrap();
        let frame = rx.recv().await.unwrap();
        let msg = WireMessage::decode(&frame).unwrap();
        let roster = msg.roster().unwrap();
        assert_eq!(roster[0].name, "Alice");
    }

    #[tokio::test]
    async fn test_set_name_rejects_empty() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = channel();
        let identity = registry.connect(tx).await;

        let err = registry.set_name(&identity.id, "  ").await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn test_set_name_unknown_client() {
        let registry = ConnectionRegistry::new();
        let err = registry.set_name(&Uuid::new_v4(), "Bob").await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_disconnect_removes_and_rebroadcasts() {
        let registry = ConnectionRegistry::new();
        let (tx1, _rx1) = channel();
        let (tx2, mut rx2) = channel();
        let a = registry.connect(tx1).await;
        let _b = registry.connect(tx2).await;
        rx2.recv().await.unwrap(); // ConnectionOpen
        rx2.recv().await.unwrap(); // RosterUpdate

        let departed = registry.disconnect(&a.id).await.unwrap();
        assert_eq!(departed.id, a.id);
        assert_eq!(registry.count().await, 1);

        let frame = rx2.recv().await.unwrap();
        let msg = WireMessage::decode(&frame).unwrap();
        assert_eq!(msg.roster().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_all_excludes_sender() {
        let registry = ConnectionRegistry::new();
        let (tx1, mut rx1) = channel();
        let (tx2, mut rx2) = channel();
        let a = registry.connect(tx1).await;
        let _b = registry.connect(tx2).await;
        while rx1.try_recv().is_ok() {}
        while rx2.try_recv().is_ok() {}

        let frame = Arc::new(vec![1, 2, 3]);
        let sent = registry.broadcast_all(frame, Some(&a.id)).await;
        assert_eq!(sent, 1);
        assert!(rx1.try_recv().is_err());
        assert_eq!(*rx2.try_recv().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_cursor_tracking() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = channel();
        let identity = registry.connect(tx).await;

        let updated = registry
            .set_cursor(&identity.id, CursorPos::new(10.0, 20.0))
            .await
            .unwrap();
        assert_eq!(updated.cursor, Some(CursorPos::new(10.0, 20.0)));

        // Leaving all rooms clears the cursor
        registry.set_current_node(&identity.id, None).await;
        let identity = registry.identity(&identity.id).await.unwrap();
        assert!(identity.cursor.is_none());
    }
}
