//! WebSocket server wiring all components together.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── ConnectionRegistry (identity, roster, outbound senders)
//! Client B ──┘        │
//!                      ├── RoomRouter (node_id → members)
//!                      │        │
//!                      │        └── DocumentReplicaStore (Yrs docs)
//!                      │                 │
//!                      │                 └── PersistenceCoalescer
//!                      │                          │
//!                      └── TreeMutationCoordinator │
//!                               │                  ▼
//!                               └──────────► TreeStore (rows + snapshot)
//! ```
//!
//! One task per connection. Incoming frames are dispatched by event type;
//! outgoing frames arrive on the connection's mpsc channel, filled by the
//! registry and routers. Durability boundary: room fan-out happens before the
//! flush timer is armed, so peers never wait on persistence.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::coalescer::PersistenceCoalescer;
use crate::error::CoreError;
use crate::protocol::{EventType, WireMessage};
use crate::registry::ConnectionRegistry;
use crate::replica::DocumentReplicaStore;
use crate::rooms::RoomRouter;
use crate::store::{StoreConfig, TreeStore};
use crate::tree::TreeMutationCoordinator;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Snapshot file path (None = in-memory only)
    pub snapshot_path: Option<PathBuf>,
    /// Quiet period before a dirty replica is flushed
    pub quiet_period_ms: u64,
    /// Replica idle time before it is eligible for eviction
    pub idle_evict_secs: u64,
    /// Interval of the idle-replica sweep
    pub sweep_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            snapshot_path: None,
            quiet_period_ms: 3000,
            idle_evict_secs: 300,
            sweep_interval_secs: 60,
        }
    }
}

/// The collaboration server. All components hang off this context; nothing
/// lives in globals, so independent instances coexist in one process.
#[derive(Clone)]
pub struct CollabServer {
    config: ServerConfig,
    store: Arc<TreeStore>,
    registry: Arc<ConnectionRegistry>,
    replicas: Arc<DocumentReplicaStore>,
    rooms: Arc<RoomRouter>,
    coalescer: Arc<PersistenceCoalescer>,
    tree: Arc<TreeMutationCoordinator>,
}

impl CollabServer {
    /// Build the full component graph from a configuration.
    pub fn new(config: ServerConfig) -> Result<Self, CoreError> {
        let store = Arc::new(TreeStore::open(StoreConfig {
            snapshot_path: config.snapshot_path.clone(),
        })?);
        let registry = Arc::new(ConnectionRegistry::new());
        let replicas = Arc::new(DocumentReplicaStore::new(store.clone()));
        let rooms = Arc::new(RoomRouter::new(registry.clone(), replicas.clone()));
        let coalescer = Arc::new(PersistenceCoalescer::new(
            Duration::from_millis(config.quiet_period_ms),
            replicas.clone(),
            store.clone(),
        ));
        let tree = Arc::new(TreeMutationCoordinator::new(
            store.clone(),
            replicas.clone(),
            rooms.clone(),
            registry.clone(),
            coalescer.clone(),
        ));

        Ok(Self {
            config,
            store,
            registry,
            replicas,
            rooms,
            coalescer,
            tree,
        })
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Result<Self, CoreError> {
        Self::new(ServerConfig::default())
    }

    /// Create with persistence enabled at the given snapshot path.
    pub fn with_snapshot(
        bind_addr: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Result<Self, CoreError> {
        Self::new(ServerConfig {
            bind_addr: bind_addr.into(),
            snapshot_path: Some(path.into()),
            ..ServerConfig::default()
        })
    }

    /// Start listening for WebSocket connections.
    ///
    /// Runs the accept loop and the idle-replica sweep. Call from an async
    /// runtime; does not return until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Collab server listening on {}", self.config.bind_addr);

        let sweeper = self.clone();
        tokio::spawn(async move {
            sweeper.sweep_idle_replicas().await;
        });

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection from accept to cleanup.
    async fn handle_connection(
        &self,
        stream: TcpStream,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Arc<Vec<u8>>>();
        let identity = self.registry.connect(tx).await;
        let client_id = identity.id;

        loop {
            tokio::select! {
                // Incoming WebSocket frame
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            match WireMessage::decode(&bytes) {
                                Ok(wire_msg) => self.dispatch(&client_id, wire_msg).await,
                                Err(e) => {
                                    log::warn!("Undecodable frame from {client_id}: {e}");
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {client_id}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                // Outgoing frame queued by registry/router fan-out
                frame = rx.recv() => {
                    match frame {
                        Some(frame) => {
                            ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
                        }
                        None => break,
                    }
                }
            }
        }

        // Implicit room leave first, so peers get their notification while
        // the identity still exists
        self.rooms.disconnect(&client_id).await;
        self.registry.disconnect(&client_id).await;
        Ok(())
    }

    /// Route one decoded client frame to the owning component.
    async fn dispatch(&self, client_id: &Uuid, msg: WireMessage) {
        match msg.event {
            EventType::SetName => match msg.text() {
                Ok(name) => {
                    if let Err(e) = self.registry.set_name(client_id, &name).await {
                        log::warn!("Rename rejected for {client_id}: {e}");
                    }
                }
                Err(e) => log::warn!("Bad setName payload from {client_id}: {e}"),
            },

            EventType::JoinNode => match msg.text() {
                Ok(node_id) => match self.rooms.join(client_id, &node_id).await {
                    Ok(state) => {
                        if let Ok(frame) =
                            WireMessage::node_sync(&node_id, state).and_then(|m| m.encode())
                        {
                            self.registry.send_to(client_id, Arc::new(frame)).await;
                        }
                    }
                    Err(e) => log::warn!("Join failed for {client_id} on {node_id}: {e}"),
                },
                Err(e) => log::warn!("Bad joinNode payload from {client_id}: {e}"),
            },

            EventType::LeaveNode => {
                if let Ok(node_id) = msg.text() {
                    self.rooms.leave(client_id, &node_id).await;
                }
            }

            EventType::DocumentUpdate => match msg.document_update_payload() {
                Ok(payload) => {
                    match self
                        .replicas
                        .apply_update(&payload.node_id, &payload.update)
                        .await
                    {
                        Ok(()) => {
                            // Fan out to peers before arming the flush timer:
                            // peers never wait on persistence
                            let relay =
                                WireMessage::document_update(&payload.node_id, payload.update);
                            if let Ok(frame) = relay.and_then(|m| m.encode()) {
                                self.rooms
                                    .broadcast_to_room(
                                        &payload.node_id,
                                        Arc::new(frame),
                                        Some(client_id),
                                    )
                                    .await;
                            }
                            self.coalescer.schedule_save(&payload.node_id).await;
                        }
                        Err(e) => {
                            log::warn!(
                                "Rejected update from {client_id} for {}: {e}",
                                payload.node_id
                            );
                            let rejection =
                                WireMessage::update_rejected(&payload.node_id, e.to_string());
                            if let Ok(frame) = rejection.and_then(|m| m.encode()) {
                                self.registry.send_to(client_id, Arc::new(frame)).await;
                            }
                        }
                    }
                }
                Err(e) => log::warn!("Bad documentUpdate payload from {client_id}: {e}"),
            },

            EventType::CursorUpdate => {
                if let Ok(payload) = msg.cursor_update_payload() {
                    if let Some(identity) = self.registry.set_cursor(client_id, payload.cursor).await
                    {
                        let relay = WireMessage::cursor_broadcast(
                            &payload.node_id,
                            &identity,
                            payload.cursor,
                        );
                        if let Ok(frame) = relay.and_then(|m| m.encode()) {
                            self.rooms
                                .broadcast_to_room(&payload.node_id, Arc::new(frame), Some(client_id))
                                .await;
                        }
                    }
                }
            }

            other => {
                log::debug!("Unhandled client event {other:?} from {client_id}");
            }
        }
    }

    /// Periodically evict replicas that are idle and have no room members.
    /// Dirty replicas are flushed before eviction so no merge is lost.
    async fn sweep_idle_replicas(&self) {
        let idle = Duration::from_secs(self.config.idle_evict_secs);
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.sweep_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            for node_id in self.replicas.idle_nodes(idle).await {
                if self.rooms.member_count(&node_id).await > 0 {
                    continue;
                }
                if self.replicas.is_dirty(&node_id).await {
                    if let Err(e) = self.coalescer.flush_now(&node_id).await {
                        log::error!("Pre-eviction flush failed for {node_id}: {e}");
                        continue;
                    }
                }
                if self.replicas.evict(&node_id).await {
                    log::debug!("Evicted idle replica {node_id}");
                }
            }
        }
    }

    /// Graceful shutdown: notify clients, drain dirty replicas, snapshot.
    pub async fn shutdown(&self) -> Result<(), CoreError> {
        if let Ok(frame) =
            WireMessage::server_shutdown("server shutting down").and_then(|m| m.encode())
        {
            self.registry.broadcast_all(Arc::new(frame), None).await;
        }
        let drained = self.coalescer.flush_all_dirty().await;
        self.store.export()?;
        log::info!("Shutdown complete ({drained} replicas drained)");
        Ok(())
    }

    /// Structural mutation surface for the HTTP/CLI layer.
    pub fn tree(&self) -> &TreeMutationCoordinator {
        &self.tree
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn rooms(&self) -> &Arc<RoomRouter> {
        &self.rooms
    }

    pub fn replicas(&self) -> &Arc<DocumentReplicaStore> {
        &self.replicas
    }

    pub fn coalescer(&self) -> &Arc<PersistenceCoalescer> {
        &self.coalescer
    }

    pub fn store(&self) -> &Arc<TreeStore> {
        &self.store
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}
