//! Structural mutations of the knowledge tree.
//!
//! Create/update/delete of node rows, tag bookkeeping, and the global (not
//! room-scoped) broadcasts that keep every client's tree view current.
//!
//! Delete is the hazardous one: a room or replica may outlive its node row
//! unless the delete synchronously evicts them. `delete` therefore cancels
//! pending flush timers, drops replicas, and evicts rooms for every id in the
//! removed subtree before the deletion event goes out.

use std::sync::Arc;
use uuid::Uuid;

use crate::coalescer::PersistenceCoalescer;
use crate::error::CoreError;
use crate::registry::ConnectionRegistry;
use crate::replica::DocumentReplicaStore;
use crate::rooms::RoomRouter;
use crate::protocol::{ProtocolError, WireMessage};
use crate::store::{
    now_secs, NodePatch, NodeRecord, NodeRow, SearchHit, TreeStore, DEFAULT_TITLE, EMPTY_DOC,
};

/// Fields for node creation; absent fields get defaults.
#[derive(Debug, Clone, Default)]
pub struct CreateNode {
    pub parent_id: String,
    pub title: Option<String>,
    pub position_x: Option<f64>,
    pub position_y: Option<f64>,
    pub author_id: Option<String>,
}

/// Structural create/update/delete over the row store, kept consistent with
/// the live rooms and replicas built on top of it.
pub struct TreeMutationCoordinator {
    store: Arc<TreeStore>,
    replicas: Arc<DocumentReplicaStore>,
    rooms: Arc<RoomRouter>,
    registry: Arc<ConnectionRegistry>,
    coalescer: Arc<PersistenceCoalescer>,
}

impl TreeMutationCoordinator {
    pub fn new(
        store: Arc<TreeStore>,
        replicas: Arc<DocumentReplicaStore>,
        rooms: Arc<RoomRouter>,
        registry: Arc<ConnectionRegistry>,
        coalescer: Arc<PersistenceCoalescer>,
    ) -> Self {
        Self {
            store,
            replicas,
            rooms,
            registry,
            coalescer,
        }
    }

    /// Create a node under an existing parent.
    ///
    /// A dangling parent reference is rejected with NotFound; the store
    /// validates and inserts under one guard, so a concurrent delete of the
    /// parent cannot race the insert. Defaults: title "Untitled", empty
    /// document content, zero position. The created row is broadcast to all
    /// connected clients.
    pub async fn create(&self, req: CreateNode) -> Result<NodeRecord, CoreError> {
        if req.parent_id.trim().is_empty() {
            return Err(CoreError::Validation("parentId is required".into()));
        }

        let now = now_secs();
        let row = NodeRow {
            id: Uuid::new_v4().to_string(),
            parent_id: Some(req.parent_id),
            title: req.title.unwrap_or_else(|| DEFAULT_TITLE.to_string()),
            content: EMPTY_DOC.to_string(),
            position_x: req.position_x.unwrap_or(0.0),
            position_y: req.position_y.unwrap_or(0.0),
            created_at: now,
            updated_at: now,
            author_id: req.author_id.unwrap_or_else(|| "anonymous".to_string()),
            last_editor_id: None,
        };
        let record = self.store.insert_node(row)?;
        self.store.export()?;
        log::info!("Node created: {} ({})", record.title, record.id);

        self.broadcast(WireMessage::node_created(&record)).await;
        Ok(record)
    }

    /// Apply a partial update; each present field is applied independently.
    ///
    /// A tag set replaces the node's associations exactly; catalog entries are
    /// never pruned. The canonical joined row is broadcast to all clients.
    pub async fn update(&self, node_id: &str, patch: NodePatch) -> Result<NodeRecord, CoreError> {
        let record = self.store.update_node(node_id, &patch)?;
        self.store.export()?;
        log::debug!("Node updated: {node_id}");

        self.broadcast(WireMessage::node_updated(&record)).await;
        Ok(record)
    }

    /// Delete a node and its whole descendant subtree.
    ///
    /// The root is never deletable. The subtree's rows and tag associations
    /// are removed as one atomic unit; rooms, replicas, and pending flush
    /// timers for every removed id are evicted synchronously, then a single
    /// deletion event carrying the full removed-id set goes out to everyone.
    pub async fn delete(&self, node_id: &str) -> Result<Vec<String>, CoreError> {
        let record = self
            .store
            .get(node_id)
            .ok_or_else(|| CoreError::NotFound(node_id.to_string()))?;
        if record.parent_id.is_none() {
            return Err(CoreError::Conflict("root node cannot be deleted".into()));
        }

        let removed = self.store.remove_subtree(node_id)?;
        self.store.export()?;

        for id in &removed {
            self.coalescer.cancel(id).await;
            self.replicas.evict(id).await;
            self.rooms.evict_room(id).await;
        }
        log::info!("Node {node_id} deleted ({} rows removed)", removed.len());

        self.broadcast(WireMessage::node_deleted(removed.clone())).await;
        Ok(removed)
    }

    /// One node joined with its tag names.
    pub fn get(&self, node_id: &str) -> Result<NodeRecord, CoreError> {
        self.store
            .get(node_id)
            .ok_or_else(|| CoreError::NotFound(node_id.to_string()))
    }

    /// Every node joined with tag names.
    pub fn list(&self) -> Vec<NodeRecord> {
        self.store.list()
    }

    /// Title/content/tag substring search.
    pub fn search(&self, query: &str) -> Vec<SearchHit> {
        self.store.search(query, 20)
    }

    /// The full tag catalog.
    pub fn tags(&self) -> Vec<String> {
        self.store.list_tags()
    }

    async fn broadcast(&self, msg: Result<WireMessage, ProtocolError>) {
        match msg.and_then(|m| m.encode()) {
            Ok(frame) => {
                self.registry.broadcast_all(Arc::new(frame), None).await;
            }
            Err(e) => log::error!("Failed to encode broadcast: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EventType;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Fixture {
        store: Arc<TreeStore>,
        replicas: Arc<DocumentReplicaStore>,
        rooms: Arc<RoomRouter>,
        registry: Arc<ConnectionRegistry>,
        tree: TreeMutationCoordinator,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(TreeStore::in_memory().unwrap());
        let registry = Arc::new(ConnectionRegistry::new());
        let replicas = Arc::new(DocumentReplicaStore::new(store.clone()));
        let rooms = Arc::new(RoomRouter::new(registry.clone(), replicas.clone()));
        let coalescer = Arc::new(PersistenceCoalescer::new(
            Duration::from_millis(50),
            replicas.clone(),
            store.clone(),
        ));
        let tree = TreeMutationCoordinator::new(
            store.clone(),
            replicas.clone(),
            rooms.clone(),
            registry.clone(),
            coalescer,
        );
        Fixture {
            store,
            replicas,
            rooms,
            registry,
            tree,
        }
    }

    async fn connect(fx: &Fixture) -> (Uuid, mpsc::UnboundedReceiver<Arc<Vec<u8>>>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let identity = fx.registry.connect(tx).await;
        while rx.try_recv().is_ok() {}
        (identity.id, rx)
    }

    #[tokio::test]
    async fn test_create_applies_defaults() {
        let fx = fixture();
        let root = fx.store.root_id().unwrap();

        let rec = fx
            .tree
            .create(CreateNode {
                parent_id: root.clone(),
                ..CreateNode::default()
            })
            .await
            .unwrap();
        assert_eq!(rec.title, DEFAULT_TITLE);
        assert_eq!(rec.content, EMPTY_DOC);
        assert_eq!(rec.position_x, 0.0);
        assert_eq!(rec.author_id, "anonymous");
        assert_eq!(rec.parent_id.as_deref(), Some(root.as_str()));
    }

    #[tokio::test]
    async fn test_create_rejects_missing_parent() {
        let fx = fixture();
        let err = fx
            .tree
            .create(CreateNode {
                parent_id: "no-such-node".into(),
                ..CreateNode::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
        assert_eq!(fx.store.node_count(), 1); // only the root
    }

    #[tokio::test]
    async fn test_create_rejects_empty_parent() {
        let fx = fixture();
        let err = fx
            .tree
            .create(CreateNode::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn test_create_broadcasts_globally() {
        let fx = fixture();
        let root = fx.store.root_id().unwrap();
        let (_alice, mut alice_rx) = connect(&fx).await;
        let (_bob, mut bob_rx) = connect(&fx).await;
        while alice_rx.try_recv().is_ok() {}

        let rec = fx
            .tree
            .create(CreateNode {
                parent_id: root,
                title: Some("Announced".into()),
                ..CreateNode::default()
            })
            .await
            .unwrap();

        for rx in [&mut alice_rx, &mut bob_rx] {
            let frame = rx.try_recv().expect("every client hears nodeCreated");
            let msg = WireMessage::decode(&frame).unwrap();
            assert_eq!(msg.event, EventType::NodeCreated);
            assert_eq!(msg.node_record().unwrap().id, rec.id);
        }
    }

    #[tokio::test]
    async fn test_update_relinks_tags_and_broadcasts() {
        let fx = fixture();
        let root = fx.store.root_id().unwrap();
        let rec = fx
            .tree
            .create(CreateNode {
                parent_id: root,
                ..CreateNode::default()
            })
            .await
            .unwrap();
        let (_alice, mut alice_rx) = connect(&fx).await;

        let updated = fx
            .tree
            .update(
                &rec.id,
                NodePatch {
                    title: Some("Renamed".into()),
                    tags: Some(vec!["one".into(), "two".into()]),
                    ..NodePatch::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.title, "Renamed");
        assert_eq!(updated.tags, vec!["one", "two"]);

        let frame = alice_rx.try_recv().unwrap();
        let msg = WireMessage::decode(&frame).unwrap();
        assert_eq!(msg.event, EventType::NodeUpdated);
        assert_eq!(msg.node_record().unwrap().tags, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_update_missing_node() {
        let fx = fixture();
        let err = fx
            .tree
            .update("ghost", NodePatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_refuses_root() {
        let fx = fixture();
        let root = fx.store.root_id().unwrap();
        let err = fx.tree.delete(&root).await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
        assert!(fx.store.contains(&root));
    }

    #[tokio::test]
    async fn test_delete_subtree_evicts_rooms_and_replicas() {
        let fx = fixture();
        let root = fx.store.root_id().unwrap();
        let child = fx
            .tree
            .create(CreateNode {
                parent_id: root,
                title: Some("child-1".into()),
                ..CreateNode::default()
            })
            .await
            .unwrap();
        let leaf = fx
            .tree
            .create(CreateNode {
                parent_id: child.id.clone(),
                title: Some("leaf-1".into()),
                ..CreateNode::default()
            })
            .await
            .unwrap();

        // A client is editing the leaf; replicas exist for both
        let (alice, _arx) = connect(&fx).await;
        fx.rooms.join(&alice, &leaf.id).await.unwrap();
        fx.replicas.encode_full_state(&child.id).await.unwrap();

        let removed = fx.tree.delete(&child.id).await.unwrap();
        assert_eq!(removed[0], child.id);
        assert_eq!(removed.len(), 2);
        assert!(removed.contains(&leaf.id));

        // Rows gone from a full listing
        let ids: Vec<String> = fx.tree.list().into_iter().map(|r| r.id).collect();
        assert!(!ids.contains(&child.id));
        assert!(!ids.contains(&leaf.id));

        // Rooms and replicas evicted synchronously
        assert_eq!(fx.rooms.member_count(&leaf.id).await, 0);
        assert!(!fx.replicas.contains(&child.id).await);
        assert!(!fx.replicas.contains(&leaf.id).await);
        assert!(fx
            .registry
            .identity(&alice)
            .await
            .unwrap()
            .current_node
            .is_none());
    }

    #[tokio::test]
    async fn test_delete_broadcasts_full_removed_set() {
        let fx = fixture();
        let root = fx.store.root_id().unwrap();
        let child = fx
            .tree
            .create(CreateNode {
                parent_id: root,
                ..CreateNode::default()
            })
            .await
            .unwrap();
        let leaf = fx
            .tree
            .create(CreateNode {
                parent_id: child.id.clone(),
                ..CreateNode::default()
            })
            .await
            .unwrap();
        let (_alice, mut alice_rx) = connect(&fx).await;

        fx.tree.delete(&child.id).await.unwrap();
        let frame = alice_rx.try_recv().unwrap();
        let msg = WireMessage::decode(&frame).unwrap();
        assert_eq!(msg.event, EventType::NodeDeleted);
        let payload = msg.node_deleted_payload().unwrap();
        assert_eq!(payload.removed[0], child.id);
        assert!(payload.removed.contains(&leaf.id));
    }

    #[tokio::test]
    async fn test_delete_missing_node() {
        let fx = fixture();
        let err = fx.tree.delete("ghost").await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }
}
