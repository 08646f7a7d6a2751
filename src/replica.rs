//! Per-node replicated document state.
//!
//! Each node gets a lazily created Yrs `Doc` holding the authoritative
//! collaborative document. Incoming updates are confluent: the final state
//! after a set of updates is identical regardless of arrival order, retry, or
//! duplication, so no serialization point is needed across clients.
//!
//! Hydration reads the node's persisted content and tries to extract an
//! embedded [`ContentPayload`]; plain rich-text JSON (a node never edited
//! collaboratively) or a malformed payload yields an empty replica.
//!
//! Merges for one node run under the map's write guard, so they apply one at
//! a time in arrival order; the guard is never held across an await.

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use yrs::updates::decoder::Decode;
use yrs::ReadTxn;

use crate::error::CoreError;
use crate::store::TreeStore;

/// Persisted content wrapper embedding the encoded replica state.
///
/// Serialized as `{"yUpdate":"<base64>"}` inside the node's content column,
/// the same shape the row store has always carried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPayload {
    #[serde(rename = "yUpdate")]
    pub y_update: String,
}

impl ContentPayload {
    /// Wrap an encoded replica state for the content column.
    pub fn wrap(state: &[u8]) -> String {
        let payload = ContentPayload {
            y_update: base64::engine::general_purpose::STANDARD.encode(state),
        };
        serde_json::to_string(&payload).unwrap_or_default()
    }

    /// Try to extract an embedded replica state from a content column.
    ///
    /// Returns None for plain documents or undecodable payloads.
    pub fn unwrap(content: &str) -> Option<Vec<u8>> {
        let payload: ContentPayload = serde_json::from_str(content).ok()?;
        base64::engine::general_purpose::STANDARD
            .decode(payload.y_update)
            .ok()
    }
}

struct ReplicaEntry {
    doc: yrs::Doc,
    /// Set on merge, cleared on successful flush
    dirty: bool,
    last_touched: Instant,
}

impl ReplicaEntry {
    fn new() -> Self {
        Self {
            doc: yrs::Doc::new(),
            dirty: false,
            last_touched: Instant::now(),
        }
    }
}

/// In-memory replica cache, keyed by node id.
pub struct DocumentReplicaStore {
    replicas: RwLock<HashMap<String, ReplicaEntry>>,
    store: Arc<TreeStore>,
}

impl DocumentReplicaStore {
    pub fn new(store: Arc<TreeStore>) -> Self {
        Self {
            replicas: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Hydrate a replica entry from the node's persisted content.
    fn hydrate(&self, node_id: &str) -> ReplicaEntry {
        let entry = ReplicaEntry::new();
        if let Some(record) = self.store.get(node_id) {
            if let Some(state) = ContentPayload::unwrap(&record.content) {
                match yrs::Update::decode_v1(&state) {
                    Ok(update) => {
                        let mut txn = yrs::Transact::transact_mut(&entry.doc);
                        if let Err(e) = txn.apply_update(update) {
                            log::warn!("Persisted state for {node_id} not applicable: {e}");
                        } else {
                            log::debug!("Hydrated replica for {node_id} ({} bytes)", state.len());
                        }
                    }
                    Err(e) => {
                        log::warn!("Persisted state for {node_id} undecodable, starting empty: {e}");
                    }
                }
            }
        }
        entry
    }

    /// Merge an incoming update into the node's replica.
    ///
    /// Creates the replica on first access. An undecodable update is reported
    /// to the caller as [`CoreError::Decode`]; the replica is untouched.
    pub async fn apply_update(&self, node_id: &str, update: &[u8]) -> Result<(), CoreError> {
        let mut replicas = self.replicas.write().await;
        // The decoded update is not Send; nothing may await while it is alive
        let decoded = yrs::Update::decode_v1(update)
            .map_err(|e| CoreError::Decode(format!("update for {node_id}: {e}")))?;
        let entry = replicas
            .entry(node_id.to_string())
            .or_insert_with(|| self.hydrate(node_id));
        {
            let mut txn = yrs::Transact::transact_mut(&entry.doc);
            txn.apply_update(decoded)
                .map_err(|e| CoreError::Decode(format!("update for {node_id}: {e}")))?;
        }
        entry.dirty = true;
        entry.last_touched = Instant::now();
        Ok(())
    }

    /// Full snapshot of the node's current replica, creating it if absent.
    pub async fn encode_full_state(&self, node_id: &str) -> Result<Vec<u8>, CoreError> {
        let mut replicas = self.replicas.write().await;
        let entry = replicas
            .entry(node_id.to_string())
            .or_insert_with(|| self.hydrate(node_id));
        entry.last_touched = Instant::now();
        let txn = yrs::Transact::transact(&entry.doc);
        Ok(txn.encode_state_as_update_v1(&yrs::StateVector::default()))
    }

    /// Drop a cached replica. Used by structural delete and idle eviction.
    pub async fn evict(&self, node_id: &str) -> bool {
        let mut replicas = self.replicas.write().await;
        replicas.remove(node_id).is_some()
    }

    /// Whether a replica is cached for this node.
    pub async fn contains(&self, node_id: &str) -> bool {
        self.replicas.read().await.contains_key(node_id)
    }

    /// Whether the node has merges not yet flushed.
    pub async fn is_dirty(&self, node_id: &str) -> bool {
        let replicas = self.replicas.read().await;
        replicas.get(node_id).map(|e| e.dirty).unwrap_or(false)
    }

    /// Clear the dirty flag after a successful flush.
    pub async fn mark_clean(&self, node_id: &str) {
        let mut replicas = self.replicas.write().await;
        if let Some(entry) = replicas.get_mut(node_id) {
            entry.dirty = false;
        }
    }

    /// Ids of all replicas with unflushed merges.
    pub async fn dirty_nodes(&self) -> Vec<String> {
        let replicas = self.replicas.read().await;
        replicas
            .iter()
            .filter(|(_, e)| e.dirty)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Ids of replicas untouched for at least `idle`. Eviction policy (room
    /// emptiness) is decided by the caller.
    pub async fn idle_nodes(&self, idle: Duration) -> Vec<String> {
        let replicas = self.replicas.read().await;
        replicas
            .iter()
            .filter(|(_, e)| e.last_touched.elapsed() >= idle)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Number of cached replicas.
    pub async fn len(&self) -> usize {
        self.replicas.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.replicas.read().await.is_empty()
    }
}
