//! In-memory row store with whole-store snapshot durability.
//!
//! The relational surface the sync core writes through:
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                 TreeStore                     │
//! │                                               │
//! │  nodes      id → NodeRow                      │
//! │  tags       tag_id → name  (append-only)      │
//! │  node_tags  (node_id, tag_id) associations    │
//! │                                               │
//! │  export(): bincode + LZ4 → snapshot file      │
//! │  open():   snapshot file → tables, ensure_root│
//! └───────────────────────────────────────────────┘
//! ```
//!
//! All tables live behind one `RwLock`; every multi-row mutation runs under a
//! single write guard, so a subtree delete or a tag relink is all-or-nothing.
//! Durability is a whole-store snapshot ("flush current state to durable
//! file") — the capability the out-of-band backup utility consumes.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::SystemTime;
use uuid::Uuid;

/// Default title for nodes created without one.
pub const DEFAULT_TITLE: &str = "Untitled";

/// Empty rich-text document stored in freshly created nodes.
pub const EMPTY_DOC: &str = r#"{"type":"doc","content":[]}"#;

const ROOT_TITLE: &str = "Knowledge Base";
const ROOT_CONTENT: &str = r#"{"type":"doc","content":[{"type":"paragraph","content":[{"type":"text","text":"Welcome"}]}]}"#;

/// Seconds since the Unix epoch.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Store configuration.
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    /// Snapshot file path (None = in-memory only, nothing durable)
    pub snapshot_path: Option<PathBuf>,
}

impl StoreConfig {
    pub fn in_memory() -> Self {
        Self {
            snapshot_path: None,
        }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            snapshot_path: Some(path.into()),
        }
    }
}

/// One node row, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRow {
    pub id: String,
    /// None only for the single root node
    pub parent_id: Option<String>,
    pub title: String,
    /// JSON document or an embedded replica payload (see `replica::ContentPayload`)
    pub content: String,
    pub position_x: f64,
    pub position_y: f64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
    pub author_id: String,
    pub last_editor_id: Option<String>,
}

/// A node row joined with its tag names — the canonical shape broadcast to
/// clients and returned from every read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: String,
    pub parent_id: Option<String>,
    pub title: String,
    pub content: String,
    pub position_x: f64,
    pub position_y: f64,
    pub created_at: u64,
    pub updated_at: u64,
    pub author_id: String,
    pub last_editor_id: Option<String>,
    pub tags: Vec<String>,
}

/// Partial update applied to a node row; absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodePatch {
    pub title: Option<String>,
    pub content: Option<String>,
    pub position_x: Option<f64>,
    pub position_y: Option<f64>,
    pub last_editor_id: Option<String>,
    /// Replaces the node's full tag set when present
    pub tags: Option<Vec<String>>,
}

impl NodePatch {
    fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.content.is_none()
            && self.position_x.is_none()
            && self.position_y.is_none()
            && self.last_editor_id.is_none()
            && self.tags.is_none()
    }
}

/// Title-level search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub title: String,
    pub parent_id: Option<String>,
}

/// The persisted table set.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Tables {
    nodes: HashMap<String, NodeRow>,
    /// tag_id → name; entries are never pruned
    tags: HashMap<u64, String>,
    node_tags: BTreeSet<(String, u64)>,
    next_tag_id: u64,
}

impl Tables {
    fn tag_names_for(&self, node_id: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .node_tags
            .iter()
            .filter(|(nid, _)| nid == node_id)
            .filter_map(|(_, tid)| self.tags.get(tid).cloned())
            .collect();
        names.sort();
        names
    }

    fn record(&self, row: &NodeRow) -> NodeRecord {
        NodeRecord {
            id: row.id.clone(),
            parent_id: row.parent_id.clone(),
            title: row.title.clone(),
            content: row.content.clone(),
            position_x: row.position_x,
            position_y: row.position_y,
            created_at: row.created_at,
            updated_at: row.updated_at,
            author_id: row.author_id.clone(),
            last_editor_id: row.last_editor_id.clone(),
            tags: self.tag_names_for(&row.id),
        }
    }

    fn ensure_tag(&mut self, name: &str) -> u64 {
        if let Some((id, _)) = self.tags.iter().find(|(_, n)| n.as_str() == name) {
            return *id;
        }
        let id = self.next_tag_id;
        self.next_tag_id += 1;
        self.tags.insert(id, name.to_string());
        id
    }

    /// Replace a node's tag associations to match `names` exactly.
    /// Catalog entries themselves are retained even when unreferenced.
    fn relink_tags(&mut self, node_id: &str, names: &[String]) {
        self.node_tags.retain(|(nid, _)| nid != node_id);
        for name in names {
            let tag_id = self.ensure_tag(name);
            self.node_tags.insert((node_id.to_string(), tag_id));
        }
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Node row not found
    NotFound(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed (corrupt snapshot)
    DeserializationError(String),
    /// Snapshot compression failed
    CompressionError(String),
    /// I/O error reading or writing the snapshot file
    IoError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "Node not found: {id}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::IoError(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::IoError(e.to_string())
    }
}

/// The row store backing the sync core.
pub struct TreeStore {
    tables: RwLock<Tables>,
    config: StoreConfig,
}

impl TreeStore {
    /// Open the store, loading the snapshot file if one exists, and make sure
    /// the single root node is present.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let tables = match &config.snapshot_path {
            Some(path) if path.exists() => {
                let compressed = std::fs::read(path)?;
                let bytes = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::CompressionError(e.to_string()))?;
                let (tables, _) =
                    bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
                log::info!("Loaded store snapshot from {}", path.display());
                tables
            }
            _ => Tables::default(),
        };

        let store = Self {
            tables: RwLock::new(tables),
            config,
        };
        if store.ensure_root()? {
            store.export()?;
        }
        Ok(store)
    }

    /// Open an in-memory store (tests, embedding without durability).
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::open(StoreConfig::in_memory())
    }

    /// Insert the root row if no node with a null parent exists.
    /// Returns true if the root was created.
    fn ensure_root(&self) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().unwrap();
        if tables.nodes.values().any(|n| n.parent_id.is_none()) {
            return Ok(false);
        }
        let now = now_secs();
        let root = NodeRow {
            id: Uuid::new_v4().to_string(),
            parent_id: None,
            title: ROOT_TITLE.to_string(),
            content: ROOT_CONTENT.to_string(),
            position_x: 0.0,
            position_y: 0.0,
            created_at: now,
            updated_at: now,
            author_id: "system".to_string(),
            last_editor_id: None,
        };
        log::info!("Root node created: {}", root.id);
        tables.nodes.insert(root.id.clone(), root);
        Ok(true)
    }

    /// Id of the single root node.
    pub fn root_id(&self) -> Option<String> {
        let tables = self.tables.read().unwrap();
        tables
            .nodes
            .values()
            .find(|n| n.parent_id.is_none())
            .map(|n| n.id.clone())
    }

    /// Whether a node row exists.
    pub fn contains(&self, node_id: &str) -> bool {
        self.tables.read().unwrap().nodes.contains_key(node_id)
    }

    /// Read one node joined with its tag names.
    pub fn get(&self, node_id: &str) -> Option<NodeRecord> {
        let tables = self.tables.read().unwrap();
        tables.nodes.get(node_id).map(|row| tables.record(row))
    }

    /// All nodes joined with tag names, ordered by creation time then id.
    pub fn list(&self) -> Vec<NodeRecord> {
        let tables = self.tables.read().unwrap();
        let mut records: Vec<NodeRecord> =
            tables.nodes.values().map(|row| tables.record(row)).collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        records
    }

    /// Number of node rows.
    pub fn node_count(&self) -> usize {
        self.tables.read().unwrap().nodes.len()
    }

    /// Insert a new node row.
    ///
    /// A non-root row's parent must already exist; the check and the insert
    /// run under one write guard, so a concurrent subtree delete cannot slip
    /// a dangling parent reference in between.
    pub fn insert_node(&self, row: NodeRow) -> Result<NodeRecord, StoreError> {
        let mut tables = self.tables.write().unwrap();
        if let Some(parent_id) = &row.parent_id {
            if !tables.nodes.contains_key(parent_id) {
                return Err(StoreError::NotFound(parent_id.clone()));
            }
        }
        let record = tables.record(&row);
        tables.nodes.insert(row.id.clone(), row);
        Ok(record)
    }

    /// Apply a partial update to a node row under one write guard.
    ///
    /// Each present field is applied independently; a tag set replaces the
    /// node's associations exactly. `updated_at` is refreshed whenever any
    /// field changes. Returns the canonical joined record.
    pub fn update_node(&self, node_id: &str, patch: &NodePatch) -> Result<NodeRecord, StoreError> {
        let mut tables = self.tables.write().unwrap();
        if !tables.nodes.contains_key(node_id) {
            return Err(StoreError::NotFound(node_id.to_string()));
        }

        if let Some(tags) = &patch.tags {
            tables.relink_tags(node_id, tags);
        }

        let row = tables.nodes.get_mut(node_id).unwrap();
        if let Some(title) = &patch.title {
            row.title = title.clone();
        }
        if let Some(content) = &patch.content {
            row.content = content.clone();
        }
        if let Some(x) = patch.position_x {
            row.position_x = x;
        }
        if let Some(y) = patch.position_y {
            row.position_y = y;
        }
        if let Some(editor) = &patch.last_editor_id {
            row.last_editor_id = Some(editor.clone());
        }
        if !patch.is_empty() {
            row.updated_at = now_secs();
        }

        let row = tables.nodes.get(node_id).unwrap().clone();
        Ok(tables.record(&row))
    }

    /// Overwrite a node's content and refresh `updated_at` (coalesced flush path).
    pub fn set_content(&self, node_id: &str, content: String) -> Result<(), StoreError> {
        let mut tables = self.tables.write().unwrap();
        let row = tables
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| StoreError::NotFound(node_id.to_string()))?;
        row.content = content;
        row.updated_at = now_secs();
        Ok(())
    }

    /// Remove a node and its entire descendant subtree as one atomic unit.
    ///
    /// Returns the removed ids in depth-first order, the top-level id first.
    /// Rows and tag associations go together; catalog entries are retained.
    pub fn remove_subtree(&self, node_id: &str) -> Result<Vec<String>, StoreError> {
        let mut tables = self.tables.write().unwrap();
        if !tables.nodes.contains_key(node_id) {
            return Err(StoreError::NotFound(node_id.to_string()));
        }

        // Depth-first discovery before any mutation
        let mut removed = Vec::new();
        let mut stack = vec![node_id.to_string()];
        while let Some(id) = stack.pop() {
            let mut children: Vec<String> = tables
                .nodes
                .values()
                .filter(|n| n.parent_id.as_deref() == Some(id.as_str()))
                .map(|n| n.id.clone())
                .collect();
            children.sort();
            stack.extend(children);
            removed.push(id);
        }

        for id in &removed {
            tables.nodes.remove(id);
            tables.node_tags.retain(|(nid, _)| nid != id);
        }
        Ok(removed)
    }

    /// Children of a node.
    pub fn children(&self, node_id: &str) -> Vec<NodeRecord> {
        let tables = self.tables.read().unwrap();
        let mut records: Vec<NodeRecord> = tables
            .nodes
            .values()
            .filter(|n| n.parent_id.as_deref() == Some(node_id))
            .map(|row| tables.record(row))
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Case-insensitive substring search over titles, content, and tag names.
    pub fn search(&self, query: &str, limit: usize) -> Vec<SearchHit> {
        if query.is_empty() {
            return Vec::new();
        }
        let needle = query.to_lowercase();
        let tables = self.tables.read().unwrap();
        let mut hits: Vec<SearchHit> = tables
            .nodes
            .values()
            .filter(|n| {
                n.title.to_lowercase().contains(&needle)
                    || n.content.to_lowercase().contains(&needle)
                    || tables
                        .tag_names_for(&n.id)
                        .iter()
                        .any(|t| t.to_lowercase().contains(&needle))
            })
            .map(|n| SearchHit {
                id: n.id.clone(),
                title: n.title.clone(),
                parent_id: n.parent_id.clone(),
            })
            .collect();
        hits.sort_by(|a, b| a.id.cmp(&b.id));
        hits.truncate(limit);
        hits
    }

    /// All tag names in the catalog, sorted.
    pub fn list_tags(&self) -> Vec<String> {
        let tables = self.tables.read().unwrap();
        let mut names: Vec<String> = tables.tags.values().cloned().collect();
        names.sort();
        names
    }

    /// Flush the whole store to the durable snapshot file.
    ///
    /// No-op when opened in-memory. This is the only durability capability
    /// the store exposes; backup rotation lives outside the core.
    pub fn export(&self) -> Result<(), StoreError> {
        let path = match &self.config.snapshot_path {
            Some(p) => p.clone(),
            None => return Ok(()),
        };
        let bytes = {
            let tables = self.tables.read().unwrap();
            bincode::serde::encode_to_vec(&*tables, bincode::config::standard())
                .map_err(|e| StoreError::SerializationError(e.to_string()))?
        };
        let compressed = lz4_flex::compress_prepend_size(&bytes);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&path, compressed)?;
        log::debug!("Store snapshot written: {} ({} bytes)", path.display(), bytes.len());
        Ok(())
    }
}
