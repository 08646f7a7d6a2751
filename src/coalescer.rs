//! Debounced persistence of dirty replicas.
//!
//! Every document update (re)arms a per-node quiet-period timer:
//! ```text
//! update ──► schedule_save(n)
//!               │ abort pending timer for n
//!               ▼
//!          sleep(quiet_period) ──► encode full state
//!                                    │ wrap as content payload
//!                                    ▼
//!                                  row write + updated_at refresh
//!                                    │
//!                                    ▼
//!                                  whole-store export (durable)
//! ```
//! A burst of N updates inside the quiet window yields exactly one flush,
//! after the burst goes quiet. Timers for distinct nodes are fully
//! independent; a stalled flush blocks only its own node. A crash before a
//! pending flush fires loses only the merges applied since the last
//! successful flush — peers already received them via room broadcast.
//!
//! Shutdown must call [`PersistenceCoalescer::flush_all_dirty`] before the
//! store is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::CoreError;
use crate::replica::{ContentPayload, DocumentReplicaStore};
use crate::store::{StoreError, TreeStore};

type TimerMap = HashMap<String, (u64, JoinHandle<()>)>;

/// Per-node debounce of replica flushes.
pub struct PersistenceCoalescer {
    quiet_period: Duration,
    timers: Arc<Mutex<TimerMap>>,
    replicas: Arc<DocumentReplicaStore>,
    store: Arc<TreeStore>,
    /// Generation tags so a finished timer only removes its own entry
    generation: AtomicU64,
    flushes: Arc<AtomicU64>,
}

impl PersistenceCoalescer {
    pub fn new(
        quiet_period: Duration,
        replicas: Arc<DocumentReplicaStore>,
        store: Arc<TreeStore>,
    ) -> Self {
        Self {
            quiet_period,
            timers: Arc::new(Mutex::new(HashMap::new())),
            replicas,
            store,
            generation: AtomicU64::new(0),
            flushes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// (Re)start the quiet-period timer for a node, canceling any pending one.
    pub async fn schedule_save(&self, node_id: &str) {
        let stamp = self.generation.fetch_add(1, Ordering::Relaxed);
        let node = node_id.to_string();
        let quiet = self.quiet_period;
        let timers = self.timers.clone();
        let replicas = self.replicas.clone();
        let store = self.store.clone();
        let flushes = self.flushes.clone();

        let mut map = self.timers.lock().await;
        if let Some((_, old)) = map.remove(&node) {
            old.abort();
        }
        let task_node = node.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(quiet).await;
            match flush(&replicas, &store, &task_node).await {
                Ok(true) => {
                    flushes.fetch_add(1, Ordering::Relaxed);
                }
                Ok(false) => {}
                Err(e) => log::error!("Flush failed for node {task_node}: {e}"),
            }
            let mut map = timers.lock().await;
            if map.get(&task_node).map(|(g, _)| *g) == Some(stamp) {
                map.remove(&task_node);
            }
        });
        map.insert(node, (stamp, handle));
    }

    /// Flush one node immediately, canceling its pending timer.
    pub async fn flush_now(&self, node_id: &str) -> Result<(), CoreError> {
        self.cancel(node_id).await;
        if flush(&self.replicas, &self.store, node_id).await? {
            self.flushes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Cancel a pending timer without flushing (structural delete path).
    pub async fn cancel(&self, node_id: &str) -> bool {
        let mut map = self.timers.lock().await;
        match map.remove(node_id) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every pending timer.
    pub async fn cancel_all(&self) {
        let mut map = self.timers.lock().await;
        for (_, (_, handle)) in map.drain() {
            handle.abort();
        }
    }

    /// Synchronously drain every dirty replica (shutdown path).
    ///
    /// Pending timers are canceled first; each dirty node is flushed in turn.
    /// Returns the number of nodes flushed. A failing node is logged and
    /// skipped so one bad row cannot hold the rest of the drain hostage.
    pub async fn flush_all_dirty(&self) -> usize {
        self.cancel_all().await;
        let mut flushed = 0;
        for node in self.replicas.dirty_nodes().await {
            match flush(&self.replicas, &self.store, &node).await {
                Ok(true) => {
                    self.flushes.fetch_add(1, Ordering::Relaxed);
                    flushed += 1;
                }
                Ok(false) => {}
                Err(e) => log::error!("Drain flush failed for node {node}: {e}"),
            }
        }
        if flushed > 0 {
            log::info!("Drained {flushed} dirty replicas");
        }
        flushed
    }

    /// Number of timers currently pending.
    pub async fn pending_count(&self) -> usize {
        self.timers.lock().await.len()
    }

    /// Total successful flushes since construction.
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn quiet_period(&self) -> Duration {
        self.quiet_period
    }
}

/// Encode, wrap, write through, export. Returns false when there was nothing
/// to write (replica evicted or row deleted while the timer was pending).
async fn flush(
    replicas: &DocumentReplicaStore,
    store: &TreeStore,
    node_id: &str,
) -> Result<bool, CoreError> {
    if !replicas.contains(node_id).await {
        return Ok(false);
    }
    let state = replicas.encode_full_state(node_id).await?;
    let content = ContentPayload::wrap(&state);
    match store.set_content(node_id, content) {
        Ok(()) => {}
        Err(StoreError::NotFound(_)) => {
            log::warn!("Node {node_id} deleted before its flush fired");
            return Ok(false);
        }
        Err(e) => return Err(e.into()),
    }
    store.export().map_err(CoreError::from)?;
    replicas.mark_clean(node_id).await;
    log::info!("Saved node {node_id}");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NodeRow, StoreConfig, EMPTY_DOC};
    use yrs::{Text, Transact, WriteTxn};

    const QUIET: Duration = Duration::from_millis(50);

    struct Fixture {
        store: Arc<TreeStore>,
        replicas: Arc<DocumentReplicaStore>,
        coalescer: PersistenceCoalescer,
    }

    fn fixture_with(config: StoreConfig) -> Fixture {
        let store = Arc::new(TreeStore::open(config).unwrap());
        let replicas = Arc::new(DocumentReplicaStore::new(store.clone()));
        let coalescer = PersistenceCoalescer::new(QUIET, replicas.clone(), store.clone());
        Fixture {
            store,
            replicas,
            coalescer,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(StoreConfig::in_memory())
    }

    fn insert_node(store: &TreeStore, id: &str) {
        let root = store.root_id().unwrap();
        let now = crate::store::now_secs();
        store
            .insert_node(NodeRow {
                id: id.to_string(),
                parent_id: Some(root),
                title: "T".into(),
                content: EMPTY_DOC.into(),
                position_x: 0.0,
                position_y: 0.0,
                created_at: now,
                updated_at: now,
                author_id: "tester".into(),
                last_editor_id: None,
            })
            .unwrap();
    }

    fn text_update(text: &str) -> Vec<u8> {
        let doc = yrs::Doc::new();
        let mut txn = doc.transact_mut();
        let t = txn.get_or_insert_text("content");
        t.insert(&mut txn, 0, text);
        drop(txn);
        let txn = doc.transact();
        yrs::ReadTxn::encode_state_as_update_v1(&txn, &yrs::StateVector::default())
    }

    #[tokio::test]
    async fn test_burst_coalesces_to_one_flush() {
        let fx = fixture();
        insert_node(&fx.store, "n1");

        for i in 0..10 {
            fx.replicas
                .apply_update("n1", &text_update(&format!("edit{i}")))
                .await
                .unwrap();
            fx.coalescer.schedule_save("n1").await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(fx.coalescer.flush_count(), 0, "no flush inside the burst");

        tokio::time::sleep(QUIET * 3).await;
        assert_eq!(fx.coalescer.flush_count(), 1, "exactly one flush after quiet");
        assert!(!fx.replicas.is_dirty("n1").await);
        assert_eq!(fx.coalescer.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_flushed_content_decodes_to_replica_state() {
        let fx = fixture();
        insert_node(&fx.store, "n1");

        fx.replicas
            .apply_update("n1", &text_update("durable"))
            .await
            .unwrap();
        fx.coalescer.schedule_save("n1").await;
        tokio::time::sleep(QUIET * 3).await;

        let rec = fx.store.get("n1").unwrap();
        let state = ContentPayload::unwrap(&rec.content).expect("content carries a payload");
        let expected = fx.replicas.encode_full_state("n1").await.unwrap();
        assert_eq!(state, expected);
    }

    #[tokio::test]
    async fn test_timers_independent_across_nodes() {
        let fx = fixture();
        insert_node(&fx.store, "x");
        insert_node(&fx.store, "y");

        fx.replicas.apply_update("x", &text_update("x")).await.unwrap();
        fx.replicas.apply_update("y", &text_update("y")).await.unwrap();
        fx.coalescer.schedule_save("x").await;
        fx.coalescer.schedule_save("y").await;

        // Keep x's burst alive past y's quiet period
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            fx.coalescer.schedule_save("x").await;
        }
        // y flushed on its own schedule despite x's ongoing burst
        assert!(!fx.replicas.is_dirty("y").await);
        assert!(fx.replicas.is_dirty("x").await);

        tokio::time::sleep(QUIET * 3).await;
        assert_eq!(fx.coalescer.flush_count(), 2);
        assert!(!fx.replicas.is_dirty("x").await);
    }

    #[tokio::test]
    async fn test_cancel_prevents_flush() {
        let fx = fixture();
        insert_node(&fx.store, "n1");
        fx.replicas.apply_update("n1", &text_update("z")).await.unwrap();

        fx.coalescer.schedule_save("n1").await;
        assert!(fx.coalescer.cancel("n1").await);
        tokio::time::sleep(QUIET * 3).await;

        assert_eq!(fx.coalescer.flush_count(), 0);
        assert!(fx.replicas.is_dirty("n1").await);
    }

    #[tokio::test]
    async fn test_flush_all_dirty_drains_everything() {
        let fx = fixture();
        insert_node(&fx.store, "a");
        insert_node(&fx.store, "b");
        fx.replicas.apply_update("a", &text_update("a")).await.unwrap();
        fx.replicas.apply_update("b", &text_update("b")).await.unwrap();
        fx.coalescer.schedule_save("a").await;
        fx.coalescer.schedule_save("b").await;

        let flushed = fx.coalescer.flush_all_dirty().await;
        assert_eq!(flushed, 2);
        assert!(fx.replicas.dirty_nodes().await.is_empty());
        assert_eq!(fx.coalescer.pending_count().await, 0);
        assert!(ContentPayload::unwrap(&fx.store.get("a").unwrap().content).is_some());
    }

    #[tokio::test]
    async fn test_flush_survives_node_deleted_while_pending() {
        let fx = fixture();
        insert_node(&fx.store, "gone");
        fx.replicas
            .apply_update("gone", &text_update("bye"))
            .await
            .unwrap();
        fx.coalescer.schedule_save("gone").await;

        fx.store.remove_subtree("gone").unwrap();
        tokio::time::sleep(QUIET * 3).await;
        // Timer fired against a deleted row: logged, skipped, not counted
        assert_eq!(fx.coalescer.flush_count(), 0);
    }

    #[tokio::test]
    async fn test_flush_reaches_snapshot_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.snap");
        let fx = fixture_with(StoreConfig::at(&path));
        insert_node(&fx.store, "n1");

        fx.replicas
            .apply_update("n1", &text_update("on disk"))
            .await
            .unwrap();
        fx.coalescer.flush_now("n1").await.unwrap();

        // A reopened store sees the flushed payload
        let reopened = TreeStore::open(StoreConfig::at(&path)).unwrap();
        let rec = reopened.get("n1").unwrap();
        assert!(ContentPayload::unwrap(&rec.content).is_some());
    }
}
