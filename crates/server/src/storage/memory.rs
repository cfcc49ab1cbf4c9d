//! In-memory storage adapter.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tidemark_core::messages::Operation;

use super::{StorageAdapter, StoredOp};

#[derive(Default)]
struct MemoryState {
    records: BTreeMap<String, Vec<u8>>,
    meta: BTreeMap<String, Vec<u8>>,
    oplog: Vec<StoredOp>,
}

/// Reference storage adapter holding everything in process memory.
///
/// `batch_put` stages into a clone and swaps it in under the lock, so a
/// failure mid-batch can never leave partial writes visible.
#[derive(Default)]
pub struct MemoryAdapter {
    state: Mutex<MemoryState>,
    next_op_id: AtomicU64,
}

impl MemoryAdapter {
    /// Creates an empty adapter. Oplog ids start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            next_op_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    async fn initialize(&self, _name: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.state.lock().records.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> anyhow::Result<()> {
        self.state.lock().records.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.state.lock().records.remove(key);
        Ok(())
    }

    async fn batch_put(&self, entries: Vec<(String, Vec<u8>)>) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        let mut staged = state.records.clone();
        for (key, value) in entries {
            staged.insert(key, value);
        }
        state.records = staged;
        Ok(())
    }

    async fn get_meta(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.state.lock().meta.get(key).cloned())
    }

    async fn set_meta(&self, key: &str, value: Vec<u8>) -> anyhow::Result<()> {
        self.state.lock().meta.insert(key.to_string(), value);
        Ok(())
    }

    async fn get_all_keys(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.state.lock().records.keys().cloned().collect())
    }

    async fn append_op_log(&self, mut op: Operation) -> anyhow::Result<u64> {
        let id = self.next_op_id.fetch_add(1, Ordering::SeqCst);
        op.id = id;
        self.state.lock().oplog.push(StoredOp { op, synced: false });
        Ok(id)
    }

    async fn get_pending_ops(&self) -> anyhow::Result<Vec<StoredOp>> {
        let state = self.state.lock();
        Ok(state
            .oplog
            .iter()
            .filter(|e| !e.synced)
            .cloned()
            .collect())
    }

    async fn mark_ops_synced(&self, up_to: u64) -> anyhow::Result<usize> {
        let mut state = self.state.lock();
        let mut flipped = 0;
        for entry in &mut state.oplog {
            if !entry.synced && entry.op.id <= up_to {
                entry.synced = true;
                flipped += 1;
            }
        }
        Ok(flipped)
    }
}

#[cfg(test)]
mod tests {
    use tidemark_core::messages::OpBody;
    use tidemark_core::Timestamp;
    use tidemark_core::Value;

    use super::*;

    fn op(map: &str, key: &str) -> Operation {
        Operation {
            id: 0,
            map_name: map.to_string(),
            key: key.to_string(),
            body: OpBody::Put {
                value: Value::Int(1),
                timestamp: Timestamp {
                    millis: 1,
                    counter: 0,
                    node_id: "c".into(),
                },
                ttl_ms: None,
            },
            write_concern: None,
            timeout_ms: None,
        }
    }

    #[tokio::test]
    async fn put_get_remove() {
        let store = MemoryAdapter::new();
        store.put("k", vec![1, 2]).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(vec![1, 2]));
        store.remove("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
        // Removing again is a no-op, not an error.
        store.remove("k").await.unwrap();
    }

    #[tokio::test]
    async fn batch_put_is_visible_atomically() {
        let store = MemoryAdapter::new();
        store
            .batch_put(vec![
                ("a".to_string(), vec![1]),
                ("b".to_string(), vec![2]),
            ])
            .await
            .unwrap();
        let mut keys = store.get_all_keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn oplog_ids_are_monotonic_and_never_reused() {
        let store = MemoryAdapter::new();
        let id1 = store.append_op_log(op("m", "a")).await.unwrap();
        let id2 = store.append_op_log(op("m", "b")).await.unwrap();
        assert!(id2 > id1);

        store.mark_ops_synced(id2).await.unwrap();
        let id3 = store.append_op_log(op("m", "c")).await.unwrap();
        assert!(id3 > id2);
    }

    #[tokio::test]
    async fn pending_then_synced_lifecycle() {
        let store = MemoryAdapter::new();
        let id1 = store.append_op_log(op("m", "a")).await.unwrap();
        let id2 = store.append_op_log(op("m", "b")).await.unwrap();

        let pending = store.get_pending_ops().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.windows(2).all(|w| w[0].op.id < w[1].op.id));

        let flipped = store.mark_ops_synced(id1).await.unwrap();
        assert_eq!(flipped, 1);
        let pending = store.get_pending_ops().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].op.id, id2);

        // Idempotent: re-marking flips nothing further.
        assert_eq!(store.mark_ops_synced(id1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn meta_is_separate_namespace() {
        let store = MemoryAdapter::new();
        store.put("x", vec![1]).await.unwrap();
        store.set_meta("x", vec![9]).await.unwrap();
        assert_eq!(store.get("x").await.unwrap(), Some(vec![1]));
        assert_eq!(store.get_meta("x").await.unwrap(), Some(vec![9]));
    }
}
