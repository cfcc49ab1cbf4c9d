//! Storage adapter contract and the in-memory implementation.
//!
//! The engine persists through [`StorageAdapter`]; physical backends
//! (embedded KV stores, SQL, browser storage behind a bridge) implement the
//! same contract. [`MemoryAdapter`] is the canonical in-memory
//! implementation and the default for tests and ephemeral nodes.

mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tidemark_core::messages::Operation;

pub use memory::MemoryAdapter;

/// A journaled operation with its sync state, as stored by the adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredOp {
    /// The journaled operation; `op.id` is the oplog id.
    pub op: Operation,
    /// Flips false -> true exactly once, when the server durably
    /// acknowledges. No other field of a stored entry is ever rewritten.
    pub synced: bool,
}

/// Persistence contract consumed by the engine.
///
/// Semantics every implementation must provide:
///
/// - Each call appears atomic; `batch_put` is atomic across all its entries
///   (all-or-nothing — a failed batch leaves no partial writes).
/// - Reads may run ahead of unflushed writes from the same process.
/// - `append_op_log` assigns strictly increasing ids and never reuses one.
/// - `mark_ops_synced(up_to)` flips only entries with `id <= up_to`.
/// - Missing keys read as `None`, never as an error.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Opens (or creates) the named store.
    async fn initialize(&self, name: &str) -> anyhow::Result<()>;

    /// Flushes and releases the store.
    async fn close(&self) -> anyhow::Result<()>;

    /// Reads a record by key.
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;

    /// Writes a record.
    async fn put(&self, key: &str, value: Vec<u8>) -> anyhow::Result<()>;

    /// Deletes a record. Deleting a missing key is a no-op.
    async fn remove(&self, key: &str) -> anyhow::Result<()>;

    /// Writes many records atomically.
    async fn batch_put(&self, entries: Vec<(String, Vec<u8>)>) -> anyhow::Result<()>;

    /// Reads a metadata value (sync watermarks, schema versions).
    async fn get_meta(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;

    /// Writes a metadata value.
    async fn set_meta(&self, key: &str, value: Vec<u8>) -> anyhow::Result<()>;

    /// Lists every record key.
    async fn get_all_keys(&self) -> anyhow::Result<Vec<String>>;

    /// Appends an operation to the journal, returning its assigned id.
    async fn append_op_log(&self, op: Operation) -> anyhow::Result<u64>;

    /// Journaled operations not yet marked synced, ascending by id.
    async fn get_pending_ops(&self) -> anyhow::Result<Vec<StoredOp>>;

    /// Marks every journaled op with `id <= up_to` as synced. Returns how
    /// many entries flipped.
    async fn mark_ops_synced(&self, up_to: u64) -> anyhow::Result<usize>;
}
