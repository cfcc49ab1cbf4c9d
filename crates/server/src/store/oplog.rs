//! Client-side write-ahead journal of mutations pending server
//! acknowledgment.
//!
//! Every local mutation is appended before it is pushed; entries flip to
//! synced exactly once, when the server's ack covers their id. Ids are
//! assigned by the storage adapter, strictly increasing, never reused.
//!
//! Backpressure: when the pending backlog reaches `max_pending_ops`, appends
//! follow the configured policy: block until the backlog drains, drop the
//! oldest non-critical entry, or fail with a backpressure error.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use tidemark_core::messages::{Operation, WriteConcern};

use crate::config::{BackpressureConfig, BackpressureStrategy};
use crate::error::EngineError;
use crate::storage::{StorageAdapter, StoredOp};

/// The pending-op journal.
pub struct Oplog {
    storage: Arc<dyn StorageAdapter>,
    config: BackpressureConfig,
    pending_count: AtomicUsize,
    /// Ids explicitly dropped by the backpressure policy; excluded from
    /// resends without touching the synced flag of anything else.
    dropped: Mutex<HashSet<u64>>,
    drained: Notify,
}

impl Oplog {
    /// Opens the journal over a storage adapter, counting any entries that
    /// were pending when the process last stopped.
    ///
    /// # Errors
    ///
    /// [`EngineError::Storage`] when the adapter fails to enumerate pending
    /// entries.
    pub async fn open(
        storage: Arc<dyn StorageAdapter>,
        config: BackpressureConfig,
    ) -> Result<Self, EngineError> {
        let pending = storage
            .get_pending_ops()
            .await
            .map_err(EngineError::Storage)?;
        Ok(Self {
            storage,
            config,
            pending_count: AtomicUsize::new(pending.len()),
            dropped: Mutex::new(HashSet::new()),
            drained: Notify::new(),
        })
    }

    /// Number of entries awaiting acknowledgment.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending_count.load(Ordering::SeqCst)
    }

    /// Fails fast when the backlog is full under the `throw` policy.
    ///
    /// Callers that mutate state before journaling use this to reject the
    /// write before anything is applied. `block` and `drop` policies resolve
    /// inside [`Oplog::append`] instead.
    ///
    /// # Errors
    ///
    /// [`EngineError::Backpressure`] when the backlog is at capacity and
    /// the policy is `throw`.
    pub fn ensure_capacity(&self) -> Result<(), EngineError> {
        let pending = self.pending_count.load(Ordering::SeqCst);
        if self.config.strategy == BackpressureStrategy::Throw
            && pending >= self.config.max_pending_ops
        {
            return Err(EngineError::Backpressure {
                pending_count: pending,
                max_pending: self.config.max_pending_ops,
            });
        }
        Ok(())
    }

    /// Appends a mutation, returning its assigned id.
    ///
    /// # Errors
    ///
    /// [`EngineError::Backpressure`] when the backlog is full under the
    /// `throw` policy (or under `drop` with nothing droppable);
    /// [`EngineError::Storage`] when the adapter fails.
    pub async fn append(&self, op: Operation) -> Result<u64, EngineError> {
        loop {
            let pending = self.pending_count.load(Ordering::SeqCst);
            if pending < self.config.max_pending_ops {
                break;
            }
            match self.config.strategy {
                BackpressureStrategy::Block => {
                    tracing::debug!(pending, "oplog backlog full, blocking writer");
                    self.drained.notified().await;
                }
                BackpressureStrategy::Drop => {
                    if !self.drop_oldest_non_critical().await? {
                        return Err(EngineError::Backpressure {
                            pending_count: pending,
                            max_pending: self.config.max_pending_ops,
                        });
                    }
                }
                BackpressureStrategy::Throw => {
                    return Err(EngineError::Backpressure {
                        pending_count: pending,
                        max_pending: self.config.max_pending_ops,
                    });
                }
            }
        }

        let id = self
            .storage
            .append_op_log(op)
            .await
            .map_err(EngineError::Storage)?;
        self.pending_count.fetch_add(1, Ordering::SeqCst);
        metrics::gauge!("oplog_pending").set(self.pending_count() as f64);
        Ok(id)
    }

    /// Pending entries in id order, excluding dropped ones.
    ///
    /// # Errors
    ///
    /// [`EngineError::Storage`] when the adapter fails.
    pub async fn pending(&self) -> Result<Vec<StoredOp>, EngineError> {
        let dropped = self.dropped.lock().clone();
        let mut entries = self
            .storage
            .get_pending_ops()
            .await
            .map_err(EngineError::Storage)?;
        entries.retain(|e| !dropped.contains(&e.op.id));
        entries.sort_by_key(|e| e.op.id);
        Ok(entries)
    }

    /// Flips every pending entry with `id <= up_to` to synced.
    ///
    /// # Errors
    ///
    /// [`EngineError::Storage`] when the adapter fails.
    pub async fn mark_synced(&self, up_to: u64) -> Result<usize, EngineError> {
        let flipped = self
            .storage
            .mark_ops_synced(up_to)
            .await
            .map_err(EngineError::Storage)?;
        if flipped > 0 {
            self.pending_count.fetch_sub(flipped, Ordering::SeqCst);
            self.drained.notify_waiters();
        }
        self.dropped.lock().retain(|id| *id > up_to);
        metrics::gauge!("oplog_pending").set(self.pending_count() as f64);
        Ok(flipped)
    }

    /// Drops the oldest pending entry whose write concern does not demand
    /// durability. Returns whether anything was dropped.
    async fn drop_oldest_non_critical(&self) -> Result<bool, EngineError> {
        let pending = self.pending().await?;
        let victim = pending.iter().find(|e| {
            e.op
                .write_concern
                .unwrap_or(WriteConcern::Applied)
                .rank()
                <= WriteConcern::Memory.rank()
        });
        let Some(victim) = victim else {
            return Ok(false);
        };
        tracing::warn!(id = victim.op.id, map = %victim.op.map_name, "dropping pending op under backpressure");
        self.dropped.lock().insert(victim.op.id);
        self.pending_count.fetch_sub(1, Ordering::SeqCst);
        self.drained.notify_waiters();
        Ok(true)
    }
}
