//! Batched replication fan-out from a partition owner to its backups.
//!
//! Acknowledged owner writes are enqueued per backup node and flushed in
//! batches (size or interval triggered). The consistency level decides when
//! the originating write reaches `REPLICATED`: `STRONG` after every backup
//! acks, `QUORUM` after a majority (owner counted), `EVENTUAL` immediately.
//! Send failures retry with backoff; exhausting retries marks the backup
//! unhealthy but never undoes the owner write.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};

use tidemark_core::messages::{
    ReplicationBatchAckPayload, ReplicationBatchPayload, ReplicationPayload, WriteConcern,
};

use crate::ack::WriteAckManager;
use crate::config::{Consistency, ReplicationConfig};
use crate::error::EngineError;

/// Transport used to deliver replication batches to a backup node.
///
/// The network layer implements this; tests stub it.
#[async_trait]
pub trait BackupTransport: Send + Sync {
    /// Sends one batch and waits for the backup's acknowledgment.
    async fn send_batch(
        &self,
        node_id: &str,
        batch: ReplicationBatchPayload,
    ) -> anyhow::Result<ReplicationBatchAckPayload>;
}

/// Events the queue publishes for the health monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationEvent {
    /// A backup exhausted its retries and is considered unhealthy.
    BackupUnhealthy { node_id: String },
    /// A backup acknowledged a batch.
    BatchAcked { node_id: String, entries: usize },
}

/// Replication lag snapshot, milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LagStats {
    pub current: u64,
    pub avg: f64,
    pub max: u64,
    pub p99: u64,
}

struct QueuedEntry {
    payload: ReplicationPayload,
}

struct AckTracker {
    op_id: u64,
    remaining: usize,
}

const LAG_WINDOW: usize = 1024;

/// The owner-side replication queue.
pub struct ReplicationQueue {
    config: ReplicationConfig,
    transport: Arc<dyn BackupTransport>,
    acks: Arc<WriteAckManager>,
    /// Per-backup outbound queues.
    queues: DashMap<String, VecDeque<QueuedEntry>>,
    /// Entries queued across all backups, for the capacity bound.
    queued_total: AtomicUsize,
    drained: Notify,
    flush_now: Notify,
    next_sequence: AtomicU64,
    /// Outstanding backup acks per sequence number.
    trackers: DashMap<u64, AckTracker>,
    lag_window: Mutex<VecDeque<u64>>,
    events: broadcast::Sender<ReplicationEvent>,
}

impl ReplicationQueue {
    /// Creates a queue; call [`ReplicationQueue::spawn_flusher`] to start
    /// the background flush task.
    #[must_use]
    pub fn new(
        config: ReplicationConfig,
        transport: Arc<dyn BackupTransport>,
        acks: Arc<WriteAckManager>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            config,
            transport,
            acks,
            queues: DashMap::new(),
            queued_total: AtomicUsize::new(0),
            drained: Notify::new(),
            flush_now: Notify::new(),
            next_sequence: AtomicU64::new(1),
            trackers: DashMap::new(),
            lag_window: Mutex::new(VecDeque::with_capacity(LAG_WINDOW)),
            events,
        })
    }

    /// Subscribes to queue events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ReplicationEvent> {
        self.events.subscribe()
    }

    /// Enqueues one acknowledged owner write for its backups.
    ///
    /// Under `STRONG`/`QUORUM` the originating op's write-ack reaches
    /// `REPLICATED` only after enough backups ack; under `EVENTUAL` it is
    /// notified immediately. With no backups, every level is trivially
    /// satisfied at once.
    ///
    /// # Errors
    ///
    /// [`EngineError::Backpressure`] when the queue is at capacity under a
    /// strict consistency level after the blocking wait is interrupted.
    pub async fn enqueue(
        &self,
        mut payload: ReplicationPayload,
        backups: &[String],
        consistency: Consistency,
        op_id: Option<u64>,
    ) -> Result<u64, EngineError> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        payload.sequence = sequence;

        if backups.is_empty() {
            if let Some(op_id) = op_id {
                self.acks.notify_level(op_id, WriteConcern::Replicated);
            }
            return Ok(sequence);
        }

        self.reserve_capacity(backups.len(), consistency).await?;

        let needed = match consistency {
            Consistency::Strong => backups.len(),
            // Quorum counts the owner itself, so ceil((backups+1+1)/2) - 1
            // backup acks are required.
            Consistency::Quorum => (backups.len() + 2) / 2 - 1,
            Consistency::Eventual => 0,
        };
        if let Some(op_id) = op_id {
            if needed == 0 {
                self.acks.notify_level(op_id, WriteConcern::Replicated);
            } else {
                self.trackers.insert(
                    sequence,
                    AckTracker {
                        op_id,
                        remaining: needed,
                    },
                );
            }
        }

        for node in backups {
            self.queues
                .entry(node.clone())
                .or_default()
                .push_back(QueuedEntry {
                    payload: payload.clone(),
                });
            self.queued_total.fetch_add(1, Ordering::SeqCst);
        }
        metrics::gauge!("replication_queue_depth").set(self.queued_len() as f64);

        if self.largest_queue_len() >= self.config.batch_size {
            self.flush_now.notify_waiters();
        }
        Ok(sequence)
    }

    /// Entries currently queued across all backups.
    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.queued_total.load(Ordering::SeqCst)
    }

    /// Current lag snapshot from the sliding sample window.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    pub fn lag_stats(&self) -> LagStats {
        let window = self.lag_window.lock();
        if window.is_empty() {
            return LagStats {
                current: 0,
                avg: 0.0,
                max: 0,
                p99: 0,
            };
        }
        let current = *window.back().unwrap_or(&0);
        let max = window.iter().copied().max().unwrap_or(0);
        let avg = window.iter().sum::<u64>() as f64 / window.len() as f64;
        let mut sorted: Vec<u64> = window.iter().copied().collect();
        sorted.sort_unstable();
        let p99_index = ((sorted.len() as f64) * 0.99).ceil() as usize;
        let p99 = sorted[p99_index.saturating_sub(1).min(sorted.len() - 1)];
        LagStats {
            current,
            avg,
            max,
            p99,
        }
    }

    /// Starts the background flusher. Returns its join handle; aborting it
    /// stops flushing.
    pub fn spawn_flusher(self: &Arc<Self>, wall_millis: Arc<dyn Fn() -> u64 + Send + Sync>) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let interval = Duration::from_millis(queue.config.batch_interval_ms.max(1));
            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {}
                    () = queue.flush_now.notified() => {}
                }
                queue.flush_all(&wall_millis).await;
            }
        })
    }

    /// Drains and sends every backup's queue once. Public for deterministic
    /// tests; the flusher task calls it on its trigger.
    pub async fn flush_all(&self, wall_millis: &Arc<dyn Fn() -> u64 + Send + Sync>) {
        let nodes: Vec<String> = self.queues.iter().map(|e| e.key().clone()).collect();
        for node in nodes {
            self.flush_node(&node, wall_millis).await;
        }
    }

    async fn flush_node(&self, node: &str, wall_millis: &Arc<dyn Fn() -> u64 + Send + Sync>) {
        loop {
            let batch: Vec<QueuedEntry> = {
                let Some(mut queue) = self.queues.get_mut(node) else {
                    return;
                };
                let take = queue.len().min(self.config.batch_size);
                queue.drain(..take).collect()
            };
            if batch.is_empty() {
                return;
            }
            let entries: Vec<ReplicationPayload> =
                batch.iter().map(|e| e.payload.clone()).collect();
            let count = entries.len();

            let mut sent = false;
            for attempt in 0..=self.config.max_retries {
                let send = self.transport.send_batch(
                    node,
                    ReplicationBatchPayload {
                        entries: entries.clone(),
                    },
                );
                let deadline = Duration::from_millis(self.config.ack_timeout_ms);
                match tokio::time::timeout(deadline, send).await {
                    Ok(Ok(ack)) => {
                        self.record_ack(&ack, wall_millis);
                        let _ = self.events.send(ReplicationEvent::BatchAcked {
                            node_id: node.to_string(),
                            entries: count,
                        });
                        sent = true;
                        break;
                    }
                    Ok(Err(error)) => {
                        tracing::warn!(node, attempt, %error, "replication batch failed");
                    }
                    Err(_) => {
                        tracing::warn!(node, attempt, "replication batch timed out");
                        metrics::counter!("replication_timeouts").increment(1);
                    }
                }
                if attempt < self.config.max_retries {
                    let backoff = Duration::from_millis(
                        self.config.batch_interval_ms << attempt.min(6),
                    );
                    tokio::time::sleep(backoff).await;
                }
            }

            self.queued_total.fetch_sub(count, Ordering::SeqCst);
            self.drained.notify_waiters();
            metrics::gauge!("replication_queue_depth").set(self.queued_len() as f64);

            if !sent {
                tracing::error!(node, "backup unreachable, marking unhealthy");
                let _ = self.events.send(ReplicationEvent::BackupUnhealthy {
                    node_id: node.to_string(),
                });
                return;
            }
        }
    }

    fn record_ack(
        &self,
        ack: &ReplicationBatchAckPayload,
        wall_millis: &Arc<dyn Fn() -> u64 + Send + Sync>,
    ) {
        let now = wall_millis();
        for entry_ack in &ack.acks {
            let lag = now.saturating_sub(entry_ack.op_timestamp.millis);
            {
                let mut window = self.lag_window.lock();
                if window.len() == LAG_WINDOW {
                    window.pop_front();
                }
                window.push_back(lag);
            }
            metrics::histogram!("replication_lag_ms").record(lag as f64);

            let mut done = None;
            if let Some(mut tracker) = self.trackers.get_mut(&entry_ack.sequence) {
                tracker.remaining = tracker.remaining.saturating_sub(1);
                if tracker.remaining == 0 {
                    done = Some(tracker.op_id);
                }
            }
            if let Some(op_id) = done {
                self.trackers.remove(&entry_ack.sequence);
                self.acks.notify_level(op_id, WriteConcern::Replicated);
            }
        }
    }

    async fn reserve_capacity(
        &self,
        needed: usize,
        consistency: Consistency,
    ) -> Result<(), EngineError> {
        loop {
            let queued = self.queued_total.load(Ordering::SeqCst);
            if queued + needed <= self.config.queue_size_limit {
                return Ok(());
            }
            match consistency {
                // Strict levels block the producer until the flusher drains.
                Consistency::Strong | Consistency::Quorum => {
                    tracing::debug!(queued, "replication queue full, blocking producer");
                    self.flush_now.notify_waiters();
                    self.drained.notified().await;
                }
                // Eventual drops the oldest queued entry to make room.
                Consistency::Eventual => {
                    let victim = self
                        .queues
                        .iter()
                        .max_by_key(|e| e.len())
                        .map(|e| e.key().clone());
                    let Some(node) = victim else {
                        return Err(EngineError::Backpressure {
                            pending_count: queued,
                            max_pending: self.config.queue_size_limit,
                        });
                    };
                    if let Some(mut queue) = self.queues.get_mut(&node) {
                        if queue.pop_front().is_some() {
                            self.queued_total.fetch_sub(1, Ordering::SeqCst);
                            tracing::warn!(node, "dropped oldest queued replication entry");
                        }
                    }
                }
            }
        }
    }

    fn largest_queue_len(&self) -> usize {
        self.queues.iter().map(|e| e.len()).max().unwrap_or(0)
    }
}
