//! Sync engine: connection lifecycle state machine and the client-side
//! push/pull protocol.
//!
//! One [`SyncSession`] exists per server connection. Its state machine is
//! validated — an invalid transition is logged and ignored, never applied —
//! and a bounded history ring records recent transitions for diagnosis.
//!
//! Push: pending oplog entries are sent in id order in bounded batches; the
//! server's `ACK{lastId}` marks everything up to that id synced in one step.
//! Pull: `SYNC_REQ(map, watermark)` streams back records with greater
//! timestamps; each is merged and the watermark advances to the maximum
//! observed HLC, persisted with the merges.

pub mod apply;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use tidemark_core::messages::{
    AckPayload, OpBatchPayload, RoutingHint, SyncDeltaPayload, SyncReqPayload, WriteConcern,
};
use tidemark_core::record::Record;
use tidemark_core::{Message, Timestamp};

use crate::ack::WriteAckManager;
use crate::config::SyncConfig;
use crate::error::EngineError;
use crate::routing::PartitionRouter;
use crate::store::maps::MapStore;
use crate::store::oplog::Oplog;
use crate::storage::StorageAdapter;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Initial,
    Connecting,
    Authenticating,
    Syncing,
    Connected,
    Disconnected,
    Reconnecting,
    /// Terminal; only an explicit close reaches it.
    Closed,
}

impl SyncState {
    /// Whether `next` is a legal successor of `self`.
    #[must_use]
    pub fn can_transition_to(self, next: SyncState) -> bool {
        use SyncState::{
            Authenticating, Closed, Connected, Connecting, Disconnected, Initial, Reconnecting,
            Syncing,
        };
        if self == Closed {
            return false;
        }
        if next == Closed {
            return true;
        }
        matches!(
            (self, next),
            (Initial | Reconnecting, Connecting)
                | (Connecting, Authenticating)
                | (Authenticating, Syncing)
                | (Syncing, Connected)
                // Transport loss from any live state.
                | (Connecting | Authenticating | Syncing | Connected, Disconnected)
                | (Disconnected, Reconnecting)
        )
    }
}

/// One recorded transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: SyncState,
    pub to: SyncState,
}

/// Validated state machine with a bounded transition history.
pub struct StateMachine {
    state: SyncState,
    history: VecDeque<Transition>,
    history_size: usize,
}

impl StateMachine {
    /// Creates a machine in `Initial` with the given history capacity.
    #[must_use]
    pub fn new(history_size: usize) -> Self {
        Self {
            state: SyncState::Initial,
            history: VecDeque::with_capacity(history_size),
            history_size: history_size.max(1),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Attempts a transition. Invalid attempts are logged and ignored;
    /// returns whether the transition was applied.
    pub fn transition(&mut self, next: SyncState) -> bool {
        if !self.state.can_transition_to(next) {
            tracing::warn!(from = ?self.state, to = ?next, "invalid sync state transition ignored");
            return false;
        }
        let transition = Transition {
            from: self.state,
            to: next,
        };
        if self.history.len() == self.history_size {
            self.history.pop_front();
        }
        self.history.push_back(transition);
        self.state = next;
        true
    }

    /// Recent transitions, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<Transition> {
        self.history.iter().copied().collect()
    }
}

/// Message-level transport used by the client side of a session; the
/// physical framing (WebSocket, HTTP long-poll) lives outside the engine.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Sends a request frame and waits for its reply frame.
    async fn request(&self, message: Message) -> anyhow::Result<Message>;
}

/// Outcome of one push cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushReport {
    /// Batches sent.
    pub batches: usize,
    /// Operations acknowledged.
    pub acked_ops: usize,
    /// Highest acknowledged oplog id, when anything was acked.
    pub last_acked_id: Option<u64>,
}

/// The client side of one server connection.
pub struct SyncSession {
    config: SyncConfig,
    machine: Mutex<StateMachine>,
    oplog: Arc<Oplog>,
    store: Arc<MapStore>,
    storage: Arc<dyn StorageAdapter>,
    transport: Arc<dyn SyncTransport>,
    acks: Arc<WriteAckManager>,
    router: Arc<PartitionRouter>,
}

impl SyncSession {
    /// Creates a session in `Initial`.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SyncConfig,
        oplog: Arc<Oplog>,
        store: Arc<MapStore>,
        storage: Arc<dyn StorageAdapter>,
        transport: Arc<dyn SyncTransport>,
        acks: Arc<WriteAckManager>,
        router: Arc<PartitionRouter>,
    ) -> Self {
        Self {
            machine: Mutex::new(StateMachine::new(config.history_size)),
            config,
            oplog,
            store,
            storage,
            transport,
            acks,
            router,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SyncState {
        self.machine.lock().state()
    }

    /// Attempts a lifecycle transition.
    pub fn transition(&self, next: SyncState) -> bool {
        self.machine.lock().transition(next)
    }

    /// Recent transitions for diagnosis.
    #[must_use]
    pub fn history(&self) -> Vec<Transition> {
        self.machine.lock().history()
    }

    /// Pushes all pending oplog entries in batches, marking acked prefixes
    /// synced and feeding per-op results to the write-ack manager.
    ///
    /// # Errors
    ///
    /// [`EngineError::Transport`] when a batch exchange fails or times out;
    /// [`EngineError::Protocol`] on an unexpected reply frame. Already-acked
    /// batches stay acked either way — a retry pushes only what remains.
    pub async fn push_pending(&self) -> Result<PushReport, EngineError> {
        let pending = self.oplog.pending().await?;
        let mut report = PushReport {
            batches: 0,
            acked_ops: 0,
            last_acked_id: None,
        };
        for chunk in pending.chunks(self.config.batch_size.max(1)) {
            let ops: Vec<_> = chunk.iter().map(|e| e.op.clone()).collect();
            let routing = self.routing_hint(&ops);
            let batch = Message::OpBatch(OpBatchPayload {
                ops: ops.clone(),
                routing,
            });

            let deadline = Duration::from_millis(self.config.ack_timeout_ms);
            let reply = tokio::time::timeout(deadline, self.transport.request(batch))
                .await
                .map_err(|_| EngineError::Transport("ack timeout".to_string()))?
                .map_err(|e| EngineError::Transport(e.to_string()))?;

            let ack = match reply {
                Message::Ack(ack) => ack,
                Message::NotOwner(payload) => {
                    self.router.handle_not_owner(&payload);
                    return Err(EngineError::Routing(
                        crate::error::RoutingError::NotOwner {
                            partition_id: payload.partition_id,
                            current_owner: payload.current_owner,
                            map_version: payload.map_version,
                        },
                    ));
                }
                Message::StaleMap(payload) => {
                    self.router.handle_stale_map(&payload);
                    return Err(EngineError::Routing(
                        crate::error::RoutingError::StaleMap {
                            client_version: payload.client_version,
                            server_version: payload.server_version,
                        },
                    ));
                }
                other => {
                    return Err(EngineError::Protocol(format!(
                        "expected ACK, got {}",
                        other.kind()
                    )));
                }
            };

            self.settle_ack(&ack, &ops).await?;
            report.batches += 1;
            report.acked_ops += ops.iter().filter(|op| op.id <= ack.last_id).count();
            report.last_acked_id = Some(ack.last_id);
        }
        metrics::counter!("sync_push_batches").increment(report.batches as u64);
        Ok(report)
    }

    /// Pulls deltas for one map since its persisted watermark, merges them,
    /// and advances the watermark to the maximum observed HLC.
    ///
    /// # Errors
    ///
    /// [`EngineError::Transport`]/[`EngineError::Protocol`] on exchange
    /// failures; [`EngineError::Storage`] when the watermark cannot be
    /// persisted.
    pub async fn pull_map(&self, map_name: &str) -> Result<usize, EngineError> {
        let watermark = self.load_watermark(map_name).await?;
        let reply = self
            .transport
            .request(Message::SyncReq(SyncReqPayload {
                map_name: map_name.to_string(),
                last_sync_timestamp: watermark.clone(),
            }))
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        let Message::SyncDelta(delta) = reply else {
            return Err(EngineError::Protocol(format!(
                "expected SYNC_DELTA, got {}",
                reply.kind()
            )));
        };
        self.merge_delta(&delta, watermark).await
    }

    /// Merges one delta frame and persists the advanced watermark.
    ///
    /// # Errors
    ///
    /// [`EngineError::Storage`] when persisting the watermark fails.
    pub async fn merge_delta(
        &self,
        delta: &SyncDeltaPayload,
        mut watermark: Timestamp,
    ) -> Result<usize, EngineError> {
        let mut merged = 0;
        for keyed in &delta.records {
            match &keyed.record {
                Record::Lww(record) => {
                    if record.timestamp > watermark {
                        watermark = record.timestamp.clone();
                    }
                    if self
                        .store
                        .lww_merge(&delta.map_name, &keyed.key, record.clone())?
                        .applied()
                    {
                        merged += 1;
                    }
                }
                Record::Or { records, tombstones } => {
                    if let Some(max) = records.iter().map(|r| &r.timestamp).max() {
                        if *max > watermark {
                            watermark = max.clone();
                        }
                    }
                    if self
                        .store
                        .or_merge(&delta.map_name, &keyed.key, records.clone(), tombstones)?
                        .applied()
                    {
                        merged += 1;
                    }
                }
                Record::Counter(state) => {
                    if self.store.pn_merge(&delta.map_name, &keyed.key, state)? {
                        merged += 1;
                    }
                }
            }
        }
        if delta.server_timestamp > watermark {
            watermark = delta.server_timestamp.clone();
        }
        self.save_watermark(&delta.map_name, &watermark).await?;
        metrics::counter!("sync_pull_records").increment(merged as u64);
        Ok(merged)
    }

    /// The persisted pull watermark for a map; zero when never synced.
    ///
    /// # Errors
    ///
    /// [`EngineError::Storage`] when the adapter fails.
    pub async fn load_watermark(&self, map_name: &str) -> Result<Timestamp, EngineError> {
        let raw = self
            .storage
            .get_meta(&watermark_key(map_name))
            .await
            .map_err(EngineError::Storage)?;
        match raw {
            Some(bytes) => rmp_serde::from_slice(&bytes)
                .map_err(|e| EngineError::Protocol(format!("corrupt sync watermark: {e}"))),
            None => Ok(Timestamp::zero()),
        }
    }

    async fn save_watermark(&self, map_name: &str, watermark: &Timestamp) -> Result<(), EngineError> {
        let bytes = rmp_serde::to_vec_named(watermark)
            .map_err(|e| EngineError::Protocol(format!("unencodable watermark: {e}")))?;
        self.storage
            .set_meta(&watermark_key(map_name), bytes)
            .await
            .map_err(EngineError::Storage)
    }

    async fn settle_ack(
        &self,
        ack: &AckPayload,
        sent: &[tidemark_core::messages::Operation],
    ) -> Result<(), EngineError> {
        self.oplog.mark_synced(ack.last_id).await?;

        if let Some(results) = &ack.results {
            for result in results {
                if result.success {
                    let level = result.achieved_level.unwrap_or(WriteConcern::Applied);
                    self.acks.notify_level(result.id, level);
                } else {
                    self.acks.fail_pending(
                        result.id,
                        result.error.clone().unwrap_or_else(|| "rejected".to_string()),
                    );
                }
            }
        } else {
            let acked: Vec<u64> = sent
                .iter()
                .filter(|op| op.id <= ack.last_id)
                .map(|op| op.id)
                .collect();
            self.acks.notify_level_batch(&acked, WriteConcern::Applied);
        }
        Ok(())
    }

    /// Routing hint for a batch: present when every op in the batch lands
    /// on the same partition and a map is loaded.
    fn routing_hint(
        &self,
        ops: &[tidemark_core::messages::Operation],
    ) -> Option<RoutingHint> {
        let first = ops.first()?;
        let route = self.router.route(&first.key)?;
        let uniform = ops
            .iter()
            .all(|op| tidemark_core::key_to_partition(&op.key) == route.partition_id);
        uniform.then_some(RoutingHint {
            partition_id: route.partition_id,
            map_version: self.router.version(),
        })
    }
}

fn watermark_key(map_name: &str) -> String {
    format!("sync-watermark/{map_name}")
}
