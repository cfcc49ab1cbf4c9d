//! Owner-side application of pushed operation batches.
//!
//! The inbound path for one operation: routing validation, the
//! conflict-resolution pipeline, the map store merge, durability
//! notifications, persistence, and replication enqueue to the partition's
//! backups. The ack carries the highest accepted id plus per-op results so
//! the client can settle its write-ack promises from a single frame.
//! Re-pushed batches are idempotent: CRDT merges absorb replays.

use std::sync::Arc;

use tidemark_core::messages::{
    AckPayload, OpBatchPayload, OpBody, OpResult, Operation, ReplicationPayload, WriteConcern,
};
use tidemark_core::record::{LwwRecord, Record};
use tidemark_core::{key_to_partition, Timestamp};

use crate::ack::WriteAckManager;
use crate::config::Consistency;
use crate::error::EngineError;
use crate::replication::ReplicationQueue;
use crate::resolve::{ConflictResolver, MergeContext, MergeDecision};
use crate::routing::PartitionRouter;
use crate::store::maps::{MapKind, MapStore};
use crate::storage::StorageAdapter;

/// Applies inbound batches on the partition owner.
pub struct InboundApplier {
    node_id: String,
    store: Arc<MapStore>,
    resolver: Arc<ConflictResolver>,
    replication: Arc<ReplicationQueue>,
    acks: Arc<WriteAckManager>,
    router: Arc<PartitionRouter>,
    storage: Arc<dyn StorageAdapter>,
    consistency: Consistency,
}

impl InboundApplier {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: impl Into<String>,
        store: Arc<MapStore>,
        resolver: Arc<ConflictResolver>,
        replication: Arc<ReplicationQueue>,
        acks: Arc<WriteAckManager>,
        router: Arc<PartitionRouter>,
        storage: Arc<dyn StorageAdapter>,
        consistency: Consistency,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            store,
            resolver,
            replication,
            acks,
            router,
            storage,
            consistency,
        }
    }

    /// Applies a pushed batch and builds its acknowledgment.
    ///
    /// # Errors
    ///
    /// [`EngineError::Routing`] when the batch's routing hint names a
    /// partition this node does not own or a stale map version — the caller
    /// answers `NOT_OWNER`/`STALE_MAP` instead of an ack.
    pub async fn apply_batch(
        &self,
        batch: OpBatchPayload,
        remote_node_id: &str,
    ) -> Result<AckPayload, EngineError> {
        if let Some(hint) = batch.routing {
            self.router
                .validate_routed(&self.node_id, hint.partition_id, hint.map_version)?;
        }

        let mut results = Vec::with_capacity(batch.ops.len());
        let mut last_id = 0;
        for op in batch.ops {
            let id = op.id;
            self.acks.notify_level(id, WriteConcern::Memory);
            let result = self.apply_one(op, remote_node_id).await;
            match result {
                Ok(level) => {
                    last_id = last_id.max(id);
                    results.push(OpResult {
                        id,
                        success: true,
                        achieved_level: Some(level),
                        error: None,
                    });
                }
                Err(error) => {
                    // A rejected or failed op still advances the ack
                    // watermark: the client must not resend it forever.
                    last_id = last_id.max(id);
                    results.push(OpResult {
                        id,
                        success: false,
                        achieved_level: None,
                        error: Some(error.to_string()),
                    });
                }
            }
        }
        metrics::counter!("ops_applied").increment(results.iter().filter(|r| r.success).count() as u64);
        Ok(AckPayload {
            last_id,
            results: Some(results),
        })
    }

    async fn apply_one(
        &self,
        op: Operation,
        remote_node_id: &str,
    ) -> Result<WriteConcern, EngineError> {
        let map_name = op.map_name.clone();
        let key = op.key.clone();

        let (applied_record, op_timestamp) = match op.body {
            OpBody::Put {
                value,
                timestamp,
                ttl_ms,
            } => {
                self.store.ensure_map(&map_name, MapKind::Lww)?;
                let incoming = LwwRecord {
                    value: Some(value),
                    timestamp: timestamp.clone(),
                    ttl_ms,
                };
                let record = self.resolve_lww(&map_name, &key, incoming, remote_node_id)?;
                (record.map(Record::Lww), timestamp)
            }
            OpBody::Remove { timestamp } => {
                self.store.ensure_map(&map_name, MapKind::Lww)?;
                let incoming = LwwRecord::tombstone(timestamp.clone());
                let record = self.resolve_lww(&map_name, &key, incoming, remote_node_id)?;
                (record.map(Record::Lww), timestamp)
            }
            OpBody::OrAdd { record } => {
                self.store.ensure_map(&map_name, MapKind::OrMap)?;
                let timestamp = record.timestamp.clone();
                self.store.or_merge(&map_name, &key, vec![record], &[])?;
                (self.or_state(&map_name, &key), timestamp)
            }
            OpBody::OrRemove { tags, timestamp } => {
                self.store.ensure_map(&map_name, MapKind::OrMap)?;
                self.store.or_remove(&map_name, &key, &tags, timestamp.clone())?;
                (self.or_state(&map_name, &key), timestamp)
            }
            OpBody::Inc { state, .. } | OpBody::Dec { state, .. } => {
                self.store.ensure_map(&map_name, MapKind::PnCounter)?;
                self.store.pn_merge(&map_name, &key, &state)?;
                let snapshot = Record::Counter(state);
                // Counter ops carry no HLC; stamp lag measurement with the
                // owner's wall clock at apply time.
                let now = Timestamp {
                    millis: tidemark_core::hlc::ClockSource::wall_millis(
                        &tidemark_core::SystemClock,
                    ),
                    counter: 0,
                    node_id: self.node_id.clone(),
                };
                (Some(snapshot), now)
            }
        };
        self.acks.notify_level(op.id, WriteConcern::Applied);

        let Some(record) = applied_record else {
            // Resolver kept local state; nothing new to persist or
            // replicate, but the write is applied from the client's view.
            return Ok(WriteConcern::Applied);
        };

        let route = self.router.route(&key);
        let backups = route.as_ref().map_or(&[][..], |r| r.backups.as_slice());
        // Under strict consistency with live backups, REPLICATED is only
        // reached when the tracker counts enough acks; the ack frame must
        // not claim a level beyond what is certain now.
        let replicated_now =
            backups.is_empty() || self.consistency == Consistency::Eventual;
        self.replication
            .enqueue(
                ReplicationPayload {
                    sequence: 0,
                    partition_id: key_to_partition(&key),
                    map_name: map_name.clone(),
                    key: key.clone(),
                    record: record.clone(),
                    op_timestamp,
                },
                backups,
                self.consistency,
                Some(op.id),
            )
            .await?;

        let encoded = rmp_serde::to_vec_named(&record)
            .map_err(|e| EngineError::Protocol(format!("unencodable record: {e}")))?;
        self.storage
            .put(&record_key(&map_name, &key), encoded)
            .await
            .map_err(EngineError::Storage)?;

        if replicated_now {
            self.acks.notify_level(op.id, WriteConcern::Persisted);
            Ok(WriteConcern::Persisted)
        } else {
            Ok(WriteConcern::Applied)
        }
    }

    /// Runs the resolver pipeline and merges the (possibly transformed)
    /// record. Returns the stored record when local state changed.
    fn resolve_lww(
        &self,
        map_name: &str,
        key: &str,
        incoming: LwwRecord<tidemark_core::Value>,
        remote_node_id: &str,
    ) -> Result<Option<LwwRecord<tidemark_core::Value>>, EngineError> {
        let local_value = self.store.get(map_name, key);
        let local_ts = self.store.lww_timestamp(map_name, key);

        let store = Arc::clone(&self.store);
        let map_for_read = map_name.to_string();
        let read_entry = move |k: &str| store.get(&map_for_read, k);

        let decision = self.resolver.resolve(&MergeContext {
            map_name,
            key,
            local_value: local_value.as_ref(),
            remote_value: incoming.value.as_ref(),
            local_timestamp: local_ts.as_ref(),
            remote_timestamp: &incoming.timestamp,
            remote_node_id,
            read_entry: &read_entry,
        });

        match decision {
            MergeDecision::Accept { value } => {
                let record = LwwRecord {
                    value,
                    timestamp: incoming.timestamp,
                    ttl_ms: incoming.ttl_ms,
                };
                let outcome = self.store.lww_merge(map_name, key, record.clone())?;
                Ok(outcome.applied().then_some(record))
            }
            MergeDecision::KeepLocal => Ok(None),
            MergeDecision::Rejected { resolver, reason } => {
                Err(EngineError::ResolverRejection {
                    resolver,
                    map_name: map_name.to_string(),
                    key: key.to_string(),
                    reason,
                })
            }
        }
    }

    fn or_state(&self, map_name: &str, key: &str) -> Option<Record> {
        // Replicate the full entry state so backups converge regardless of
        // what they already hold.
        self.store
            .records_since(map_name, &Timestamp::zero())
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, record)| record)
    }
}

fn record_key(map_name: &str, key: &str) -> String {
    format!("record/{map_name}/{key}")
}
