//! Sync domain payloads: operation push, acknowledgment, and delta pull.

use serde::{Deserialize, Serialize};

use crate::hlc::Timestamp;
use crate::record::Record;

use super::base::{OpResult, Operation, RoutingHint};

/// A single operation pushed client-to-server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpPayload {
    /// The operation.
    pub op: Operation,
    /// Present on direct-routed pushes.
    #[serde(skip_serializing_if = "Option::is_none", default, rename = "_routing")]
    pub routing: Option<RoutingHint>,
}

/// A batch of operations pushed client-to-server in oplog id order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpBatchPayload {
    /// Operations, ascending by id.
    pub ops: Vec<Operation>,
    /// Present on direct-routed batches.
    #[serde(skip_serializing_if = "Option::is_none", default, rename = "_routing")]
    pub routing: Option<RoutingHint>,
}

/// Server acknowledgment of a pushed batch.
///
/// `last_id` is the highest oplog id the server durably accepted; the client
/// marks everything up to it synced in one step. Acks are at-most-once: a
/// lost ack is repaired by the client re-pushing, which the server treats
/// idempotently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    /// Highest accepted oplog id.
    pub last_id: u64,
    /// Per-operation outcomes, when the client asked for them.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub results: Option<Vec<OpResult>>,
}

/// Client request for deltas of one map since its last sync watermark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReqPayload {
    /// Map to synchronize.
    pub map_name: String,
    /// Watermark: the greatest record timestamp the client has applied.
    pub last_sync_timestamp: Timestamp,
}

/// One keyed record inside a delta stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRecord {
    /// The key that changed.
    pub key: String,
    /// Its record state, tagged by CRDT kind.
    pub record: Record,
}

/// Server-to-client delta stream frame for one map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDeltaPayload {
    /// Map these records belong to.
    pub map_name: String,
    /// Changed records, ascending by timestamp.
    pub records: Vec<KeyRecord>,
    /// Server watermark after this frame; the client persists it with the
    /// merges, atomically.
    pub server_timestamp: Timestamp,
}
