//! Cluster domain payloads: partition map distribution, routing errors,
//! migration, and server-to-server replication.

use serde::{Deserialize, Serialize};

use crate::hlc::Timestamp;
use crate::partition::{PartitionChange, PartitionMap};
use crate::record::Record;

/// Full partition-map snapshot pushed to clients and peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionMapPayload {
    /// The complete versioned map.
    pub map: PartitionMap,
}

/// Incremental partition-map update.
///
/// Applies only when `previous_version` equals the receiver's current
/// version; otherwise the receiver requests a full snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionMapDeltaPayload {
    /// Version after applying the delta.
    pub version: u64,
    /// Version the delta chains onto.
    pub previous_version: u64,
    /// Ownership changes.
    pub changes: Vec<PartitionChange>,
}

/// Client request for the current partition map.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionMapRequestPayload {
    /// Version the client already has, letting the server answer with a
    /// delta when possible.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub current_version: Option<u64>,
}

/// The receiving node does not own the partition a routed operation named.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotOwnerPayload {
    /// Partition in question.
    pub partition_id: u32,
    /// The owner as this node knows it, a routing hint for the sender.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub current_owner: Option<String>,
    /// This node's partition-map version.
    pub map_version: u64,
}

/// The sender routed with an outdated partition-map version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaleMapPayload {
    /// Version the sender used.
    pub client_version: u64,
    /// Version the server holds.
    pub server_version: u64,
}

// ---------------------------------------------------------------------------
// Migration (chunked partition transfer between servers)
// ---------------------------------------------------------------------------

/// Announces a partition handover and its chunk count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStartPayload {
    /// Partition being moved.
    pub partition_id: u32,
    /// Node giving the partition up.
    pub from_node: String,
    /// Node taking ownership.
    pub to_node: String,
    /// Number of data chunks that will follow.
    pub chunk_count: u32,
}

/// One chunk of partition data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationChunkPayload {
    /// Partition being moved.
    pub partition_id: u32,
    /// Zero-based chunk index.
    pub chunk_index: u32,
    /// Records in this chunk, keyed `(map, key)`.
    pub records: Vec<MigrationRecord>,
}

/// A single record inside a migration chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRecord {
    /// Map the record belongs to.
    pub map_name: String,
    /// Record key.
    pub key: String,
    /// Record state.
    pub record: Record,
}

/// Signals all chunks sent; the receiver acknowledges to commit ownership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationCompletePayload {
    /// Partition whose transfer finished.
    pub partition_id: u32,
    /// Chunks the sender emitted, for the receiver's completeness check.
    pub chunk_count: u32,
}

/// Receiver acknowledgment of a completed (or failed) migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationAckPayload {
    /// Partition the ack refers to.
    pub partition_id: u32,
    /// Whether the receiver holds all chunks.
    pub success: bool,
    /// Failure detail when `success` is false.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Replication (owner to backups)
// ---------------------------------------------------------------------------

/// One replicated record from a partition owner to a backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationPayload {
    /// Sequence number assigned by the owner's replication queue.
    pub sequence: u64,
    /// Partition the record belongs to.
    pub partition_id: u32,
    /// Map the record belongs to.
    pub map_name: String,
    /// Record key.
    pub key: String,
    /// Record state to merge on the backup.
    pub record: Record,
    /// Owner timestamp when the operation was applied; backups echo it so
    /// the owner can measure replication lag.
    pub op_timestamp: Timestamp,
}

/// A batch of replicated records flushed together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationBatchPayload {
    /// Entries in sequence order.
    pub entries: Vec<ReplicationPayload>,
}

/// Backup acknowledgment of a single replicated record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationAckPayload {
    /// Sequence number being acknowledged.
    pub sequence: u64,
    /// Acknowledging backup node.
    pub node_id: String,
    /// Echo of the owner's operation timestamp, for lag measurement.
    pub op_timestamp: Timestamp,
}

/// Backup acknowledgment of a replication batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationBatchAckPayload {
    /// Highest contiguous sequence the backup has applied.
    pub last_sequence: u64,
    /// Acknowledging backup node.
    pub node_id: String,
    /// Per-entry acks, mirroring the batch.
    pub acks: Vec<ReplicationAckPayload>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::{NodeInfo, PartitionEntry};
    use crate::record::{LwwRecord, Record};
    use crate::value::Value;

    #[test]
    fn partition_map_payload_roundtrip() {
        let map = PartitionMap::from_snapshot(
            4,
            vec![NodeInfo {
                node_id: "n1".into(),
                host: "10.0.0.1".into(),
                port: 7400,
            }],
            vec![PartitionEntry {
                partition_id: 3,
                owner: "n1".into(),
                backups: vec![],
            }],
        )
        .unwrap();
        let payload = PartitionMapPayload { map };
        let bytes = rmp_serde::to_vec_named(&payload).expect("serialize");
        let decoded: PartitionMapPayload = rmp_serde::from_slice(&bytes).expect("deserialize");
        assert_eq!(payload, decoded);
    }

    #[test]
    fn replication_roundtrip() {
        let payload = ReplicationPayload {
            sequence: 88,
            partition_id: 12,
            map_name: "users".into(),
            key: "user/1".into(),
            record: Record::Lww(LwwRecord {
                value: Some(Value::Int(1)),
                timestamp: Timestamp {
                    millis: 10,
                    counter: 0,
                    node_id: "n1".into(),
                },
                ttl_ms: None,
            }),
            op_timestamp: Timestamp {
                millis: 10,
                counter: 1,
                node_id: "n1".into(),
            },
        };
        let bytes = rmp_serde::to_vec_named(&payload).expect("serialize");
        let decoded: ReplicationPayload = rmp_serde::from_slice(&bytes).expect("deserialize");
        assert_eq!(payload, decoded);
    }
}
