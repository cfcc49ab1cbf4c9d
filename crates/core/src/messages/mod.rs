//! Wire protocol message schemas.
//!
//! One logical message per frame. The envelope is the sealed [`Message`]
//! enum, internally tagged by a `type` discriminator so every frame is
//! self-describing; payload shapes live in the per-domain submodules. Frames
//! are named MsgPack (`rmp_serde::to_vec_named`) with camelCase fields,
//! binary-safe and codec-agnostic at the transport layer.

pub mod base;
pub mod cluster;
pub mod http;
pub mod query;
pub mod search;
pub mod sync;

use serde::{Deserialize, Serialize};

pub use base::{OpBody, OpKind, OpResult, Operation, QuerySpec, RoutingHint, WriteConcern};
pub use cluster::{
    MigrationAckPayload, MigrationChunkPayload, MigrationCompletePayload, MigrationRecord,
    MigrationStartPayload, NotOwnerPayload, PartitionMapDeltaPayload, PartitionMapPayload,
    PartitionMapRequestPayload, ReplicationAckPayload, ReplicationBatchAckPayload,
    ReplicationBatchPayload, ReplicationPayload, StaleMapPayload,
};
pub use http::{
    HealthResponse, HttpQuery, HttpSearch, HttpSyncRequest, HttpSyncResponse, ReadyResponse,
};
pub use query::{
    DeltaKind, QueryRespPayload, QueryRow, QuerySubPayload, QueryUnsubPayload, SubscriptionDelta,
};
pub use search::{
    SearchHit, SearchOptions, SearchRespPayload, SearchSubPayload, SearchUnsubPayload,
};
pub use sync::{AckPayload, KeyRecord, OpBatchPayload, OpPayload, SyncDeltaPayload, SyncReqPayload};

/// The sealed message envelope: every frame on a client or cluster
/// connection is exactly one of these.
///
/// Frames are adjacently tagged — `{"type": "...", "payload": {...}}` — so
/// payload field names (including `SubscriptionDelta`'s own `type`) never
/// collide with the envelope discriminator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    // --- session ---
    /// Client credential presentation, first frame after connect.
    Auth { token: String },
    /// Server confirmation of a successful authentication.
    AuthOk { node_id: String },
    /// Heartbeat probe; `timestamp` is the sender's wall time.
    Ping { timestamp: u64 },
    /// Heartbeat echo carrying the probe timestamp and server wall time.
    Pong { timestamp: u64, server_time: u64 },
    /// Terminal error frame; the sender closes after emitting it.
    Error { code: String, message: String },

    // --- sync ---
    SyncReq(SyncReqPayload),
    SyncDelta(SyncDeltaPayload),
    Op(OpPayload),
    OpBatch(OpBatchPayload),
    Ack(AckPayload),

    // --- query / search subscriptions ---
    QuerySub(QuerySubPayload),
    QueryUnsub(QueryUnsubPayload),
    QueryResp(QueryRespPayload),
    QueryUpdate(SubscriptionDelta),
    SearchSub(SearchSubPayload),
    SearchUnsub(SearchUnsubPayload),
    SearchResp(SearchRespPayload),
    SearchUpdate(SubscriptionDelta),

    // --- partition map distribution ---
    PartitionMap(PartitionMapPayload),
    PartitionMapDelta(PartitionMapDeltaPayload),
    PartitionMapRequest(PartitionMapRequestPayload),
    NotOwner(NotOwnerPayload),
    StaleMap(StaleMapPayload),

    // --- server-to-server ---
    MigrationStart(MigrationStartPayload),
    MigrationChunk(MigrationChunkPayload),
    MigrationComplete(MigrationCompletePayload),
    MigrationAck(MigrationAckPayload),
    Replication(ReplicationPayload),
    ReplicationBatch(ReplicationBatchPayload),
    ReplicationAck(ReplicationAckPayload),
    ReplicationBatchAck(ReplicationBatchAckPayload),
}

impl Message {
    /// Encodes one frame as named MsgPack.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        rmp_serde::to_vec_named(self).expect("message serialization is infallible")
    }

    /// Decodes one frame.
    ///
    /// # Errors
    ///
    /// The decode error for frames that are not a known message shape;
    /// transports surface it as a protocol violation.
    pub fn decode(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }

    /// The wire discriminator, for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Auth { .. } => "AUTH",
            Message::AuthOk { .. } => "AUTH_OK",
            Message::Ping { .. } => "PING",
            Message::Pong { .. } => "PONG",
            Message::Error { .. } => "ERROR",
            Message::SyncReq(_) => "SYNC_REQ",
            Message::SyncDelta(_) => "SYNC_DELTA",
            Message::Op(_) => "OP",
            Message::OpBatch(_) => "OP_BATCH",
            Message::Ack(_) => "ACK",
            Message::QuerySub(_) => "QUERY_SUB",
            Message::QueryUnsub(_) => "QUERY_UNSUB",
            Message::QueryResp(_) => "QUERY_RESP",
            Message::QueryUpdate(_) => "QUERY_UPDATE",
            Message::SearchSub(_) => "SEARCH_SUB",
            Message::SearchUnsub(_) => "SEARCH_UNSUB",
            Message::SearchResp(_) => "SEARCH_RESP",
            Message::SearchUpdate(_) => "SEARCH_UPDATE",
            Message::PartitionMap(_) => "PARTITION_MAP",
            Message::PartitionMapDelta(_) => "PARTITION_MAP_DELTA",
            Message::PartitionMapRequest(_) => "PARTITION_MAP_REQUEST",
            Message::NotOwner(_) => "NOT_OWNER",
            Message::StaleMap(_) => "STALE_MAP",
            Message::MigrationStart(_) => "MIGRATION_START",
            Message::MigrationChunk(_) => "MIGRATION_CHUNK",
            Message::MigrationComplete(_) => "MIGRATION_COMPLETE",
            Message::MigrationAck(_) => "MIGRATION_ACK",
            Message::Replication(_) => "REPLICATION",
            Message::ReplicationBatch(_) => "REPLICATION_BATCH",
            Message::ReplicationAck(_) => "REPLICATION_ACK",
            Message::ReplicationBatchAck(_) => "REPLICATION_BATCH_ACK",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hlc::Timestamp;

    fn ts(millis: u64) -> Timestamp {
        Timestamp {
            millis,
            counter: 0,
            node_id: "n".into(),
        }
    }

    fn roundtrip(msg: &Message) {
        let bytes = msg.encode();
        let decoded = Message::decode(&bytes).expect("decode");
        assert_eq!(msg, &decoded);
    }

    #[test]
    fn session_frames_roundtrip() {
        roundtrip(&Message::Auth {
            token: "secret".into(),
        });
        roundtrip(&Message::AuthOk {
            node_id: "n1".into(),
        });
        roundtrip(&Message::Ping { timestamp: 17 });
        roundtrip(&Message::Pong {
            timestamp: 17,
            server_time: 19,
        });
        roundtrip(&Message::Error {
            code: "PROTOCOL".into(),
            message: "bad frame".into(),
        });
    }

    #[test]
    fn sync_frames_roundtrip() {
        roundtrip(&Message::SyncReq(SyncReqPayload {
            map_name: "users".into(),
            last_sync_timestamp: ts(4),
        }));
        roundtrip(&Message::Ack(AckPayload {
            last_id: 12,
            results: None,
        }));
    }

    #[test]
    fn partition_frames_roundtrip() {
        roundtrip(&Message::PartitionMapRequest(PartitionMapRequestPayload {
            current_version: Some(4),
        }));
        roundtrip(&Message::NotOwner(NotOwnerPayload {
            partition_id: 7,
            current_owner: Some("n2".into()),
            map_version: 9,
        }));
        roundtrip(&Message::StaleMap(StaleMapPayload {
            client_version: 3,
            server_version: 9,
        }));
    }

    #[test]
    fn wire_tag_is_screaming_snake() {
        let json = serde_json::to_value(Message::PartitionMapRequest(
            PartitionMapRequestPayload::default(),
        ))
        .expect("serialize");
        assert_eq!(
            json.get("type").and_then(|t| t.as_str()),
            Some("PARTITION_MAP_REQUEST")
        );
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let frame = serde_json::json!({"type": "BOGUS"});
        let bytes = rmp_serde::to_vec_named(&frame).expect("serialize");
        assert!(Message::decode(&bytes).is_err());
    }

    #[test]
    fn kind_matches_wire_tag() {
        let msg = Message::Ping { timestamp: 0 };
        let json = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(json.get("type").and_then(|t| t.as_str()), Some(msg.kind()));
    }
}
