//! Payload types shared across message domains.

use serde::{Deserialize, Serialize};

use crate::hlc::Timestamp;
use crate::predicate::{Predicate, SortSpec};
use crate::record::{OrRecord, PnState};
use crate::value::Value;

/// Durability level a write waits for before its acknowledgment resolves.
///
/// Strictly ordered; see [`WriteConcern::rank`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WriteConcern {
    /// No acknowledgment at all.
    FireAndForget,
    /// Accepted into the owner's memory.
    Memory,
    /// Applied to the owner's canonical map state.
    Applied,
    /// Acknowledged by the backups the consistency level requires.
    Replicated,
    /// Durably persisted by the storage adapter.
    Persisted,
}

impl WriteConcern {
    /// Position in the durability order; higher is stronger.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            WriteConcern::FireAndForget => 0,
            WriteConcern::Memory => 1,
            WriteConcern::Applied => 2,
            WriteConcern::Replicated => 3,
            WriteConcern::Persisted => 4,
        }
    }

    /// Whether this level satisfies a requested target.
    #[must_use]
    pub fn satisfies(self, target: WriteConcern) -> bool {
        self.rank() >= target.rank()
    }
}

/// Kind of a client operation in the oplog and on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpKind {
    /// LWW set.
    Put,
    /// LWW tombstone.
    Remove,
    /// Observed-remove add.
    OrAdd,
    /// Observed-remove removal of observed tags.
    OrRemove,
    /// PN counter increment.
    Inc,
    /// PN counter decrement.
    Dec,
}

/// Operation-specific payload of an [`Operation`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpBody {
    /// LWW set: the value and its stamp.
    Put {
        value: Value,
        timestamp: Timestamp,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        ttl_ms: Option<u64>,
    },
    /// LWW tombstone at the stamp.
    Remove { timestamp: Timestamp },
    /// Observed-remove add of one tagged observation.
    OrAdd { record: OrRecord<Value> },
    /// Observed-remove removal of exactly these observed tags.
    OrRemove {
        tags: Vec<String>,
        timestamp: Timestamp,
    },
    /// Counter increment by `amount`.
    Inc { amount: f64, state: PnState },
    /// Counter decrement by `amount`.
    Dec { amount: f64, state: PnState },
}

impl OpBody {
    /// The operation kind this body carries.
    #[must_use]
    pub fn kind(&self) -> OpKind {
        match self {
            OpBody::Put { .. } => OpKind::Put,
            OpBody::Remove { .. } => OpKind::Remove,
            OpBody::OrAdd { .. } => OpKind::OrAdd,
            OpBody::OrRemove { .. } => OpKind::OrRemove,
            OpBody::Inc { .. } => OpKind::Inc,
            OpBody::Dec { .. } => OpKind::Dec,
        }
    }
}

/// One client mutation, as journaled and as pushed to the owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Oplog id: monotonic u64 within the writing process.
    pub id: u64,
    /// Target map.
    pub map_name: String,
    /// Target key.
    pub key: String,
    /// The mutation itself.
    pub body: OpBody,
    /// Requested durability; owner default applies when absent.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub write_concern: Option<WriteConcern>,
    /// Acknowledgment timeout override in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub timeout_ms: Option<u64>,
}

/// Routing metadata attached to direct-routed operations so the receiving
/// server can detect misrouting and stale maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingHint {
    /// Partition the sender computed for the key.
    pub partition_id: u32,
    /// Partition-map version the sender routed with.
    pub map_version: u64,
}

/// Query parameters: filter, order, page size, resume position.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySpec {
    /// Filter tree; absent matches every row.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub predicate: Option<Predicate>,
    /// Sort keys, applied in order.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub sort: Vec<SortSpec>,
    /// Page size; absent means server default.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub limit: Option<u32>,
    /// Opaque resume token from the previous page.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cursor: Option<String>,
}

/// Per-operation result inside a batch acknowledgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpResult {
    /// Oplog id this result is for.
    pub id: u64,
    /// Whether the owner applied the operation.
    pub success: bool,
    /// Durability level reached by acknowledgment time.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub achieved_level: Option<WriteConcern>,
    /// Failure detail when `success` is false.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_concern_order_is_strict() {
        let levels = [
            WriteConcern::FireAndForget,
            WriteConcern::Memory,
            WriteConcern::Applied,
            WriteConcern::Replicated,
            WriteConcern::Persisted,
        ];
        for pair in levels.windows(2) {
            assert!(pair[1].rank() > pair[0].rank());
            assert!(pair[1].satisfies(pair[0]));
            assert!(!pair[0].satisfies(pair[1]));
        }
        assert!(WriteConcern::Applied.satisfies(WriteConcern::Applied));
    }

    #[test]
    fn write_concern_wire_names_are_screaming_snake() {
        let bytes = rmp_serde::to_vec_named(&WriteConcern::FireAndForget).unwrap();
        let s: String = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(s, "FIRE_AND_FORGET");
    }

    #[test]
    fn operation_roundtrip() {
        let op = Operation {
            id: 42,
            map_name: "users".into(),
            key: "user/1".into(),
            body: OpBody::Put {
                value: Value::from("Alice"),
                timestamp: Timestamp {
                    millis: 1_000,
                    counter: 0,
                    node_id: "c1".into(),
                },
                ttl_ms: None,
            },
            write_concern: Some(WriteConcern::Replicated),
            timeout_ms: Some(5_000),
        };
        let bytes = rmp_serde::to_vec_named(&op).expect("serialize");
        let decoded: Operation = rmp_serde::from_slice(&bytes).expect("deserialize");
        assert_eq!(op, decoded);
        assert_eq!(decoded.body.kind(), OpKind::Put);
    }

    #[test]
    fn op_body_kinds() {
        let ts = Timestamp {
            millis: 1,
            counter: 0,
            node_id: "n".into(),
        };
        assert_eq!(
            OpBody::Remove { timestamp: ts.clone() }.kind(),
            OpKind::Remove
        );
        assert_eq!(
            OpBody::OrRemove {
                tags: vec![],
                timestamp: ts
            }
            .kind(),
            OpKind::OrRemove
        );
    }
}
