//! CRDT record types.
//!
//! Three record families cover the map kinds the engine replicates:
//! last-write-wins registers, observed-remove entries, and PN counter state.
//! The wire carries them as the tagged [`Record`] variant tree.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::hlc::Timestamp;
use crate::value::Value;

/// A last-write-wins register: one value, one causal timestamp.
///
/// `value: None` is a tombstone; deletion is a tombstone write with a fresh
/// timestamp. The optional `ttl_ms` expires the record relative to its
/// timestamp without a tombstone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(bound(
    serialize = "V: Serialize",
    deserialize = "V: DeserializeOwned"
))]
pub struct LwwRecord<V> {
    /// The stored value, or `None` for a tombstone.
    pub value: Option<V>,
    /// Timestamp assigned by the writer's hybrid clock.
    pub timestamp: Timestamp,
    /// Optional time-to-live in milliseconds from `timestamp.millis`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ttl_ms: Option<u64>,
}

impl<V> LwwRecord<V> {
    /// A tombstone at the given timestamp.
    #[must_use]
    pub fn tombstone(timestamp: Timestamp) -> Self {
        Self {
            value: None,
            timestamp,
            ttl_ms: None,
        }
    }

    /// Whether this record is a deletion marker.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// One tagged observation in an observed-remove map entry.
///
/// Every add gets a unique `tag` (the timestamp wire string of the adding
/// node); removes name the tags they observed, so concurrent adds survive
/// removals that never saw them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(bound(
    serialize = "V: Serialize",
    deserialize = "V: DeserializeOwned"
))]
pub struct OrRecord<V> {
    /// The observed value.
    pub value: V,
    /// Unique observation tag, `"millis:counter:nodeId"` of the add.
    pub tag: String,
    /// Timestamp of the add.
    pub timestamp: Timestamp,
    /// Optional time-to-live in milliseconds from `timestamp.millis`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ttl_ms: Option<u64>,
}

/// Per-node increment/decrement vectors of a PN counter.
///
/// The projected value is `sum(p) - sum(n)`; merge is element-wise max on
/// both vectors, which makes it commutative, associative, and idempotent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PnState {
    /// Per-node cumulative increments.
    pub p: HashMap<String, f64>,
    /// Per-node cumulative decrements.
    pub n: HashMap<String, f64>,
}

impl PnState {
    /// The counter's projected value.
    #[must_use]
    pub fn value(&self) -> f64 {
        self.p.values().sum::<f64>() - self.n.values().sum::<f64>()
    }

    /// Element-wise-max merge of another state into this one.
    ///
    /// Returns `true` when any slot changed.
    pub fn merge(&mut self, other: &PnState) -> bool {
        let mut changed = false;
        for (node, value) in &other.p {
            let slot = self.p.entry(node.clone()).or_insert(0.0);
            if *value > *slot {
                *slot = *value;
                changed = true;
            }
        }
        for (node, value) in &other.n {
            let slot = self.n.entry(node.clone()).or_insert(0.0);
            if *value > *slot {
                *slot = *value;
                changed = true;
            }
        }
        changed
    }
}

/// Tagged record variant carried by sync deltas and replication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Record {
    /// Last-write-wins register state.
    Lww(LwwRecord<Value>),
    /// Observed-remove entry state: live observations plus removed tags.
    Or {
        records: Vec<OrRecord<Value>>,
        tombstones: Vec<String>,
    },
    /// PN counter vectors.
    Counter(PnState),
}
