//! Last-write-wins register map.
//!
//! Keys map to a single [`LwwRecord`]; concurrent writes to the same key
//! resolve to the record with the greater [`Timestamp`], node id breaking
//! exact ties. Deletion writes a tombstone that keeps participating in merge
//! resolution until pruned.

use std::collections::HashMap;

use crate::hlc::{HybridClock, Timestamp};
use crate::record::LwwRecord;
use crate::value::Value;

/// How a merge changed the canonical projection of a key.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// Remote record lost; local state unchanged.
    Unchanged,
    /// A previously absent (or tombstoned) key became live.
    Inserted,
    /// A live key's value was replaced. Carries the previous live value.
    Updated { old: Value },
    /// A live key was tombstoned. Carries the previous live value.
    Deleted { old: Value },
    /// The stored record changed without changing the live projection
    /// (tombstone superseded by a newer tombstone, etc.).
    Shadowed,
}

impl MergeOutcome {
    /// Whether the stored record was replaced.
    #[must_use]
    pub fn applied(&self) -> bool {
        !matches!(self, MergeOutcome::Unchanged)
    }
}

/// A last-write-wins map over [`Value`] payloads.
///
/// Owns a [`HybridClock`] for stamping local mutations; remote records enter
/// through [`LwwMap::merge`], which never stamps and never fails.
pub struct LwwMap {
    entries: HashMap<String, LwwRecord<Value>>,
    clock: HybridClock,
}

impl LwwMap {
    /// Creates an empty map stamping with the given clock.
    #[must_use]
    pub fn new(clock: HybridClock) -> Self {
        Self {
            entries: HashMap::new(),
            clock,
        }
    }

    /// Stores a value under a fresh local timestamp and returns the record.
    pub fn set(&mut self, key: impl Into<String>, value: Value, ttl_ms: Option<u64>) -> LwwRecord<Value> {
        let record = LwwRecord {
            value: Some(value),
            timestamp: self.clock.now(),
            ttl_ms,
        };
        self.entries.insert(key.into(), record.clone());
        record
    }

    /// Tombstones a key under a fresh local timestamp.
    ///
    /// A tombstone is written whether or not the key existed, so the deletion
    /// propagates to replicas that saw an add this node never did.
    pub fn remove(&mut self, key: &str) -> LwwRecord<Value> {
        let tombstone = LwwRecord::tombstone(self.clock.now());
        self.entries.insert(key.to_string(), tombstone.clone());
        tombstone
    }

    /// The live value for a key: tombstones and expired records read as
    /// absent.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        let record = self.entries.get(key)?;
        if self.expired(record) {
            return None;
        }
        record.value.as_ref()
    }

    /// The raw stored record, tombstones and expired records included.
    #[must_use]
    pub fn record(&self, key: &str) -> Option<&LwwRecord<Value>> {
        self.entries.get(key)
    }

    /// Merges a remote record for a key.
    ///
    /// The clock observes the remote timestamp first (drift warnings only;
    /// the merge path never fails). The incoming record wins iff its
    /// timestamp is strictly greater than the stored one, or the key is new.
    pub fn merge(&mut self, key: impl Into<String>, incoming: LwwRecord<Value>) -> MergeOutcome {
        let _ = self.clock.observe(&incoming.timestamp);

        let key = key.into();
        let previous = self.entries.get(&key);
        let accept = match previous {
            None => true,
            Some(local) => incoming.timestamp > local.timestamp,
        };
        if !accept {
            return MergeOutcome::Unchanged;
        }

        let old_live = previous.and_then(|r| {
            if self.expired(r) {
                None
            } else {
                r.value.clone()
            }
        });
        let new_live = if self.expired(&incoming) {
            None
        } else {
            incoming.value.clone()
        };
        self.entries.insert(key, incoming);

        match (old_live, new_live) {
            (None, Some(_)) => MergeOutcome::Inserted,
            (Some(old), Some(_)) => MergeOutcome::Updated { old },
            (Some(old), None) => MergeOutcome::Deleted { old },
            (None, None) => MergeOutcome::Shadowed,
        }
    }

    /// Drops tombstones whose timestamp is strictly older than the threshold.
    ///
    /// Live records are never pruned. Returns the pruned keys.
    pub fn prune(&mut self, older_than: &Timestamp) -> Vec<String> {
        let doomed: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, r)| r.is_tombstone() && r.timestamp < *older_than)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            self.entries.remove(key);
        }
        doomed
    }

    /// Iterates live entries (tombstones and expired records skipped).
    pub fn live_entries(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter().filter_map(|(key, record)| {
            if self.expired(record) {
                return None;
            }
            record.value.as_ref().map(|v| (key, v))
        })
    }

    /// Iterates all stored records, tombstones included. This is the sync
    /// path's view: deltas must carry tombstones.
    pub fn records(&self) -> impl Iterator<Item = (&String, &LwwRecord<Value>)> {
        self.entries.iter()
    }

    /// Records whose timestamp is strictly greater than the watermark,
    /// ordered by timestamp. This is the pull-sync delta for a client that
    /// last saw `since`.
    #[must_use]
    pub fn records_since(&self, since: &Timestamp) -> Vec<(String, LwwRecord<Value>)> {
        let mut out: Vec<(String, LwwRecord<Value>)> = self
            .entries
            .iter()
            .filter(|(_, r)| r.timestamp > *since)
            .map(|(k, r)| (k.clone(), r.clone()))
            .collect();
        out.sort_by(|a, b| a.1.timestamp.cmp(&b.1.timestamp));
        out
    }

    /// Number of stored records, tombstones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map stores no records at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Mutable access to the stamping clock (sync sessions observe remote
    /// HLCs through this).
    pub fn clock_mut(&mut self) -> &mut HybridClock {
        &mut self.clock
    }

    fn expired(&self, record: &LwwRecord<Value>) -> bool {
        record.ttl_ms.is_some_and(|ttl| {
            record.timestamp.millis + ttl < self.clock.source().wall_millis()
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering as AtomicOrdering;

    use super::*;
    use crate::hlc::test_support::ManualClock;

    fn make_map(initial: u64) -> (LwwMap, std::sync::Arc<std::sync::atomic::AtomicU64>) {
        let (source, wall) = ManualClock::new(initial);
        (LwwMap::new(HybridClock::new("local", Box::new(source))), wall)
    }

    fn record_at(value: Option<Value>, millis: u64, node: &str) -> LwwRecord<Value> {
        LwwRecord {
            value,
            timestamp: Timestamp {
                millis,
                counter: 0,
                node_id: node.to_string(),
            },
            ttl_ms: None,
        }
    }

    #[test]
    fn set_then_get() {
        let (mut map, _) = make_map(1_000);
        map.set("k", Value::from("v"), None);
        assert_eq!(map.get("k"), Some(&Value::from("v")));
        assert_eq!(map.get("missing"), None);
    }

    #[test]
    fn remove_leaves_a_tombstone() {
        let (mut map, _) = make_map(1_000);
        map.set("k", Value::Int(1), None);
        map.remove("k");
        assert_eq!(map.get("k"), None);
        assert!(map.record("k").unwrap().is_tombstone());
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn remove_unknown_key_still_writes_tombstone() {
        let (mut map, _) = make_map(1_000);
        map.remove("ghost");
        assert!(map.record("ghost").unwrap().is_tombstone());
    }

    #[test]
    fn merge_keeps_greater_timestamp() {
        let (mut map, _) = make_map(1_000);
        assert_eq!(
            map.merge("k", record_at(Some(Value::from("old")), 100, "a")),
            MergeOutcome::Inserted
        );
        assert!(matches!(
            map.merge("k", record_at(Some(Value::from("new")), 200, "b")),
            MergeOutcome::Updated { .. }
        ));
        // Replaying the loser changes nothing.
        assert_eq!(
            map.merge("k", record_at(Some(Value::from("old")), 100, "a")),
            MergeOutcome::Unchanged
        );
        assert_eq!(map.get("k"), Some(&Value::from("new")));
    }

    #[test]
    fn merge_ties_break_by_node_id() {
        let (mut map_ab, _) = make_map(1_000);
        let (mut map_ba, _) = make_map(1_000);
        let a = record_at(Some(Value::from("a")), 100, "node-a");
        let b = record_at(Some(Value::from("b")), 100, "node-b");

        map_ab.merge("k", a.clone());
        map_ab.merge("k", b.clone());
        map_ba.merge("k", b);
        map_ba.merge("k", a);

        assert_eq!(map_ab.get("k"), Some(&Value::from("b")));
        assert_eq!(map_ba.get("k"), Some(&Value::from("b")));
    }

    #[test]
    fn merge_tombstone_reports_deleted_with_old_value() {
        let (mut map, _) = make_map(1_000);
        map.merge("k", record_at(Some(Value::Int(9)), 100, "a"));
        let outcome = map.merge("k", record_at(None, 200, "b"));
        assert_eq!(
            outcome,
            MergeOutcome::Deleted {
                old: Value::Int(9)
            }
        );
    }

    #[test]
    fn merge_tombstone_over_tombstone_is_shadowed() {
        let (mut map, _) = make_map(1_000);
        map.merge("k", record_at(None, 100, "a"));
        assert_eq!(
            map.merge("k", record_at(None, 200, "b")),
            MergeOutcome::Shadowed
        );
    }

    #[test]
    fn ttl_expiry_hides_value() {
        let (mut map, wall) = make_map(1_000);
        map.set("k", Value::from("v"), Some(500));
        assert_eq!(map.get("k"), Some(&Value::from("v")));
        // Expiry boundary is exclusive: millis + ttl < now.
        wall.store(1_500, AtomicOrdering::Relaxed);
        assert_eq!(map.get("k"), Some(&Value::from("v")));
        wall.store(1_501, AtomicOrdering::Relaxed);
        assert_eq!(map.get("k"), None);
        assert!(map.record("k").is_some());
    }

    #[test]
    fn prune_drops_only_old_tombstones() {
        let (mut map, _) = make_map(1_000);
        map.set("live", Value::Int(1), None);
        map.merge("dead", record_at(None, 10, "a"));

        let threshold = Timestamp {
            millis: 500,
            counter: 0,
            node_id: String::new(),
        };
        assert_eq!(map.prune(&threshold), vec!["dead".to_string()]);
        assert!(map.record("dead").is_none());
        assert!(map.record("live").is_some());

        // Future threshold still never touches live records.
        let far = Timestamp {
            millis: u64::MAX,
            counter: 0,
            node_id: String::new(),
        };
        assert!(map.prune(&far).is_empty());
    }

    #[test]
    fn records_since_returns_ordered_delta() {
        let (mut map, _) = make_map(1_000);
        map.merge("a", record_at(Some(Value::Int(1)), 100, "n"));
        map.merge("b", record_at(Some(Value::Int(2)), 300, "n"));
        map.merge("c", record_at(None, 200, "n"));

        let since = Timestamp {
            millis: 100,
            counter: 0,
            node_id: "n".into(),
        };
        let delta = map.records_since(&since);
        let keys: Vec<&str> = delta.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["c", "b"]);
    }

    #[test]
    fn live_entries_skips_tombstones() {
        let (mut map, _) = make_map(1_000);
        map.set("a", Value::Int(1), None);
        map.set("b", Value::Int(2), None);
        map.remove("b");
        let live: Vec<&String> = map.live_entries().map(|(k, _)| k).collect();
        assert_eq!(live, vec![&"a".to_string()]);
    }
}

#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use super::*;
    use crate::hlc::test_support::ManualClock;

    fn fresh_map() -> LwwMap {
        let (source, _) = ManualClock::new(u64::MAX / 2);
        LwwMap::new(HybridClock::new("prop", Box::new(source)))
    }

    fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1_u64..1_000_000, 0_u32..100, "[a-z]{1,6}").prop_map(|(millis, counter, node_id)| {
            Timestamp {
                millis,
                counter,
                node_id,
            }
        })
    }

    fn arb_record() -> impl Strategy<Value = LwwRecord<Value>> {
        (
            prop::option::of(any::<i64>().prop_map(Value::Int)),
            arb_timestamp(),
        )
            .prop_map(|(value, timestamp)| LwwRecord {
                value,
                timestamp,
                ttl_ms: None,
            })
    }

    proptest! {
        /// Final state depends on the multiset of records, not arrival order.
        #[test]
        fn merge_is_commutative(r1 in arb_record(), r2 in arb_record()) {
            let mut forward = fresh_map();
            forward.merge("k", r1.clone());
            forward.merge("k", r2.clone());

            let mut reverse = fresh_map();
            reverse.merge("k", r2);
            reverse.merge("k", r1);

            prop_assert_eq!(forward.record("k"), reverse.record("k"));
        }

        #[test]
        fn merge_is_idempotent(r in arb_record()) {
            let mut map = fresh_map();
            map.merge("k", r.clone());
            let snapshot = map.record("k").cloned();
            let outcome = map.merge("k", r);
            prop_assert!(!outcome.applied());
            prop_assert_eq!(map.record("k").cloned(), snapshot);
        }

        /// All six permutations of three records converge.
        #[test]
        fn merge_is_associative_in_effect(
            r1 in arb_record(),
            r2 in arb_record(),
            r3 in arb_record(),
        ) {
            let mut reference = None;
            let records = [r1, r2, r3];
            for order in [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]] {
                let mut map = fresh_map();
                for i in order {
                    map.merge("k", records[i].clone());
                }
                let state = map.record("k").cloned();
                match &reference {
                    None => reference = Some(state),
                    Some(expected) => prop_assert_eq!(expected, &state),
                }
            }
        }

        /// The survivor is always the record with the greatest timestamp.
        #[test]
        fn winner_has_greatest_timestamp(r1 in arb_record(), r2 in arb_record()) {
            let mut map = fresh_map();
            map.merge("k", r1.clone());
            map.merge("k", r2.clone());
            let expected = if r1.timestamp >= r2.timestamp { r1 } else { r2 };
            prop_assert_eq!(map.record("k"), Some(&expected));
        }
    }
}
