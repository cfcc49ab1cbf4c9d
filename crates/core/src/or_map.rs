//! Observed-remove map.
//!
//! A key maps to a set of tagged observations. Adding inserts a fresh,
//! globally unique tag; removing deletes exactly the tags the remover
//! observed. A concurrent add with a tag the remover never saw survives,
//! which is the observed-remove guarantee. Removed tags are kept as
//! tombstones so merges stay commutative and idempotent.

use std::collections::{HashMap, HashSet};

use crate::hlc::{HybridClock, Timestamp};
use crate::record::OrRecord;
use crate::value::Value;

/// Stored state for one key: live observations by tag, plus removed tags.
#[derive(Debug, Default, Clone)]
pub struct OrEntry {
    records: HashMap<String, OrRecord<Value>>,
    tombstones: HashSet<String>,
}

impl OrEntry {
    /// Live observation records, unordered.
    pub fn records(&self) -> impl Iterator<Item = &OrRecord<Value>> {
        self.records.values()
    }

    /// Tags removed from this entry.
    pub fn tombstones(&self) -> impl Iterator<Item = &String> {
        self.tombstones.iter()
    }
}

/// Effect of an OR merge on one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OrMergeOutcome {
    /// Observations newly added by the merge.
    pub tags_added: usize,
    /// Live observations removed by incoming tombstones.
    pub tags_removed: usize,
}

impl OrMergeOutcome {
    /// Whether the merge changed anything observable.
    #[must_use]
    pub fn applied(&self) -> bool {
        self.tags_added > 0 || self.tags_removed > 0
    }
}

/// An observed-remove map over [`Value`] payloads.
pub struct OrMap {
    entries: HashMap<String, OrEntry>,
    clock: HybridClock,
}

impl OrMap {
    /// Creates an empty map stamping with the given clock.
    #[must_use]
    pub fn new(clock: HybridClock) -> Self {
        Self {
            entries: HashMap::new(),
            clock,
        }
    }

    /// Adds an observation under a fresh unique tag and returns its record.
    pub fn add(&mut self, key: impl Into<String>, value: Value, ttl_ms: Option<u64>) -> OrRecord<Value> {
        let timestamp = self.clock.now();
        let record = OrRecord {
            value,
            tag: timestamp.to_string(),
            timestamp,
            ttl_ms,
        };
        self.entries
            .entry(key.into())
            .or_default()
            .records
            .insert(record.tag.clone(), record.clone());
        record
    }

    /// Removes exactly the given observed tags from a key.
    ///
    /// Unknown tags still become tombstones: the removal may race an add
    /// that is in flight, and the tombstone must win when it arrives.
    /// Returns the number of live observations removed locally.
    pub fn remove(&mut self, key: &str, tags: &[String]) -> usize {
        let entry = self.entries.entry(key.to_string()).or_default();
        let mut removed = 0;
        for tag in tags {
            if entry.records.remove(tag).is_some() {
                removed += 1;
            }
            entry.tombstones.insert(tag.clone());
        }
        removed
    }

    /// Tags currently observed for a key. This is what a remover must name
    /// to delete the key as it sees it.
    #[must_use]
    pub fn observed_tags(&self, key: &str) -> Vec<String> {
        self.entries
            .get(key)
            .map(|e| e.records.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Live values for a key, ordered by observation timestamp.
    ///
    /// A key is present iff at least one unremoved, unexpired tag survives.
    #[must_use]
    pub fn values(&self, key: &str) -> Vec<&Value> {
        let Some(entry) = self.entries.get(key) else {
            return Vec::new();
        };
        let mut records: Vec<&OrRecord<Value>> = entry
            .records
            .values()
            .filter(|r| !self.expired(r))
            .collect();
        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        records.into_iter().map(|r| &r.value).collect()
    }

    /// Whether the key has at least one live observation.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .is_some_and(|e| e.records.values().any(|r| !self.expired(r)))
    }

    /// Merges remote state for a key: unions unremoved observations and
    /// applies remote tombstones to local observations.
    pub fn merge(
        &mut self,
        key: impl Into<String>,
        records: Vec<OrRecord<Value>>,
        tombstones: &[String],
    ) -> OrMergeOutcome {
        for record in &records {
            let _ = self.clock.observe(&record.timestamp);
        }

        let entry = self.entries.entry(key.into()).or_default();
        let mut outcome = OrMergeOutcome::default();

        for tag in tombstones {
            if entry.records.remove(tag).is_some() {
                outcome.tags_removed += 1;
            }
            entry.tombstones.insert(tag.clone());
        }
        for record in records {
            if entry.tombstones.contains(&record.tag) {
                continue;
            }
            if !entry.records.contains_key(&record.tag) {
                entry.records.insert(record.tag.clone(), record);
                outcome.tags_added += 1;
            }
        }
        outcome
    }

    /// Drops remove-tag tombstones whose embedded stamp is strictly older
    /// than the threshold, and forgets keys left with no records and no
    /// tombstones. Returns the number of tombstones dropped.
    ///
    /// A tag encodes the timestamp of the add it names, so a tombstone
    /// older than the threshold can only be racing an add that is older
    /// still; the retention window must cover the longest expected
    /// propagation delay. Tags that do not parse as timestamps are kept.
    pub fn prune(&mut self, older_than: &Timestamp) -> usize {
        let mut pruned = 0;
        self.entries.retain(|_, entry| {
            entry.tombstones.retain(|tag| {
                let expired =
                    Timestamp::parse(tag).is_ok_and(|stamp| stamp < *older_than);
                if expired {
                    pruned += 1;
                }
                !expired
            });
            !entry.records.is_empty() || !entry.tombstones.is_empty()
        });
        pruned
    }

    /// Raw entry state for a key, for sync deltas.
    #[must_use]
    pub fn entry(&self, key: &str) -> Option<&OrEntry> {
        self.entries.get(key)
    }

    /// Iterates all keys with their entry state, live or fully removed.
    pub fn entries(&self) -> impl Iterator<Item = (&String, &OrEntry)> {
        self.entries.iter()
    }

    /// Number of keys with stored state, including fully removed ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no key has any stored state.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Mutable access to the stamping clock.
    pub fn clock_mut(&mut self) -> &mut HybridClock {
        &mut self.clock
    }

    fn expired(&self, record: &OrRecord<Value>) -> bool {
        record.ttl_ms.is_some_and(|ttl| {
            record.timestamp.millis + ttl < self.clock.source().wall_millis()
        })
    }
}
