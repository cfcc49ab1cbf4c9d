//! Named-map registry with change emission.
//!
//! Each named map is one CRDT of a declared kind. Writes to one map are
//! serialized by its slot mutex (one logical writer lane per map); writes to
//! different maps run in parallel. Every mutation that changes a map's
//! canonical projection emits an event to the map's subscribers through
//! bounded per-subscriber channels, in apply order; dropping a receiver
//! unsubscribes it.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use tidemark_core::hlc::{ClockSource, SystemClock};
use tidemark_core::lww_map::MergeOutcome;
use tidemark_core::record::{LwwRecord, OrRecord, PnState, Record};
use tidemark_core::{HybridClock, LwwMap, OrMap, PnCounterMap, Timestamp, Value};

use crate::error::EngineError;

/// CRDT kind of a named map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MapKind {
    Lww,
    OrMap,
    PnCounter,
}

/// How a mutation changed a key's canonical projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A single-key change in a map's projection.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub map_name: String,
    pub kind: ChangeKind,
    pub key: String,
    /// Projection after the change; absent on delete.
    pub new_value: Option<Value>,
    /// Projection before the change; absent on insert.
    pub old_value: Option<Value>,
}

/// Event stream element for one map.
#[derive(Debug, Clone, PartialEq)]
pub enum MapEvent {
    /// Bulk hydration from storage. Per-entry events are suppressed.
    Init { entries: Vec<(String, Value)> },
    /// One projection change.
    Change(ChangeEvent),
}

enum MapState {
    Lww(LwwMap),
    Or(OrMap, ahash::AHashMap<String, Timestamp>),
    Pn(PnCounterMap),
}

struct MapSlot {
    kind: MapKind,
    state: Mutex<MapState>,
    subscribers: Mutex<Vec<mpsc::Sender<MapEvent>>>,
}

/// Fans an event out to a subscriber list. Closed receivers are pruned; a
/// full subscriber loses this event rather than stalling the writer lane.
fn fan_out(subscribers: &Mutex<Vec<mpsc::Sender<MapEvent>>>, event: &MapEvent) {
    let mut subscribers = subscribers.lock();
    subscribers.retain(|tx| match tx.try_send(event.clone()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            tracing::warn!("map subscriber lagging, change event dropped");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    });
}

/// Factory producing a wall clock per map, injectable for tests.
pub type ClockFactory = Arc<dyn Fn() -> Box<dyn ClockSource> + Send + Sync>;

/// The named-map registry.
pub struct MapStore {
    node_id: String,
    clock_factory: ClockFactory,
    maps: DashMap<String, Arc<MapSlot>>,
    /// Subscribers receiving events from every map (index maintenance,
    /// live-subscription diffing).
    global_subscribers: Mutex<Vec<mpsc::Sender<MapEvent>>>,
}

impl MapStore {
    /// Creates a store stamping with the system clock.
    #[must_use]
    pub fn new(node_id: impl Into<String>) -> Self {
        Self::with_clock_factory(node_id, Arc::new(|| Box::new(SystemClock)))
    }

    /// Creates a store with an injected clock source factory.
    #[must_use]
    pub fn with_clock_factory(node_id: impl Into<String>, clock_factory: ClockFactory) -> Self {
        Self {
            node_id: node_id.into(),
            clock_factory,
            maps: DashMap::new(),
            global_subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Id of the owning node; mutations are stamped with it.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Declares a map, creating it on first use.
    ///
    /// # Errors
    ///
    /// [`EngineError::Schema`] when the map already exists with a different
    /// kind.
    pub fn ensure_map(&self, name: &str, kind: MapKind) -> Result<(), EngineError> {
        let slot = self.slot(name, kind);
        if slot.kind == kind {
            Ok(())
        } else {
            Err(EngineError::Schema(format!(
                "map `{name}` is {:?}, not {kind:?}",
                slot.kind
            )))
        }
    }

    /// The kind of an existing map.
    #[must_use]
    pub fn kind(&self, name: &str) -> Option<MapKind> {
        self.maps.get(name).map(|slot| slot.kind)
    }

    /// Names of all declared maps.
    #[must_use]
    pub fn map_names(&self) -> Vec<String> {
        self.maps.iter().map(|e| e.key().clone()).collect()
    }

    /// Subscribes to a map's change stream with a bounded buffer.
    pub fn subscribe(&self, name: &str, capacity: usize) -> mpsc::Receiver<MapEvent> {
        let slot = self.slot(name, MapKind::Lww);
        let (tx, rx) = mpsc::channel(capacity.max(1));
        slot.subscribers.lock().push(tx);
        rx
    }

    /// Subscribes to the change streams of every map, current and future.
    pub fn subscribe_all(&self, capacity: usize) -> mpsc::Receiver<MapEvent> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.global_subscribers.lock().push(tx);
        rx
    }

    fn emit(&self, slot: &MapSlot, event: &MapEvent) {
        fan_out(&slot.subscribers, event);
        fan_out(&self.global_subscribers, event);
    }

    // --- LWW operations ---

    /// LWW set under a fresh local stamp. Emits insert or update.
    ///
    /// # Errors
    ///
    /// [`EngineError::Schema`] on kind mismatch.
    pub fn lww_set(
        &self,
        name: &str,
        key: &str,
        value: Value,
        ttl_ms: Option<u64>,
    ) -> Result<LwwRecord<Value>, EngineError> {
        let slot = self.slot(name, MapKind::Lww);
        let mut state = slot.state.lock();
        let map = expect_lww(&mut state, name, slot.kind)?;
        let old_value = map.get(key).cloned();
        let record = map.set(key, value.clone(), ttl_ms);
        let event = MapEvent::Change(ChangeEvent {
            map_name: name.to_string(),
            kind: if old_value.is_some() {
                ChangeKind::Update
            } else {
                ChangeKind::Insert
            },
            key: key.to_string(),
            new_value: Some(value),
            old_value,
        });
        self.emit(&slot, &event);
        Ok(record)
    }

    /// LWW tombstone under a fresh local stamp. Emits delete when the key
    /// was live.
    ///
    /// # Errors
    ///
    /// [`EngineError::Schema`] on kind mismatch.
    pub fn lww_delete(&self, name: &str, key: &str) -> Result<LwwRecord<Value>, EngineError> {
        let slot = self.slot(name, MapKind::Lww);
        let mut state = slot.state.lock();
        let map = expect_lww(&mut state, name, slot.kind)?;
        let old_value = map.get(key).cloned();
        let tombstone = map.remove(key);
        if let Some(old) = old_value {
            self.emit(&slot, &MapEvent::Change(ChangeEvent {
                map_name: name.to_string(),
                kind: ChangeKind::Delete,
                key: key.to_string(),
                new_value: None,
                old_value: Some(old),
            }));
        }
        Ok(tombstone)
    }

    /// Merges a remote LWW record (the sync path; never stamps, never
    /// journals). Emits the projection change, if any.
    ///
    /// # Errors
    ///
    /// [`EngineError::Schema`] on kind mismatch.
    pub fn lww_merge(
        &self,
        name: &str,
        key: &str,
        incoming: LwwRecord<Value>,
    ) -> Result<MergeOutcome, EngineError> {
        let slot = self.slot(name, MapKind::Lww);
        let mut state = slot.state.lock();
        let map = expect_lww(&mut state, name, slot.kind)?;
        let new_value = incoming.value.clone();
        let outcome = map.merge(key, incoming);
        let event = match &outcome {
            MergeOutcome::Inserted => Some(ChangeEvent {
                map_name: name.to_string(),
                kind: ChangeKind::Insert,
                key: key.to_string(),
                new_value,
                old_value: None,
            }),
            MergeOutcome::Updated { old } => Some(ChangeEvent {
                map_name: name.to_string(),
                kind: ChangeKind::Update,
                key: key.to_string(),
                new_value,
                old_value: Some(old.clone()),
            }),
            MergeOutcome::Deleted { old } => Some(ChangeEvent {
                map_name: name.to_string(),
                kind: ChangeKind::Delete,
                key: key.to_string(),
                new_value: None,
                old_value: Some(old.clone()),
            }),
            MergeOutcome::Unchanged | MergeOutcome::Shadowed => None,
        };
        if let Some(event) = event {
            self.emit(&slot, &MapEvent::Change(event));
        }
        Ok(outcome)
    }

    // --- OR operations ---

    /// Observed-remove add under a fresh tag. Emits insert or update.
    ///
    /// # Errors
    ///
    /// [`EngineError::Schema`] on kind mismatch.
    pub fn or_add(
        &self,
        name: &str,
        key: &str,
        value: Value,
        ttl_ms: Option<u64>,
    ) -> Result<OrRecord<Value>, EngineError> {
        let slot = self.slot(name, MapKind::OrMap);
        let mut state = slot.state.lock();
        let (map, touched) = expect_or(&mut state, name, slot.kind)?;
        let was_present = map.contains(key);
        let old_value = projection_or(map, key, was_present);
        let record = map.add(key, value, ttl_ms);
        touched.insert(key.to_string(), record.timestamp.clone());
        self.emit(&slot, &MapEvent::Change(ChangeEvent {
            map_name: name.to_string(),
            kind: if was_present {
                ChangeKind::Update
            } else {
                ChangeKind::Insert
            },
            key: key.to_string(),
            new_value: Some(or_projection(map, key)),
            old_value,
        }));
        Ok(record)
    }

    /// Removes exactly the observed tags from a key. Emits update or delete
    /// when live observations disappeared.
    ///
    /// # Errors
    ///
    /// [`EngineError::Schema`] on kind mismatch.
    pub fn or_remove(
        &self,
        name: &str,
        key: &str,
        tags: &[String],
        at: Timestamp,
    ) -> Result<usize, EngineError> {
        let slot = self.slot(name, MapKind::OrMap);
        let mut state = slot.state.lock();
        let (map, touched) = expect_or(&mut state, name, slot.kind)?;
        let old_value = projection_or(map, key, map.contains(key));
        let removed = map.remove(key, tags);
        touched.insert(key.to_string(), at);
        if removed > 0 {
            let still_present = map.contains(key);
            self.emit(&slot, &MapEvent::Change(ChangeEvent {
                map_name: name.to_string(),
                kind: if still_present {
                    ChangeKind::Update
                } else {
                    ChangeKind::Delete
                },
                key: key.to_string(),
                new_value: still_present.then(|| or_projection(map, key)),
                old_value,
            }));
        }
        Ok(removed)
    }

    /// Merges remote OR state for a key. Emits the projection change, if
    /// any.
    ///
    /// # Errors
    ///
    /// [`EngineError::Schema`] on kind mismatch.
    pub fn or_merge(
        &self,
        name: &str,
        key: &str,
        records: Vec<OrRecord<Value>>,
        tombstones: &[String],
    ) -> Result<tidemark_core::OrMergeOutcome, EngineError> {
        let slot = self.slot(name, MapKind::OrMap);
        let mut state = slot.state.lock();
        let (map, touched) = expect_or(&mut state, name, slot.kind)?;
        let was_present = map.contains(key);
        let old_value = projection_or(map, key, was_present);
        let max_ts = records.iter().map(|r| r.timestamp.clone()).max();
        let outcome = map.merge(key, records, tombstones);
        if outcome.applied() {
            if let Some(ts) = max_ts {
                let entry = touched.entry(key.to_string()).or_insert_with(|| ts.clone());
                if ts > *entry {
                    *entry = ts;
                }
            }
            let is_present = map.contains(key);
            let kind = match (was_present, is_present) {
                (false, true) => Some(ChangeKind::Insert),
                (true, true) => Some(ChangeKind::Update),
                (true, false) => Some(ChangeKind::Delete),
                (false, false) => None,
            };
            if let Some(kind) = kind {
                self.emit(&slot, &MapEvent::Change(ChangeEvent {
                    map_name: name.to_string(),
                    kind,
                    key: key.to_string(),
                    new_value: is_present.then(|| or_projection(map, key)),
                    old_value,
                }));
            }
        }
        Ok(outcome)
    }

    // --- PN counter operations ---

    /// Counter increment. Emits an update with the new projected value.
    ///
    /// # Errors
    ///
    /// [`EngineError::Schema`] on kind mismatch.
    pub fn pn_increment(&self, name: &str, key: &str, amount: f64) -> Result<f64, EngineError> {
        self.pn_apply(name, key, |map| map.increment(key, amount))
    }

    /// Counter decrement.
    ///
    /// # Errors
    ///
    /// [`EngineError::Schema`] on kind mismatch.
    pub fn pn_decrement(&self, name: &str, key: &str, amount: f64) -> Result<f64, EngineError> {
        self.pn_apply(name, key, |map| map.decrement(key, amount))
    }

    /// Counter decrement clamped at zero.
    ///
    /// # Errors
    ///
    /// [`EngineError::Schema`] on kind mismatch.
    pub fn pn_decrement_floor(
        &self,
        name: &str,
        key: &str,
        amount: f64,
    ) -> Result<f64, EngineError> {
        self.pn_apply(name, key, |map| map.decrement_floor(key, amount))
    }

    /// Merges remote counter state.
    ///
    /// # Errors
    ///
    /// [`EngineError::Schema`] on kind mismatch.
    pub fn pn_merge(&self, name: &str, key: &str, remote: &PnState) -> Result<bool, EngineError> {
        let slot = self.slot(name, MapKind::PnCounter);
        let mut state = slot.state.lock();
        let map = expect_pn(&mut state, name, slot.kind)?;
        let old = map.value(key);
        let changed = map.merge(key, remote);
        if changed {
            let new = map.value(key);
            self.emit(&slot, &MapEvent::Change(ChangeEvent {
                map_name: name.to_string(),
                kind: ChangeKind::Update,
                key: key.to_string(),
                new_value: Some(Value::Float(new)),
                old_value: Some(Value::Float(old)),
            }));
        }
        Ok(changed)
    }

    fn pn_apply(
        &self,
        name: &str,
        key: &str,
        f: impl FnOnce(&mut PnCounterMap) -> f64,
    ) -> Result<f64, EngineError> {
        let slot = self.slot(name, MapKind::PnCounter);
        let mut state = slot.state.lock();
        let map = expect_pn(&mut state, name, slot.kind)?;
        let old = map.value(key);
        let new = f(map);
        if (new - old).abs() > f64::EPSILON {
            self.emit(&slot, &MapEvent::Change(ChangeEvent {
                map_name: name.to_string(),
                kind: ChangeKind::Update,
                key: key.to_string(),
                new_value: Some(Value::Float(new)),
                old_value: Some(Value::Float(old)),
            }));
        }
        Ok(new)
    }

    // --- reads ---

    /// A key's canonical projection: the LWW value, the OR observation
    /// array, or the counter value. Absent keys (and tombstones) read as
    /// `None` — never an error.
    #[must_use]
    pub fn get(&self, name: &str, key: &str) -> Option<Value> {
        let slot = self.maps.get(name)?;
        let state = slot.state.lock();
        match &*state {
            MapState::Lww(map) => map.get(key).cloned(),
            MapState::Or(map, _) => map.contains(key).then(|| or_projection(map, key)),
            MapState::Pn(map) => {
                let value = map.value(key);
                map.state(key).map(|_| Value::Float(value))
            }
        }
    }

    /// The raw PN counter state for a key, for journaling and replication.
    #[must_use]
    pub fn pn_state(&self, name: &str, key: &str) -> Option<PnState> {
        let slot = self.maps.get(name)?;
        let state = slot.state.lock();
        match &*state {
            MapState::Pn(map) => map.state(key).cloned(),
            _ => None,
        }
    }

    /// The stored LWW record timestamp for a key, tombstones included.
    #[must_use]
    pub fn lww_timestamp(&self, name: &str, key: &str) -> Option<Timestamp> {
        let slot = self.maps.get(name)?;
        let state = slot.state.lock();
        match &*state {
            MapState::Lww(map) => map.record(key).map(|r| r.timestamp.clone()),
            _ => None,
        }
    }

    /// Prunes LWW tombstones older than the threshold from one map.
    /// Returns the pruned keys.
    ///
    /// # Errors
    ///
    /// [`EngineError::Schema`] on kind mismatch.
    pub fn lww_prune(
        &self,
        name: &str,
        older_than: &Timestamp,
    ) -> Result<Vec<String>, EngineError> {
        let slot = self.slot(name, MapKind::Lww);
        let mut state = slot.state.lock();
        let map = expect_lww(&mut state, name, slot.kind)?;
        Ok(map.prune(older_than))
    }

    /// Prunes observed-remove tombstones older than the threshold from one
    /// map. Returns the number of tombstones dropped.
    ///
    /// # Errors
    ///
    /// [`EngineError::Schema`] on kind mismatch.
    pub fn or_prune(&self, name: &str, older_than: &Timestamp) -> Result<usize, EngineError> {
        let slot = self.slot(name, MapKind::OrMap);
        let mut state = slot.state.lock();
        let (map, touched) = expect_or(&mut state, name, slot.kind)?;
        let pruned = map.prune(older_than);
        // Delta markers for fully forgotten keys go with them; a client
        // whose watermark predates the retention window resyncs in full.
        touched.retain(|key, _| map.entry(key).is_some());
        Ok(pruned)
    }

    /// Prunes tombstones older than the threshold across every map,
    /// dispatching by kind. Returns the total number of entries dropped.
    /// The periodic maintenance sweep calls this.
    pub fn prune_tombstones(&self, older_than: &Timestamp) -> usize {
        let mut total = 0;
        for entry in &self.maps {
            let mut state = entry.value().state.lock();
            match &mut *state {
                MapState::Lww(map) => total += map.prune(older_than).len(),
                MapState::Or(map, touched) => {
                    total += map.prune(older_than);
                    touched.retain(|key, _| map.entry(key).is_some());
                }
                // Counter vectors carry no tombstones.
                MapState::Pn(_) => {}
            }
        }
        if total > 0 {
            metrics::counter!("tombstones_pruned").increment(total as u64);
        }
        total
    }

    /// Materialized projection of a whole map, for query evaluation.
    #[must_use]
    pub fn snapshot(&self, name: &str) -> Vec<(String, Value)> {
        let Some(slot) = self.maps.get(name) else {
            return Vec::new();
        };
        let state = slot.state.lock();
        match &*state {
            MapState::Lww(map) => map
                .live_entries()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            MapState::Or(map, _) => map
                .entries()
                .filter(|(k, _)| map.contains(k))
                .map(|(k, _)| (k.clone(), or_projection(map, k)))
                .collect(),
            MapState::Pn(map) => map
                .entries()
                .map(|(k, state)| (k.clone(), Value::Float(state.value())))
                .collect(),
        }
    }

    /// Records changed since a sync watermark, ascending by timestamp, plus
    /// the new watermark (the maximum record timestamp in the map).
    #[must_use]
    pub fn records_since(&self, name: &str, since: &Timestamp) -> Vec<(String, Record)> {
        let Some(slot) = self.maps.get(name) else {
            return Vec::new();
        };
        let state = slot.state.lock();
        match &*state {
            MapState::Lww(map) => map
                .records_since(since)
                .into_iter()
                .map(|(k, r)| (k, Record::Lww(r)))
                .collect(),
            MapState::Or(map, touched) => {
                let mut changed: Vec<(Timestamp, String)> = touched
                    .iter()
                    .filter(|(_, ts)| *ts > since)
                    .map(|(k, ts)| (ts.clone(), k.clone()))
                    .collect();
                changed.sort();
                changed
                    .into_iter()
                    .filter_map(|(_, key)| {
                        map.entry(&key).map(|entry| {
                            (
                                key.clone(),
                                Record::Or {
                                    records: entry.records().cloned().collect(),
                                    tombstones: entry.tombstones().cloned().collect(),
                                },
                            )
                        })
                    })
                    .collect()
            }
            // Counters have no per-op timestamps; ship full state.
            MapState::Pn(map) => map
                .entries()
                .map(|(k, state)| (k.clone(), Record::Counter(state.clone())))
                .collect(),
        }
    }

    /// Hydrates a map from storage entries. Emits one bulk init event and
    /// suppresses per-entry events.
    ///
    /// # Errors
    ///
    /// [`EngineError::Schema`] on kind mismatch.
    pub fn hydrate(
        &self,
        name: &str,
        kind: MapKind,
        entries: Vec<(String, Record)>,
    ) -> Result<(), EngineError> {
        self.ensure_map(name, kind)?;
        let slot = self.slot(name, kind);
        let mut state = slot.state.lock();
        for (key, record) in entries {
            match (&mut *state, record) {
                (MapState::Lww(map), Record::Lww(r)) => {
                    map.merge(key, r);
                }
                (MapState::Or(map, _), Record::Or { records, tombstones }) => {
                    map.merge(key, records, &tombstones);
                }
                (MapState::Pn(map), Record::Counter(s)) => {
                    map.merge(key, &s);
                }
                _ => {
                    tracing::warn!(map = name, "dropping malformed record during hydration");
                }
            }
        }
        let entries = match &*state {
            MapState::Lww(map) => map
                .live_entries()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            MapState::Or(map, _) => map
                .entries()
                .filter(|(k, _)| map.contains(k))
                .map(|(k, _)| (k.clone(), or_projection(map, k)))
                .collect(),
            MapState::Pn(map) => map
                .entries()
                .map(|(k, s)| (k.clone(), Value::Float(s.value())))
                .collect(),
        };
        self.emit(&slot, &MapEvent::Init { entries });
        Ok(())
    }

    fn slot(&self, name: &str, default_kind: MapKind) -> Arc<MapSlot> {
        self.maps
            .entry(name.to_string())
            .or_insert_with(|| {
                let clock = HybridClock::new(self.node_id.clone(), (self.clock_factory)());
                let state = match default_kind {
                    MapKind::Lww => MapState::Lww(LwwMap::new(clock)),
                    MapKind::OrMap => MapState::Or(OrMap::new(clock), ahash::AHashMap::new()),
                    MapKind::PnCounter => MapState::Pn(PnCounterMap::new(self.node_id.clone())),
                };
                Arc::new(MapSlot {
                    kind: default_kind,
                    state: Mutex::new(state),
                    subscribers: Mutex::new(Vec::new()),
                })
            })
            .clone()
    }
}

fn or_projection(map: &OrMap, key: &str) -> Value {
    Value::Array(map.values(key).into_iter().cloned().collect())
}

fn projection_or(map: &OrMap, key: &str, present: bool) -> Option<Value> {
    present.then(|| or_projection(map, key))
}

fn expect_lww<'a>(
    state: &'a mut MapState,
    name: &str,
    kind: MapKind,
) -> Result<&'a mut LwwMap, EngineError> {
    match state {
        MapState::Lww(map) => Ok(map),
        _ => Err(kind_mismatch(name, kind, MapKind::Lww)),
    }
}

fn expect_or<'a>(
    state: &'a mut MapState,
    name: &str,
    kind: MapKind,
) -> Result<(&'a mut OrMap, &'a mut ahash::AHashMap<String, Timestamp>), EngineError> {
    match state {
        MapState::Or(map, touched) => Ok((map, touched)),
        _ => Err(kind_mismatch(name, kind, MapKind::OrMap)),
    }
}

fn expect_pn<'a>(
    state: &'a mut MapState,
    name: &str,
    kind: MapKind,
) -> Result<&'a mut PnCounterMap, EngineError> {
    match state {
        MapState::Pn(map) => Ok(map),
        _ => Err(kind_mismatch(name, kind, MapKind::PnCounter)),
    }
}

fn kind_mismatch(name: &str, actual: MapKind, wanted: MapKind) -> EngineError {
    EngineError::Schema(format!("map `{name}` is {actual:?}, not {wanted:?}"))
}

#[cfg(test)]
mod tests {
    use tidemark_core::record::LwwRecord;

    use super::*;

    fn ts(millis: u64, node: &str) -> Timestamp {
        Timestamp {
            millis,
            counter: 0,
            node_id: node.to_string(),
        }
    }

    fn drain(rx: &mut mpsc::Receiver<MapEvent>) -> Vec<MapEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn lww_set_emits_insert_then_update() {
        let store = MapStore::new("n1");
        let mut rx = store.subscribe("users", 16);
        store.lww_set("users", "u1", Value::from("a"), None).unwrap();
        store.lww_set("users", "u1", Value::from("b"), None).unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        match (&events[0], &events[1]) {
            (MapEvent::Change(first), MapEvent::Change(second)) => {
                assert_eq!(first.kind, ChangeKind::Insert);
                assert_eq!(second.kind, ChangeKind::Update);
                assert_eq!(second.old_value, Some(Value::from("a")));
                assert_eq!(second.new_value, Some(Value::from("b")));
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn lww_delete_emits_delete_only_when_live() {
        let store = MapStore::new("n1");
        let mut rx = store.subscribe("users", 16);
        store.lww_delete("users", "ghost").unwrap();
        store.lww_set("users", "u1", Value::Int(1), None).unwrap();
        store.lww_delete("users", "u1").unwrap();

        let events = drain(&mut rx);
        let kinds: Vec<ChangeKind> = events
            .iter()
            .filter_map(|e| match e {
                MapEvent::Change(c) => Some(c.kind),
                MapEvent::Init { .. } => None,
            })
            .collect();
        assert_eq!(
            kinds,
            vec![ChangeKind::Insert, ChangeKind::Delete]
        );
    }

    #[test]
    fn merge_losing_record_emits_nothing() {
        let store = MapStore::new("n1");
        store
            .lww_merge(
                "users",
                "u1",
                LwwRecord {
                    value: Some(Value::from("winner")),
                    timestamp: ts(2_000, "b"),
                    ttl_ms: None,
                },
            )
            .unwrap();
        let mut rx = store.subscribe("users", 16);
        let outcome = store
            .lww_merge(
                "users",
                "u1",
                LwwRecord {
                    value: Some(Value::from("loser")),
                    timestamp: ts(1_000, "a"),
                    ttl_ms: None,
                },
            )
            .unwrap();
        assert_eq!(outcome, MergeOutcome::Unchanged);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(store.get("users", "u1"), Some(Value::from("winner")));
    }

    #[test]
    fn kind_mismatch_is_schema_error() {
        let store = MapStore::new("n1");
        store.lww_set("users", "u1", Value::Int(1), None).unwrap();
        let err = store.or_add("users", "u1", Value::Int(2), None);
        assert!(matches!(err, Err(EngineError::Schema(_))));
        assert_eq!(store.kind("users"), Some(MapKind::Lww));
    }

    #[test]
    fn or_add_remove_projection_and_events() {
        let store = MapStore::new("n1");
        let mut rx = store.subscribe("tags", 16);
        // subscribe() defaulted the slot to Lww; declare properly first in
        // real use. Recreate under the right kind.
        let store = MapStore::new("n1");
        store.ensure_map("tags", MapKind::OrMap).unwrap();
        let mut rx2 = store.subscribe("tags", 16);

        let record = store.or_add("tags", "post/1", Value::from("rust"), None).unwrap();
        store.or_add("tags", "post/1", Value::from("db"), None).unwrap();
        store
            .or_remove("tags", "post/1", &[record.tag.clone()], ts(99, "n1"))
            .unwrap();

        assert_eq!(
            store.get("tags", "post/1"),
            Some(Value::Array(vec![Value::from("db")]))
        );
        let kinds: Vec<ChangeKind> = drain(&mut rx2)
            .iter()
            .filter_map(|e| match e {
                MapEvent::Change(c) => Some(c.kind),
                MapEvent::Init { .. } => None,
            })
            .collect();
        assert_eq!(
            kinds,
            vec![ChangeKind::Insert, ChangeKind::Update, ChangeKind::Update]
        );
        let _ = drain(&mut rx);
    }

    #[test]
    fn or_remove_last_tag_emits_delete() {
        let store = MapStore::new("n1");
        store.ensure_map("tags", MapKind::OrMap).unwrap();
        let record = store.or_add("tags", "k", Value::Int(1), None).unwrap();
        let mut rx = store.subscribe("tags", 16);
        store
            .or_remove("tags", "k", &[record.tag], ts(5, "n1"))
            .unwrap();
        let events = drain(&mut rx);
        assert!(matches!(
            events.as_slice(),
            [MapEvent::Change(ChangeEvent {
                kind: ChangeKind::Delete,
                ..
            })]
        ));
        assert_eq!(store.get("tags", "k"), None);
    }

    #[test]
    fn pn_counter_projection() {
        let store = MapStore::new("n1");
        store.ensure_map("stats", MapKind::PnCounter).unwrap();
        store.pn_increment("stats", "hits", 5.0).unwrap();
        store.pn_decrement("stats", "hits", 2.0).unwrap();
        assert_eq!(store.get("stats", "hits"), Some(Value::Float(3.0)));
        assert_eq!(
            store.pn_decrement_floor("stats", "hits", 100.0).unwrap(),
            0.0
        );
    }

    #[test]
    fn hydrate_emits_single_init() {
        let store = MapStore::new("n1");
        store.ensure_map("users", MapKind::Lww).unwrap();
        let mut rx = store.subscribe("users", 16);
        store
            .hydrate(
                "users",
                MapKind::Lww,
                vec![
                    (
                        "u1".to_string(),
                        Record::Lww(LwwRecord {
                            value: Some(Value::Int(1)),
                            timestamp: ts(10, "a"),
                            ttl_ms: None,
                        }),
                    ),
                    (
                        "u2".to_string(),
                        Record::Lww(LwwRecord {
                            value: Some(Value::Int(2)),
                            timestamp: ts(11, "a"),
                            ttl_ms: None,
                        }),
                    ),
                ],
            )
            .unwrap();
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            MapEvent::Init { entries } => assert_eq!(entries.len(), 2),
            other => panic!("expected init, got {other:?}"),
        }
    }

    #[test]
    fn records_since_covers_or_removals() {
        let store = MapStore::new("n1");
        store.ensure_map("tags", MapKind::OrMap).unwrap();
        let record = store.or_add("tags", "k", Value::Int(1), None).unwrap();
        let watermark = record.timestamp.clone();
        store
            .or_remove("tags", "k", &[record.tag], ts(u64::MAX - 1, "n1"))
            .unwrap();

        let delta = store.records_since("tags", &watermark);
        assert_eq!(delta.len(), 1);
        match &delta[0].1 {
            Record::Or { records, tombstones } => {
                assert!(records.is_empty());
                assert_eq!(tombstones.len(), 1);
            }
            other => panic!("expected OR record, got {other:?}"),
        }
    }

    #[test]
    fn prune_sweep_covers_lww_and_or_maps() {
        let store = MapStore::new("n1");
        // LWW: one live record, one tombstone well in the past.
        store.lww_set("users", "alive", Value::Int(1), None).unwrap();
        store
            .lww_merge(
                "users",
                "dead",
                LwwRecord {
                    value: None,
                    timestamp: ts(10, "a"),
                    ttl_ms: None,
                },
            )
            .unwrap();
        // OR: an observation added and removed at a low stamp.
        store.ensure_map("tags", MapKind::OrMap).unwrap();
        let record = tidemark_core::record::OrRecord {
            value: Value::Int(1),
            tag: "20:0:b".to_string(),
            timestamp: ts(20, "b"),
            ttl_ms: None,
        };
        store.or_merge("tags", "k", vec![record], &[]).unwrap();
        store
            .or_remove("tags", "k", &["20:0:b".to_string()], ts(21, "n1"))
            .unwrap();

        let threshold = Timestamp {
            millis: 1_000,
            counter: 0,
            node_id: String::new(),
        };
        let pruned = store.prune_tombstones(&threshold);
        assert_eq!(pruned, 2);
        assert!(store.lww_timestamp("users", "alive").is_some());
        assert!(store.lww_timestamp("users", "dead").is_none());
        // The forgotten OR key no longer appears in deltas.
        assert!(store.records_since("tags", &Timestamp::zero()).is_empty());
    }

    #[test]
    fn per_map_prune_respects_kinds() {
        let store = MapStore::new("n1");
        store.lww_set("users", "k", Value::Int(1), None).unwrap();
        store.lww_delete("users", "k").unwrap();
        let future = Timestamp {
            millis: u64::MAX,
            counter: 0,
            node_id: String::new(),
        };
        assert_eq!(store.lww_prune("users", &future).unwrap(), vec!["k"]);
        // Wrong-kind prune is a schema error, same as the mutators.
        assert!(matches!(
            store.or_prune("users", &future),
            Err(EngineError::Schema(_))
        ));
    }

    #[test]
    fn closed_subscriber_is_pruned() {
        let store = MapStore::new("n1");
        let rx = store.subscribe("users", 4);
        drop(rx);
        // Next mutation prunes the dead sender without error.
        store.lww_set("users", "u1", Value::Int(1), None).unwrap();
        let mut rx2 = store.subscribe("users", 4);
        store.lww_set("users", "u2", Value::Int(2), None).unwrap();
        assert_eq!(drain(&mut rx2).len(), 1);
    }
}
