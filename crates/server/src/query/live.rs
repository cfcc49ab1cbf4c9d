//! Live query/search subscriptions.
//!
//! The server tracks `(connection, subscription)` pairs. On every document
//! change the affected subscriptions recompute membership and score, diff
//! against their current result set, and stage `ENTER`/`UPDATE`/`LEAVE`
//! deltas. Bursts are coalesced per key inside a debounce window and flushed
//! as one ordered change list; deltas are strictly ordered per subscription.
//! Closing is idempotent, closing a connection closes all its
//! subscriptions, and late deltas for closed subscriptions are dropped.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use tidemark_core::messages::{DeltaKind, QuerySpec, SearchOptions, SubscriptionDelta};
use tidemark_core::{CompiledPredicate, Message, Value};

use crate::error::EngineError;
use crate::query::index::SearchCatalog;
use crate::store::maps::{ChangeEvent, ChangeKind};

/// Identifies one subscription within the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub connection_id: u64,
    pub subscription_id: String,
}

enum SubscriptionKind {
    Query {
        predicate: Option<CompiledPredicate>,
    },
    Search {
        query: String,
    },
}

struct Subscription {
    key: SubscriptionKey,
    map_name: String,
    kind: SubscriptionKind,
    /// Keys currently in the result set, with their last score.
    current: Mutex<ahash::AHashMap<String, Option<f64>>>,
    /// Deltas staged for the next flush, coalesced per key.
    staged: Mutex<Vec<SubscriptionDelta>>,
    sink: mpsc::Sender<Message>,
}

/// The subscription manager.
pub struct SubscriptionManager {
    catalog: Arc<SearchCatalog>,
    subscriptions: DashMap<SubscriptionKey, Arc<Subscription>>,
}

impl SubscriptionManager {
    #[must_use]
    pub fn new(catalog: Arc<SearchCatalog>) -> Self {
        Self {
            catalog,
            subscriptions: DashMap::new(),
        }
    }

    /// Opens a live query subscription; deltas flow into `sink`.
    ///
    /// # Errors
    ///
    /// [`EngineError::Schema`] when the predicate does not compile.
    pub fn open_query(
        &self,
        connection_id: u64,
        subscription_id: &str,
        map_name: &str,
        spec: &QuerySpec,
        initial: &[(String, Value)],
        sink: mpsc::Sender<Message>,
    ) -> Result<(), EngineError> {
        let predicate = spec
            .predicate
            .as_ref()
            .map(tidemark_core::Predicate::compile)
            .transpose()
            .map_err(|e| EngineError::Schema(e.to_string()))?;
        let subscription = Subscription {
            key: SubscriptionKey {
                connection_id,
                subscription_id: subscription_id.to_string(),
            },
            map_name: map_name.to_string(),
            kind: SubscriptionKind::Query { predicate },
            current: Mutex::new(
                initial
                    .iter()
                    .map(|(k, _)| (k.clone(), None))
                    .collect(),
            ),
            staged: Mutex::new(Vec::new()),
            sink,
        };
        self.subscriptions
            .insert(subscription.key.clone(), Arc::new(subscription));
        metrics::gauge!("live_subscriptions").set(self.subscriptions.len() as f64);
        Ok(())
    }

    /// Opens a live search subscription.
    pub fn open_search(
        &self,
        connection_id: u64,
        subscription_id: &str,
        map_name: &str,
        options: &SearchOptions,
        initial: &[(String, f64)],
        sink: mpsc::Sender<Message>,
    ) {
        let subscription = Subscription {
            key: SubscriptionKey {
                connection_id,
                subscription_id: subscription_id.to_string(),
            },
            map_name: map_name.to_string(),
            kind: SubscriptionKind::Search {
                query: options.query.clone(),
            },
            current: Mutex::new(
                initial
                    .iter()
                    .map(|(k, score)| (k.clone(), Some(*score)))
                    .collect(),
            ),
            staged: Mutex::new(Vec::new()),
            sink,
        };
        self.subscriptions
            .insert(subscription.key.clone(), Arc::new(subscription));
        metrics::gauge!("live_subscriptions").set(self.subscriptions.len() as f64);
    }

    /// Closes one subscription. Idempotent: closing twice is a no-op.
    pub fn close(&self, connection_id: u64, subscription_id: &str) {
        self.subscriptions.remove(&SubscriptionKey {
            connection_id,
            subscription_id: subscription_id.to_string(),
        });
        metrics::gauge!("live_subscriptions").set(self.subscriptions.len() as f64);
    }

    /// Closes every subscription of a connection.
    pub fn close_connection(&self, connection_id: u64) {
        self.subscriptions
            .retain(|key, _| key.connection_id != connection_id);
        metrics::gauge!("live_subscriptions").set(self.subscriptions.len() as f64);
    }

    /// Number of open subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Whether no subscription is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Reacts to one document change: every subscription on the map stages
    /// its delta, coalescing with anything already staged for the key.
    pub fn on_change(&self, event: &ChangeEvent) {
        for entry in &self.subscriptions {
            let subscription = entry.value();
            if subscription.map_name != event.map_name {
                continue;
            }
            self.stage_for(subscription, event);
        }
    }

    /// Flushes every subscription's staged deltas to its sink, in order.
    /// Call on the debounce tick (or directly in tests).
    pub fn flush(&self) {
        let subscriptions: Vec<Arc<Subscription>> = self
            .subscriptions
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        for subscription in subscriptions {
            let staged: Vec<SubscriptionDelta> =
                std::mem::take(&mut *subscription.staged.lock());
            for delta in staged {
                let message = match &subscription.kind {
                    SubscriptionKind::Query { .. } => Message::QueryUpdate(delta),
                    SubscriptionKind::Search { .. } => Message::SearchUpdate(delta),
                };
                if subscription.sink.try_send(message).is_err() {
                    // The connection is gone or hopelessly lagging; its
                    // close path will tear the subscription down.
                    tracing::debug!(
                        subscription = %subscription.key.subscription_id,
                        "dropping delta for unreachable subscriber"
                    );
                }
            }
        }
    }

    /// Starts the debounced flush worker.
    pub fn spawn_flusher(self: &Arc<Self>, throttle_ms: u64) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let window = std::time::Duration::from_millis(throttle_ms.max(1));
            loop {
                tokio::time::sleep(window).await;
                manager.flush();
            }
        })
    }

    fn stage_for(&self, subscription: &Subscription, event: &ChangeEvent) {
        let (matches, score) = match &subscription.kind {
            SubscriptionKind::Query { predicate } => {
                let matches = match (&event.kind, &event.new_value) {
                    (ChangeKind::Delete, _) | (_, None) => false,
                    (_, Some(value)) => predicate.as_ref().is_none_or(|p| p.matches(value)),
                };
                (matches, None)
            }
            SubscriptionKind::Search { query } => {
                if event.kind == ChangeKind::Delete || event.new_value.is_none() {
                    (false, None)
                } else {
                    let score =
                        self.catalog
                            .score(&subscription.map_name, query, &event.key);
                    (score > 0.0, Some(score))
                }
            }
        };

        let mut current = subscription.current.lock();
        let was_member = current.contains_key(&event.key);
        let delta = match (was_member, matches) {
            (false, true) => {
                current.insert(event.key.clone(), score);
                Some(DeltaKind::Enter)
            }
            (true, true) => {
                current.insert(event.key.clone(), score);
                Some(DeltaKind::Update)
            }
            (true, false) => {
                current.remove(&event.key);
                Some(DeltaKind::Leave)
            }
            (false, false) => None,
        };
        drop(current);

        let Some(kind) = delta else {
            return;
        };
        let delta = SubscriptionDelta {
            subscription_id: subscription.key.subscription_id.clone(),
            kind,
            key: event.key.clone(),
            value: match kind {
                DeltaKind::Leave => None,
                DeltaKind::Enter | DeltaKind::Update => event.new_value.clone(),
            },
            score,
        };
        stage_coalesced(&mut subscription.staged.lock(), delta);
    }
}

/// Merges a new delta into the staged list, collapsing per-key sequences so
/// a burst nets out to at most one delta per key:
/// `ENTER+UPDATE = ENTER`, `ENTER+LEAVE = nothing`, `UPDATE+LEAVE = LEAVE`,
/// `LEAVE+ENTER = UPDATE`.
fn stage_coalesced(staged: &mut Vec<SubscriptionDelta>, delta: SubscriptionDelta) {
    let Some(index) = staged.iter().position(|d| d.key == delta.key) else {
        staged.push(delta);
        return;
    };
    let previous = staged[index].kind;
    match (previous, delta.kind) {
        (DeltaKind::Enter, DeltaKind::Update) => {
            staged[index] = SubscriptionDelta {
                kind: DeltaKind::Enter,
                ..delta
            };
        }
        (DeltaKind::Enter, DeltaKind::Leave) => {
            staged.remove(index);
        }
        (DeltaKind::Update | DeltaKind::Leave, DeltaKind::Leave) => {
            staged[index] = delta;
        }
        (DeltaKind::Leave, DeltaKind::Enter) => {
            staged[index] = SubscriptionDelta {
                kind: DeltaKind::Update,
                ..delta
            };
        }
        // UPDATE+UPDATE, LEAVE+UPDATE (shouldn't happen), ENTER+ENTER:
        // keep the latest payload under the earlier kind's slot.
        _ => {
            let kind = staged[index].kind;
            staged[index] = SubscriptionDelta { kind, ..delta };
        }
    }
}
