//! Partition routing: key-to-owner resolution over the versioned partition
//! map, plus the cluster event bus.
//!
//! The router and the connection pool never reference each other; both
//! publish and subscribe on [`ClusterBus`], owned by the enclosing engine.
//! Readers resolve routes lock-free against an `ArcSwap` snapshot of the
//! current map.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tokio::sync::broadcast;

use tidemark_core::messages::{NotOwnerPayload, PartitionMapDeltaPayload, StaleMapPayload};
use tidemark_core::partition::PartitionMapError;
use tidemark_core::{key_to_partition, PartitionMap};

use crate::error::RoutingError;

/// Events exchanged between routing, pooling, and session components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    /// A server answered `NOT_OWNER`; the router wants a refreshed map and
    /// the hinted owner should be dialed.
    RoutingMiss {
        partition_id: u32,
        hinted_owner: Option<String>,
    },
    /// The current map cannot chain a delta (or is known stale); whoever
    /// owns the server channel should request a full snapshot.
    MapRefreshNeeded,
    /// A new partition map version was installed.
    MapUpdated { version: u64 },
    /// A node stopped responding (reconnects exhausted, replication dead).
    NodeUnhealthy { node_id: String },
    /// A node came back.
    NodeRecovered { node_id: String },
}

/// Broadcast bus for [`ClusterEvent`]s.
#[derive(Clone)]
pub struct ClusterBus {
    tx: broadcast::Sender<ClusterEvent>,
}

impl ClusterBus {
    /// Creates a bus with a bounded fan-out buffer.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publishes an event; lagging subscribers miss it rather than blocking.
    pub fn publish(&self, event: ClusterEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribes to all future events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.tx.subscribe()
    }
}

impl Default for ClusterBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// A resolved route for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub partition_id: u32,
    pub owner: String,
    pub backups: Vec<String>,
}

/// Key-to-owner resolver over the cluster-published partition map.
pub struct PartitionRouter {
    current: ArcSwapOption<PartitionMap>,
    bus: ClusterBus,
}

impl PartitionRouter {
    /// Creates a router with no map loaded.
    #[must_use]
    pub fn new(bus: ClusterBus) -> Self {
        Self {
            current: ArcSwapOption::empty(),
            bus,
        }
    }

    /// The installed map version; zero before the first snapshot.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.current.load().as_ref().map_or(0, |m| m.version())
    }

    /// Whether any partition map has been loaded (readiness gate).
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.current.load().is_some()
    }

    /// A snapshot of the current map, for the debug surface.
    #[must_use]
    pub fn snapshot(&self) -> Option<Arc<PartitionMap>> {
        self.current.load_full()
    }

    /// Resolves a key to its partition and owner.
    ///
    /// `None` when no map is loaded or the partition is unassigned; callers
    /// fall back per the configured routing policy.
    #[must_use]
    pub fn route(&self, key: &str) -> Option<Route> {
        let map = self.current.load_full()?;
        let partition_id = key_to_partition(key);
        let owner = map.owner(partition_id)?.to_string();
        Some(Route {
            partition_id,
            owner,
            backups: map.backups(partition_id).to_vec(),
        })
    }

    /// Installs a full snapshot. Stale snapshots are ignored: versions never
    /// go backwards.
    pub fn apply_snapshot(&self, snapshot: PartitionMap) {
        let version = snapshot.version();
        if version <= self.version() {
            tracing::debug!(
                snapshot = version,
                current = self.version(),
                "ignoring stale partition map snapshot"
            );
            return;
        }
        self.current.store(Some(Arc::new(snapshot)));
        metrics::gauge!("partition_map_version").set(version as f64);
        self.bus.publish(ClusterEvent::MapUpdated { version });
    }

    /// Applies a delta that must chain onto the current version.
    ///
    /// # Errors
    ///
    /// [`RoutingError::StaleMap`] when the delta does not chain (a refresh
    /// request is published on the bus first).
    pub fn apply_delta(&self, delta: &PartitionMapDeltaPayload) -> Result<(), RoutingError> {
        let Some(current) = self.current.load_full() else {
            self.bus.publish(ClusterEvent::MapRefreshNeeded);
            return Err(RoutingError::NoMap);
        };
        let mut next = (*current).clone();
        match next.apply_delta(delta.version, delta.previous_version, &delta.changes) {
            Ok(()) => {
                self.current.store(Some(Arc::new(next)));
                self.bus.publish(ClusterEvent::MapUpdated {
                    version: delta.version,
                });
                Ok(())
            }
            Err(PartitionMapError::DeltaGap { current, .. }) => {
                self.bus.publish(ClusterEvent::MapRefreshNeeded);
                Err(RoutingError::StaleMap {
                    client_version: current,
                    server_version: delta.version,
                })
            }
            Err(error) => {
                tracing::warn!(%error, "rejecting malformed partition map delta");
                self.bus.publish(ClusterEvent::MapRefreshNeeded);
                Err(RoutingError::NoMap)
            }
        }
    }

    /// Reacts to a `NOT_OWNER` reply: publishes the miss (so the pool dials
    /// the hinted owner) and asks for a refreshed map.
    pub fn handle_not_owner(&self, payload: &NotOwnerPayload) {
        metrics::counter!("routing_miss").increment(1);
        tracing::debug!(
            partition_id = payload.partition_id,
            hinted = ?payload.current_owner,
            "routing miss"
        );
        self.bus.publish(ClusterEvent::RoutingMiss {
            partition_id: payload.partition_id,
            hinted_owner: payload.current_owner.clone(),
        });
        self.bus.publish(ClusterEvent::MapRefreshNeeded);
    }

    /// Reacts to a `STALE_MAP` reply by requesting a refresh.
    pub fn handle_stale_map(&self, payload: &StaleMapPayload) {
        tracing::debug!(
            client_version = payload.client_version,
            server_version = payload.server_version,
            "server reports stale partition map"
        );
        self.bus.publish(ClusterEvent::MapRefreshNeeded);
    }

    /// Validates an inbound routed operation against this node's map.
    ///
    /// # Errors
    ///
    /// [`RoutingError::NotOwner`] when the partition belongs to another
    /// node; [`RoutingError::StaleMap`] when the sender's map version lags
    /// this node's.
    pub fn validate_routed(
        &self,
        local_node: &str,
        partition_id: u32,
        sender_map_version: u64,
    ) -> Result<(), RoutingError> {
        let Some(map) = self.current.load_full() else {
            return Err(RoutingError::NoMap);
        };
        let owner = map.owner(partition_id);
        if owner != Some(local_node) {
            return Err(RoutingError::NotOwner {
                partition_id,
                current_owner: owner.map(str::to_string),
                map_version: map.version(),
            });
        }
        if sender_map_version < map.version() {
            return Err(RoutingError::StaleMap {
                client_version: sender_map_version,
                server_version: map.version(),
            });
        }
        Ok(())
    }
}
