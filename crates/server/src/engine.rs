//! Engine assembly: owns every component, wires the change fan-out, and
//! hands out collection handles.
//!
//! Ownership rules: the bus, buffer-level singletons, and the resolver
//! registry live here and are passed into constructors explicitly — no
//! process-wide state. The router and pool communicate only through the
//! bus.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use tidemark_core::messages::{OpBody, Operation, WriteConcern};
use tidemark_core::{Timestamp, Value};

use crate::ack::{AckOutcome, WriteAckManager};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::pool::{ConnectionPool, NodeDialer};
use crate::query::{NoRemote, QueryCoordinator, RemoteQuerier, SearchCatalog, SubscriptionManager};
use crate::replication::{BackupTransport, ReplicationQueue};
use crate::resolve::{ConflictResolver, EntryProcessorGate, SandboxHost};
use crate::routing::{ClusterBus, PartitionRouter};
use crate::store::maps::{MapEvent, MapKind, MapStore};
use crate::store::oplog::Oplog;
use crate::storage::{MemoryAdapter, StorageAdapter};
use crate::sync::apply::InboundApplier;

/// Sandbox placeholder for deployments without a sandbox host: every code
/// execution fails closed.
pub struct NoSandbox;

impl SandboxHost for NoSandbox {
    fn execute_resolver(
        &self,
        _code: &str,
        _ctx: &crate::resolve::MergeContext<'_>,
    ) -> anyhow::Result<crate::resolve::ResolverAction> {
        anyhow::bail!("no sandbox host configured")
    }

    fn execute_processor(
        &self,
        _code: &str,
        _value: Option<Value>,
        _key: &str,
        _args: Option<&Value>,
    ) -> anyhow::Result<crate::resolve::ProcessorOutcome> {
        anyhow::bail!("no sandbox host configured")
    }
}

/// Backup transport for single-node deployments: nothing to send to.
pub struct NoBackups;

#[async_trait::async_trait]
impl BackupTransport for NoBackups {
    async fn send_batch(
        &self,
        node_id: &str,
        _batch: tidemark_core::messages::ReplicationBatchPayload,
    ) -> anyhow::Result<tidemark_core::messages::ReplicationBatchAckPayload> {
        anyhow::bail!("no backup transport configured for {node_id}")
    }
}

/// Dialer for single-node deployments.
pub struct NoDialer;

#[async_trait::async_trait]
impl NodeDialer for NoDialer {
    async fn dial(&self, node_id: &str) -> anyhow::Result<()> {
        anyhow::bail!("no dialer configured for {node_id}")
    }

    async fn ping(&self, node_id: &str) -> anyhow::Result<u64> {
        anyhow::bail!("no dialer configured for {node_id}")
    }
}

/// External collaborators the engine is parameterized over.
pub struct EngineDeps {
    pub storage: Arc<dyn StorageAdapter>,
    pub sandbox: Arc<dyn SandboxHost>,
    pub dialer: Arc<dyn NodeDialer>,
    pub backup_transport: Arc<dyn BackupTransport>,
    pub remote_querier: Arc<dyn RemoteQuerier>,
}

impl Default for EngineDeps {
    fn default() -> Self {
        Self {
            storage: Arc::new(MemoryAdapter::new()),
            sandbox: Arc::new(NoSandbox),
            dialer: Arc::new(NoDialer),
            backup_transport: Arc::new(NoBackups),
            remote_querier: Arc::new(NoRemote),
        }
    }
}

/// The assembled engine.
pub struct Engine {
    pub config: EngineConfig,
    pub node_id: String,
    pub storage: Arc<dyn StorageAdapter>,
    pub store: Arc<MapStore>,
    pub oplog: Arc<Oplog>,
    pub bus: ClusterBus,
    pub router: Arc<PartitionRouter>,
    pub pool: Arc<ConnectionPool>,
    pub acks: Arc<WriteAckManager>,
    pub replication: Arc<ReplicationQueue>,
    pub resolver: Arc<ConflictResolver>,
    pub processors: Arc<EntryProcessorGate>,
    pub catalog: Arc<SearchCatalog>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub coordinator: Arc<QueryCoordinator>,
    pub applier: Arc<InboundApplier>,
}

impl Engine {
    /// Assembles an engine from configuration and its external
    /// collaborators.
    ///
    /// # Errors
    ///
    /// [`EngineError::Storage`] when the storage adapter fails to open.
    pub async fn assemble(config: EngineConfig, deps: EngineDeps) -> Result<Self, EngineError> {
        let node_id = if config.node_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            config.node_id.clone()
        };

        deps.storage
            .initialize(&node_id)
            .await
            .map_err(EngineError::Storage)?;

        let store = Arc::new(MapStore::new(node_id.clone()));
        let oplog = Arc::new(Oplog::open(deps.storage.clone(), config.backpressure.clone()).await?);
        let bus = ClusterBus::default();
        let router = Arc::new(PartitionRouter::new(bus.clone()));
        let pool = Arc::new(ConnectionPool::new(
            config.connection_pool.clone(),
            deps.dialer,
            bus.clone(),
        ));
        let acks = Arc::new(WriteAckManager::new(Duration::from_millis(
            config.write_ack.default_timeout_ms,
        )));
        let replication = ReplicationQueue::new(
            config.replication.clone(),
            deps.backup_transport,
            acks.clone(),
        );
        let resolver = Arc::new(ConflictResolver::new(
            config.processor.clone(),
            deps.sandbox.clone(),
        ));
        let processors = Arc::new(EntryProcessorGate::new(
            config.processor.clone(),
            deps.sandbox,
        ));
        let catalog = Arc::new(SearchCatalog::new());
        let subscriptions = Arc::new(SubscriptionManager::new(catalog.clone()));
        let coordinator = Arc::new(QueryCoordinator::new(
            store.clone(),
            catalog.clone(),
            deps.remote_querier,
        ));
        let applier = Arc::new(InboundApplier::new(
            node_id.clone(),
            store.clone(),
            resolver.clone(),
            replication.clone(),
            acks.clone(),
            router.clone(),
            deps.storage.clone(),
            config.replication.default_consistency,
        ));

        Ok(Self {
            config,
            node_id,
            storage: deps.storage,
            store,
            oplog,
            bus,
            router,
            pool,
            acks,
            replication,
            resolver,
            processors,
            catalog,
            subscriptions,
            coordinator,
            applier,
        })
    }

    /// Starts the background workers: change fan-out into the search
    /// catalog and live subscriptions, the debounced subscription flusher,
    /// and the replication batch flusher.
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let mut events = self.store.subscribe_all(1024);
        let catalog = self.catalog.clone();
        let subscriptions = self.subscriptions.clone();
        handles.push(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    MapEvent::Change(change) => {
                        catalog.apply_change(
                            &change.map_name,
                            &change.key,
                            change.new_value.as_ref(),
                        );
                        subscriptions.on_change(&change);
                    }
                    MapEvent::Init { .. } => {
                        // Hydration: indexes rebuild from the snapshot the
                        // loader passes through `SearchCatalog` directly.
                    }
                }
            }
        }));

        handles.push(
            self.subscriptions
                .spawn_flusher(self.config.sync.throttle_time_ms),
        );
        handles.push(
            self.replication
                .spawn_flusher(Arc::new(|| {
                    use tidemark_core::hlc::ClockSource;
                    tidemark_core::SystemClock.wall_millis()
                })),
        );

        // Tombstone prune sweep.
        let store = self.store.clone();
        let retention_ms = self.config.maintenance.tombstone_retention_ms;
        let sweep = Duration::from_millis(self.config.maintenance.prune_interval_ms.max(1));
        handles.push(tokio::spawn(async move {
            loop {
                tokio::time::sleep(sweep).await;
                let pruned = store.prune_tombstones(&retention_threshold(retention_ms));
                if pruned > 0 {
                    tracing::debug!(pruned, "tombstone sweep");
                }
            }
        }));
        handles
    }

    /// Runs one tombstone prune sweep immediately, using the configured
    /// retention window. Returns the number of entries dropped.
    pub fn prune_tombstones_now(&self) -> usize {
        self.store
            .prune_tombstones(&retention_threshold(
                self.config.maintenance.tombstone_retention_ms,
            ))
    }

    /// Starts the cluster-client workers: dials the configured seed nodes,
    /// runs the health prober over them, and reacts to bus events — a
    /// routing miss dials the hinted owner, a refresh request enqueues a
    /// `PARTITION_MAP_REQUEST` to the current primary.
    pub fn spawn_cluster_client(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for node in self.config.seed_nodes.clone() {
            let pool = self.pool.clone();
            handles.push(tokio::spawn(async move {
                let _ = pool.connect(&node).await;
            }));
        }
        let seeds = self.config.seed_nodes.clone();
        handles.push(self.pool.spawn_prober(Arc::new(move || seeds.clone())));

        // Periodic map refresh, independent of miss-triggered refreshes.
        let bus = self.bus.clone();
        let interval = Duration::from_millis(self.config.routing.map_refresh_interval_ms.max(1));
        handles.push(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                bus.publish(crate::routing::ClusterEvent::MapRefreshNeeded);
            }
        }));

        let mut events = self.bus.subscribe();
        let pool = self.pool.clone();
        let router = self.router.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "cluster event subscriber lagged");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                match event {
                    crate::routing::ClusterEvent::RoutingMiss {
                        hinted_owner: Some(owner),
                        ..
                    } => {
                        let pool = pool.clone();
                        tokio::spawn(async move {
                            let _ = pool.connect(&owner).await;
                        });
                    }
                    crate::routing::ClusterEvent::MapRefreshNeeded => {
                        if let Some(primary) = pool.primary() {
                            pool.enqueue(
                                &primary,
                                tidemark_core::Message::PartitionMapRequest(
                                    tidemark_core::messages::PartitionMapRequestPayload {
                                        current_version: Some(router.version()),
                                    },
                                ),
                            );
                        }
                    }
                    _ => {}
                }
            }
        }));
        handles
    }

    /// A typed handle to one named map.
    #[must_use]
    pub fn collection(&self, name: &str) -> Collection {
        Collection {
            name: name.to_string(),
            store: self.store.clone(),
            oplog: self.oplog.clone(),
            acks: self.acks.clone(),
            default_level: self.config.write_ack.default_level,
        }
    }

    /// Flushes the replication queue, fails the remaining pending write
    /// acks, and closes storage; call on shutdown.
    pub async fn shutdown(&self) {
        let wall: Arc<dyn Fn() -> u64 + Send + Sync> = Arc::new(|| {
            use tidemark_core::hlc::ClockSource;
            tidemark_core::SystemClock.wall_millis()
        });
        self.replication.flush_all(&wall).await;
        self.acks.fail_all("node shutting down");
        if let Err(error) = self.storage.close().await {
            tracing::warn!(%error, "storage close failed during shutdown");
        }
    }
}

/// Tombstones stamped before `now - retention_ms` are prunable.
fn retention_threshold(retention_ms: u64) -> Timestamp {
    use tidemark_core::hlc::ClockSource;
    Timestamp {
        millis: tidemark_core::SystemClock
            .wall_millis()
            .saturating_sub(retention_ms),
        counter: 0,
        node_id: String::new(),
    }
}

/// Local-first handle to one named map: mutations apply locally, journal to
/// the oplog, and return a write-ack future at the requested durability.
pub struct Collection {
    name: String,
    store: Arc<MapStore>,
    oplog: Arc<Oplog>,
    acks: Arc<WriteAckManager>,
    default_level: WriteConcern,
}

impl Collection {
    /// The live value for a key; absent keys read as `None`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.store.get(&self.name, key)
    }

    /// Sets a key, journaling the op. Returns the oplog id and the
    /// write-ack future for the requested (or default) durability.
    ///
    /// # Errors
    ///
    /// [`EngineError::Backpressure`] per the journal policy;
    /// [`EngineError::Schema`] on map-kind mismatch.
    pub async fn set(
        &self,
        key: &str,
        value: Value,
        concern: Option<WriteConcern>,
    ) -> Result<(u64, impl std::future::Future<Output = AckOutcome> + Send + 'static), EngineError>
    {
        self.oplog.ensure_capacity()?;
        let record = self.store.lww_set(&self.name, key, value.clone(), None)?;
        let op = Operation {
            id: 0,
            map_name: self.name.clone(),
            key: key.to_string(),
            body: OpBody::Put {
                value,
                timestamp: record.timestamp,
                ttl_ms: None,
            },
            write_concern: concern,
            timeout_ms: None,
        };
        self.journal(op, concern).await
    }

    /// Tombstones a key, journaling the op.
    ///
    /// # Errors
    ///
    /// As [`Collection::set`].
    pub async fn delete(
        &self,
        key: &str,
        concern: Option<WriteConcern>,
    ) -> Result<(u64, impl std::future::Future<Output = AckOutcome> + Send + 'static), EngineError>
    {
        self.oplog.ensure_capacity()?;
        let tombstone = self.store.lww_delete(&self.name, key)?;
        let op = Operation {
            id: 0,
            map_name: self.name.clone(),
            key: key.to_string(),
            body: OpBody::Remove {
                timestamp: tombstone.timestamp,
            },
            write_concern: concern,
            timeout_ms: None,
        };
        self.journal(op, concern).await
    }

    /// Adds an observed-remove observation, journaling the op. Returns the
    /// observation tag alongside the oplog id and ack future.
    ///
    /// # Errors
    ///
    /// As [`Collection::set`].
    pub async fn or_add(
        &self,
        key: &str,
        value: Value,
        concern: Option<WriteConcern>,
    ) -> Result<
        (
            String,
            u64,
            impl std::future::Future<Output = AckOutcome> + Send + 'static,
        ),
        EngineError,
    > {
        self.oplog.ensure_capacity()?;
        self.store.ensure_map(&self.name, MapKind::OrMap)?;
        let record = self.store.or_add(&self.name, key, value, None)?;
        let tag = record.tag.clone();
        let op = Operation {
            id: 0,
            map_name: self.name.clone(),
            key: key.to_string(),
            body: OpBody::OrAdd { record },
            write_concern: concern,
            timeout_ms: None,
        };
        let (id, ack) = self.journal(op, concern).await?;
        Ok((tag, id, ack))
    }

    /// Removes observed tags, journaling the op.
    ///
    /// # Errors
    ///
    /// As [`Collection::set`].
    pub async fn or_remove(
        &self,
        key: &str,
        tags: Vec<String>,
        concern: Option<WriteConcern>,
    ) -> Result<(u64, impl std::future::Future<Output = AckOutcome> + Send + 'static), EngineError>
    {
        self.oplog.ensure_capacity()?;
        self.store.ensure_map(&self.name, MapKind::OrMap)?;
        let at = Timestamp {
            millis: {
                use tidemark_core::hlc::ClockSource;
                tidemark_core::SystemClock.wall_millis()
            },
            counter: 0,
            node_id: self.store.node_id().to_string(),
        };
        self.store.or_remove(&self.name, key, &tags, at.clone())?;
        let op = Operation {
            id: 0,
            map_name: self.name.clone(),
            key: key.to_string(),
            body: OpBody::OrRemove {
                tags,
                timestamp: at,
            },
            write_concern: concern,
            timeout_ms: None,
        };
        self.journal(op, concern).await
    }

    /// Tags currently observed for a key.
    #[must_use]
    pub fn observed_tags(&self, key: &str) -> Vec<String> {
        // Snapshot projection does not expose tags; read through the store.
        self.store
            .records_since(&self.name, &Timestamp::zero())
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, record)| match record {
                tidemark_core::Record::Or { records, .. } => {
                    records.into_iter().map(|r| r.tag).collect()
                }
                _ => Vec::new(),
            })
            .unwrap_or_default()
    }

    /// Increments a counter, journaling the op.
    ///
    /// # Errors
    ///
    /// As [`Collection::set`].
    pub async fn increment(
        &self,
        key: &str,
        amount: f64,
        concern: Option<WriteConcern>,
    ) -> Result<(u64, impl std::future::Future<Output = AckOutcome> + Send + 'static), EngineError>
    {
        self.oplog.ensure_capacity()?;
        self.store.ensure_map(&self.name, MapKind::PnCounter)?;
        self.store.pn_increment(&self.name, key, amount)?;
        self.journal_counter(key, amount, concern, false).await
    }

    /// Decrements a counter, journaling the op.
    ///
    /// # Errors
    ///
    /// As [`Collection::set`].
    pub async fn decrement(
        &self,
        key: &str,
        amount: f64,
        concern: Option<WriteConcern>,
    ) -> Result<(u64, impl std::future::Future<Output = AckOutcome> + Send + 'static), EngineError>
    {
        self.oplog.ensure_capacity()?;
        self.store.ensure_map(&self.name, MapKind::PnCounter)?;
        self.store.pn_decrement(&self.name, key, amount)?;
        self.journal_counter(key, amount, concern, true).await
    }

    /// Decrements a counter, clamping at zero.
    ///
    /// # Errors
    ///
    /// As [`Collection::set`].
    pub async fn decrement_floor(
        &self,
        key: &str,
        amount: f64,
        concern: Option<WriteConcern>,
    ) -> Result<(u64, impl std::future::Future<Output = AckOutcome> + Send + 'static), EngineError>
    {
        self.oplog.ensure_capacity()?;
        self.store.ensure_map(&self.name, MapKind::PnCounter)?;
        let before = match self.store.get(&self.name, key) {
            Some(Value::Float(v)) => v,
            _ => 0.0,
        };
        let after = self.store.pn_decrement_floor(&self.name, key, amount)?;
        self.journal_counter(key, before - after, concern, true).await
    }

    async fn journal_counter(
        &self,
        key: &str,
        amount: f64,
        concern: Option<WriteConcern>,
        negative: bool,
    ) -> Result<(u64, impl std::future::Future<Output = AckOutcome> + Send + 'static), EngineError>
    {
        let state = self.store.pn_state(&self.name, key).unwrap_or_default();
        let body = if negative {
            OpBody::Dec { amount, state }
        } else {
            OpBody::Inc { amount, state }
        };
        let op = Operation {
            id: 0,
            map_name: self.name.clone(),
            key: key.to_string(),
            body,
            write_concern: concern,
            timeout_ms: None,
        };
        self.journal(op, concern).await
    }

    async fn journal(
        &self,
        op: Operation,
        concern: Option<WriteConcern>,
    ) -> Result<(u64, impl std::future::Future<Output = AckOutcome> + Send + 'static), EngineError>
    {
        let level = concern.unwrap_or(self.default_level);
        let id = self.oplog.append(op).await?;
        let ack = self.acks.register_pending(id, level, None);
        Ok((id, ack))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn engine() -> Engine {
        Engine::assemble(EngineConfig::default(), EngineDeps::default())
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn collection_set_journals_and_applies_locally() {
        let engine = engine().await;
        let users = engine.collection("users");
        let (id, _ack) = users
            .set("user/1", Value::from("Alice"), None)
            .await
            .unwrap();
        assert!(id > 0);
        assert_eq!(users.get("user/1"), Some(Value::from("Alice")));
        assert_eq!(engine.oplog.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn or_collection_roundtrip() {
        let engine = engine().await;
        let tags = engine.collection("tags");
        let (tag, _, _) = tags.or_add("post/1", Value::from("rust"), None).await.unwrap();
        assert_eq!(tags.observed_tags("post/1"), vec![tag.clone()]);
        tags.or_remove("post/1", vec![tag], None).await.unwrap();
        assert_eq!(tags.get("post/1"), None);
        assert_eq!(engine.oplog.pending_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn counter_collection_floor() {
        let engine = engine().await;
        let stats = engine.collection("stats");
        stats.increment("hits", 3.0, None).await.unwrap();
        stats.decrement_floor("hits", 10.0, None).await.unwrap();
        assert_eq!(stats.get("hits"), Some(Value::Float(0.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn prune_sweep_drops_aged_tombstones() {
        let engine = engine().await;
        // A tombstone stamped far enough in the past to clear the default
        // retention window, as a long-offline replica would replay it.
        engine
            .store
            .lww_merge(
                "users",
                "u1",
                tidemark_core::LwwRecord {
                    value: None,
                    timestamp: tidemark_core::Timestamp {
                        millis: 10,
                        counter: 0,
                        node_id: "old-node".into(),
                    },
                    ttl_ms: None,
                },
            )
            .unwrap();
        // A fresh live record is untouchable.
        let users = engine.collection("users");
        users.set("u2", Value::Int(1), None).await.unwrap();

        let pruned = engine.prune_tombstones_now();
        assert_eq!(pruned, 1);
        assert!(engine.store.lww_timestamp("users", "u1").is_none());
        assert!(engine.store.lww_timestamp("users", "u2").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn background_fanout_feeds_catalog_and_subscriptions() {
        let engine = engine().await;
        let handles = engine.spawn_background();

        let docs = engine.collection("docs");
        let body = Value::Map(
            [("body".to_string(), Value::from("tidal sync engine"))]
                .into_iter()
                .collect(),
        );
        docs.set("d1", body, None).await.unwrap();

        // Let the fan-out task drain the event.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert_eq!(engine.catalog.search("docs", "tidal").len(), 1);
        for handle in handles {
            handle.abort();
        }
    }
}
