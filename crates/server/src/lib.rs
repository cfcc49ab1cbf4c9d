//! Tidemark server — sync sessions, partition routing, replication,
//! conflict resolution, and the query pipeline over the CRDT core.

pub mod ack;
pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod pool;
pub mod query;
pub mod replication;
pub mod resolve;
pub mod routing;
pub mod storage;
pub mod store;
pub mod sync;

pub use ack::{AckEvent, AckOutcome, WriteAckManager};
pub use config::{
    BackpressureStrategy, Consistency, EngineConfig, FallbackMode, RoutingMode,
};
pub use engine::{Collection, Engine, EngineDeps};
pub use error::{EngineError, RoutingError};
pub use pool::{ConnectionPool, NodeDialer, SessionState};
pub use query::{QueryCoordinator, SearchCatalog, SubscriptionManager};
pub use replication::{BackupTransport, LagStats, ReplicationQueue};
pub use resolve::{
    ConflictResolver, EntryProcessorGate, MergeContext, MergeDecision, MergePolicy,
    MergeRejection, ProcessorOutcome, ResolverAction, SandboxHost,
};
pub use routing::{ClusterBus, ClusterEvent, PartitionRouter, Route};
pub use storage::{MemoryAdapter, StorageAdapter, StoredOp};
pub use store::{ChangeEvent, ChangeKind, MapEvent, MapKind, MapStore, Oplog};
pub use sync::{StateMachine, SyncSession, SyncState, SyncTransport};
