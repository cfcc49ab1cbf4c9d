//! Engine error taxonomy.
//!
//! Every failure that crosses a component boundary is one of these kinds.
//! Recovery ownership: transport and routing errors are handled by the pool
//! and router (reconnect, map refresh, retry); backpressure surfaces to the
//! writer; drift and sandbox violations kill the offending operation, not
//! the connection; replication timeouts resolve write-acks unsuccessfully;
//! storage errors surface to the caller of the failing operation. Missing
//! keys are not errors anywhere — reads return absent.

use tidemark_core::messages::WriteConcern;
use tidemark_core::ClockDriftError;

/// Routing-specific failure: the request reached the wrong node or used a
/// stale partition map.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    /// The receiving node does not own the partition.
    #[error("not the owner of partition {partition_id} (current owner: {current_owner:?})")]
    NotOwner {
        partition_id: u32,
        current_owner: Option<String>,
        map_version: u64,
    },
    /// The sender routed with an outdated map version.
    #[error("stale partition map: client has v{client_version}, server has v{server_version}")]
    StaleMap {
        client_version: u64,
        server_version: u64,
    },
    /// No partition map is loaded yet; callers fall back per policy.
    #[error("no partition map loaded")]
    NoMap,
}

/// Top-level error for engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Socket drop, handshake failure, send timeout.
    #[error("transport: {0}")]
    Transport(String),

    /// Missing or rejected credentials.
    #[error("unauthorized: {0}")]
    Auth(String),

    /// Malformed frame or schema violation.
    #[error("protocol: {0}")]
    Protocol(String),

    /// Misrouted request or stale map.
    #[error(transparent)]
    Routing(#[from] RoutingError),

    /// The pending-op backlog is full and the policy rejects new writes.
    #[error("backpressure: {pending_count} pending ops at limit {max_pending}")]
    Backpressure {
        pending_count: usize,
        max_pending: usize,
    },

    /// A remote clock ran too far ahead.
    #[error(transparent)]
    ClockDrift(#[from] ClockDriftError),

    /// Replication to backups did not complete in time. The write-ack
    /// resolves unsuccessfully with the highest achieved level.
    #[error("replication timed out at level {achieved:?} (requested {requested:?})")]
    ReplicationTimeout {
        achieved: WriteConcern,
        requested: WriteConcern,
    },

    /// A conflict-resolver binding rejected the incoming record.
    #[error("resolver `{resolver}` rejected write to {map_name}/{key}: {reason}")]
    ResolverRejection {
        resolver: String,
        map_name: String,
        key: String,
        reason: String,
    },

    /// Resolver or processor code failed sandbox validation or exceeded its
    /// limits.
    #[error("sandbox violation: {0}")]
    Sandbox(String),

    /// The storage adapter failed.
    #[error("storage: {0}")]
    Storage(#[source] anyhow::Error),

    /// A payload failed structural validation.
    #[error("schema: {0}")]
    Schema(String),
}

impl EngineError {
    /// Short stable code for wire error frames and metrics labels.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Transport(_) => "TRANSPORT",
            EngineError::Auth(_) => "AUTH",
            EngineError::Protocol(_) => "PROTOCOL",
            EngineError::Routing(RoutingError::NotOwner { .. }) => "NOT_OWNER",
            EngineError::Routing(RoutingError::StaleMap { .. }) => "STALE_MAP",
            EngineError::Routing(RoutingError::NoMap) => "NO_MAP",
            EngineError::Backpressure { .. } => "BACKPRESSURE",
            EngineError::ClockDrift(_) => "CLOCK_DRIFT",
            EngineError::ReplicationTimeout { .. } => "REPLICATION_TIMEOUT",
            EngineError::ResolverRejection { .. } => "RESOLVER_REJECTION",
            EngineError::Sandbox(_) => "SANDBOX",
            EngineError::Storage(_) => "STORAGE",
            EngineError::Schema(_) => "SCHEMA",
        }
    }
}
