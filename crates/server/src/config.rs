//! Engine configuration tree.
//!
//! Every tunable the engine recognizes, grouped by subsystem, with the
//! defaults the rest of the codebase assumes. All structs deserialize from
//! JSON config files and derive `Default` so tests can override one field
//! with struct-update syntax.

use serde::{Deserialize, Serialize};
use tidemark_core::messages::WriteConcern;

/// Whether clients route operations to partition owners themselves or let
/// their primary node forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    /// Client computes the owner and connects to it directly.
    Direct,
    /// Client sends everything to its primary; the primary forwards.
    Forward,
}

/// What the router does when it cannot resolve an owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackMode {
    /// Send to the primary node and let it forward.
    Forward,
    /// Fail the operation with a routing error.
    Error,
}

/// What the oplog does when the pending backlog is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressureStrategy {
    /// Block the writer until the backlog drains.
    Block,
    /// Drop the oldest non-critical pending op to make room.
    Drop,
    /// Fail the append with a backpressure error.
    Throw,
}

/// Per-node connection pool tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionPoolConfig {
    pub max_connections_per_node: usize,
    pub connection_timeout_ms: u64,
    pub health_check_interval_ms: u64,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_node: 1,
            connection_timeout_ms: 5_000,
            health_check_interval_ms: 10_000,
            reconnect_delay_ms: 500,
            max_reconnect_delay_ms: 30_000,
            max_reconnect_attempts: 10,
        }
    }
}

/// Partition routing tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoutingConfig {
    pub fallback_mode: FallbackMode,
    pub map_refresh_interval_ms: u64,
    pub max_map_staleness_ms: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            fallback_mode: FallbackMode::Forward,
            map_refresh_interval_ms: 30_000,
            max_map_staleness_ms: 60_000,
        }
    }
}

/// Replication fan-out tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReplicationConfig {
    pub default_consistency: Consistency,
    pub queue_size_limit: usize,
    pub batch_size: usize,
    pub batch_interval_ms: u64,
    pub ack_timeout_ms: u64,
    pub max_retries: u32,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            default_consistency: Consistency::Quorum,
            queue_size_limit: 10_000,
            batch_size: 100,
            batch_interval_ms: 50,
            ack_timeout_ms: 5_000,
            max_retries: 3,
        }
    }
}

/// Consistency level for backup replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Consistency {
    /// Owner waits for every backup before REPLICATED.
    Strong,
    /// Owner waits for a majority (owner included).
    Quorum,
    /// Owner acknowledges immediately; backups catch up asynchronously.
    Eventual,
}

/// Write-acknowledgment tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WriteAckConfig {
    pub default_timeout_ms: u64,
    pub default_level: WriteConcern,
}

impl Default for WriteAckConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5_000,
            default_level: WriteConcern::Applied,
        }
    }
}

/// Oplog backpressure tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackpressureConfig {
    pub max_pending_ops: usize,
    pub strategy: BackpressureStrategy,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            max_pending_ops: 1_000,
            strategy: BackpressureStrategy::Block,
        }
    }
}

/// Entry-processor and resolver sandbox limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessorConfig {
    pub max_executions_per_second: u32,
    pub max_code_size_bytes: usize,
    pub max_args_size_bytes: usize,
    pub max_resolvers_per_map: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_executions_per_second: 100,
            max_code_size_bytes: 10 * 1024,
            max_args_size_bytes: 1024 * 1024,
            max_resolvers_per_map: 16,
        }
    }
}

/// Background maintenance tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MaintenanceConfig {
    /// How long tombstones are kept before the prune sweep drops them. Must
    /// exceed the longest expected replication delay.
    pub tombstone_retention_ms: u64,
    /// Interval between prune sweeps.
    pub prune_interval_ms: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            tombstone_retention_ms: 24 * 60 * 60 * 1000,
            prune_interval_ms: 60_000,
        }
    }
}

/// Sync session tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Max operations per push batch.
    pub batch_size: usize,
    /// Ack deadline for a pushed batch.
    pub ack_timeout_ms: u64,
    /// Transitions kept in the session history ring.
    pub history_size: usize,
    /// Debounce window for live subscription flushes.
    pub throttle_time_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            ack_timeout_ms: 5_000,
            history_size: 50,
            throttle_time_ms: 50,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// This node's id; empty means derive a uuid at startup.
    pub node_id: String,
    /// Initial peers to learn the cluster from.
    pub seed_nodes: Vec<String>,
    /// Client-side routing behavior.
    pub routing_mode: RoutingMode,
    pub connection_pool: ConnectionPoolConfig,
    pub routing: RoutingConfig,
    pub replication: ReplicationConfig,
    pub write_ack: WriteAckConfig,
    pub backpressure: BackpressureConfig,
    pub processor: ProcessorConfig,
    pub sync: SyncConfig,
    pub maintenance: MaintenanceConfig,
    /// Whether the read-only debug endpoints answer (404 otherwise).
    pub debug_endpoints: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            seed_nodes: Vec::new(),
            routing_mode: RoutingMode::Direct,
            connection_pool: ConnectionPoolConfig::default(),
            routing: RoutingConfig::default(),
            replication: ReplicationConfig::default(),
            write_ack: WriteAckConfig::default(),
            backpressure: BackpressureConfig::default(),
            processor: ProcessorConfig::default(),
            sync: SyncConfig::default(),
            maintenance: MaintenanceConfig::default(),
            debug_endpoints: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.replication.batch_size, 100);
        assert_eq!(config.replication.batch_interval_ms, 50);
        assert_eq!(config.replication.queue_size_limit, 10_000);
        assert_eq!(config.replication.max_retries, 3);
        assert_eq!(config.connection_pool.connection_timeout_ms, 5_000);
        assert_eq!(config.routing.map_refresh_interval_ms, 30_000);
        assert_eq!(config.processor.max_executions_per_second, 100);
        assert_eq!(config.processor.max_code_size_bytes, 10 * 1024);
        assert_eq!(config.processor.max_args_size_bytes, 1024 * 1024);
        assert_eq!(config.maintenance.prune_interval_ms, 60_000);
        assert_eq!(config.maintenance.tombstone_retention_ms, 86_400_000);
        assert!(!config.debug_endpoints);
    }

    #[test]
    fn partial_json_overrides_only_named_fields() {
        let config: EngineConfig = serde_json::from_str(
            r#"{
                "nodeId": "n1",
                "routingMode": "forward",
                "backpressure": { "maxPendingOps": 10, "strategy": "throw" }
            }"#,
        )
        .expect("parse");
        assert_eq!(config.node_id, "n1");
        assert_eq!(config.routing_mode, RoutingMode::Forward);
        assert_eq!(config.backpressure.max_pending_ops, 10);
        assert_eq!(config.backpressure.strategy, BackpressureStrategy::Throw);
        // Untouched sections keep defaults.
        assert_eq!(config.replication.batch_size, 100);
    }

    #[test]
    fn consistency_wire_names() {
        assert_eq!(
            serde_json::to_string(&Consistency::Strong).unwrap(),
            "\"STRONG\""
        );
        assert_eq!(
            serde_json::to_string(&Consistency::Eventual).unwrap(),
            "\"EVENTUAL\""
        );
    }
}
