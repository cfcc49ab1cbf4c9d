//! Partition ownership: key hashing, the versioned partition map, and delta
//! application.
//!
//! The key space is split into [`PARTITION_COUNT`] fixed partitions; each
//! partition has one owner node and zero or more backups. The cluster owns
//! the map and publishes full snapshots and deltas; everyone else treats it
//! as a read-only, monotonically versioned cache.

use serde::{Deserialize, Serialize};

use crate::hash::key_hash;

/// Number of partitions. A prime, for uniform modulo distribution.
pub const PARTITION_COUNT: u32 = 271;

/// Maps a key to its partition id in `[0, PARTITION_COUNT)`.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // modulo 271 fits in u32
pub fn key_to_partition(key: &str) -> u32 {
    (key_hash(key) % u64::from(PARTITION_COUNT)) as u32
}

/// A cluster member as published in the partition map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    /// Unique node id.
    pub node_id: String,
    /// Host the node accepts client connections on.
    pub host: String,
    /// Client-facing port.
    pub port: u16,
}

/// Ownership entry for a single partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionEntry {
    /// Partition id in `[0, PARTITION_COUNT)`.
    pub partition_id: u32,
    /// Node that owns the partition.
    pub owner: String,
    /// Backup nodes, in replication order.
    pub backups: Vec<String>,
}

/// One ownership change within a partition-map delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionChange {
    /// Partition whose ownership changed.
    pub partition_id: u32,
    /// New owner.
    pub owner: String,
    /// New backup list.
    pub backups: Vec<String>,
}

/// Why a snapshot or delta could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PartitionMapError {
    /// Snapshot version is not newer than the current one. Versions never go
    /// backwards on a client.
    #[error("stale partition map: snapshot version {snapshot} <= current {current}")]
    StaleSnapshot { snapshot: u64, current: u64 },
    /// Delta's `previous_version` does not match the current version; the
    /// caller must request a full refresh.
    #[error("partition map delta expects previous version {expected}, current is {current}")]
    DeltaGap { expected: u64, current: u64 },
    /// A partition id outside `[0, PARTITION_COUNT)`.
    #[error("partition id {0} out of range")]
    PartitionOutOfRange(u32),
}

/// Versioned partition-to-owner table.
///
/// Owners are stored in a dense vector indexed by partition id; lookups are
/// O(1). Version is monotonic: snapshots only apply when strictly newer,
/// deltas only when they chain exactly onto the current version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionMap {
    version: u64,
    nodes: Vec<NodeInfo>,
    partitions: Vec<Option<PartitionEntry>>,
}

impl PartitionMap {
    /// An empty, unversioned map: every partition unassigned, version 0.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            version: 0,
            nodes: Vec::new(),
            partitions: vec![None; PARTITION_COUNT as usize],
        }
    }

    /// Builds a map from a full snapshot.
    ///
    /// # Errors
    ///
    /// [`PartitionMapError::PartitionOutOfRange`] when an entry names a
    /// partition outside the fixed range.
    pub fn from_snapshot(
        version: u64,
        nodes: Vec<NodeInfo>,
        entries: Vec<PartitionEntry>,
    ) -> Result<Self, PartitionMapError> {
        let mut partitions = vec![None; PARTITION_COUNT as usize];
        for entry in entries {
            if entry.partition_id >= PARTITION_COUNT {
                return Err(PartitionMapError::PartitionOutOfRange(entry.partition_id));
            }
            let partition_id = entry.partition_id as usize;
            partitions[partition_id] = Some(entry);
        }
        Ok(Self {
            version,
            nodes,
            partitions,
        })
    }

    /// Current map version.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Cluster members as of this version.
    #[must_use]
    pub fn nodes(&self) -> &[NodeInfo] {
        &self.nodes
    }

    /// Owner of a partition, if assigned.
    #[must_use]
    pub fn owner(&self, partition_id: u32) -> Option<&str> {
        self.partitions
            .get(partition_id as usize)
            .and_then(|e| e.as_ref())
            .map(|e| e.owner.as_str())
    }

    /// Backup nodes of a partition.
    #[must_use]
    pub fn backups(&self, partition_id: u32) -> &[String] {
        self.partitions
            .get(partition_id as usize)
            .and_then(|e| e.as_ref())
            .map_or(&[], |e| e.backups.as_slice())
    }

    /// Owner of the partition a key hashes to.
    #[must_use]
    pub fn owner_for_key(&self, key: &str) -> Option<&str> {
        self.owner(key_to_partition(key))
    }

    /// All partition ids owned by a node.
    #[must_use]
    pub fn partitions_of(&self, node_id: &str) -> Vec<u32> {
        self.partitions
            .iter()
            .filter_map(|entry| {
                entry
                    .as_ref()
                    .filter(|e| e.owner == node_id)
                    .map(|e| e.partition_id)
            })
            .collect()
    }

    /// Replaces this map with a strictly newer snapshot.
    ///
    /// # Errors
    ///
    /// [`PartitionMapError::StaleSnapshot`] when the snapshot is not newer.
    pub fn apply_snapshot(&mut self, snapshot: PartitionMap) -> Result<(), PartitionMapError> {
        if snapshot.version <= self.version {
            return Err(PartitionMapError::StaleSnapshot {
                snapshot: snapshot.version,
                current: self.version,
            });
        }
        *self = snapshot;
        Ok(())
    }

    /// Applies a delta that chains onto the current version.
    ///
    /// # Errors
    ///
    /// [`PartitionMapError::DeltaGap`] when `previous_version` does not match
    /// the current version — the caller must request a full snapshot.
    pub fn apply_delta(
        &mut self,
        version: u64,
        previous_version: u64,
        changes: &[PartitionChange],
    ) -> Result<(), PartitionMapError> {
        if previous_version != self.version {
            return Err(PartitionMapError::DeltaGap {
                expected: previous_version,
                current: self.version,
            });
        }
        for change in changes {
            if change.partition_id >= PARTITION_COUNT {
                return Err(PartitionMapError::PartitionOutOfRange(change.partition_id));
            }
        }
        for change in changes {
            self.partitions[change.partition_id as usize] = Some(PartitionEntry {
                partition_id: change.partition_id,
                owner: change.owner.clone(),
                backups: change.backups.clone(),
            });
        }
        self.version = version;
        Ok(())
    }
}
