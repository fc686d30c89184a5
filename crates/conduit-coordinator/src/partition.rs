use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::group::DatastreamGroup;

/// The authoritative set of source partitions for a datastream group, as
/// observed by its connector at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupPartitions {
    task_prefix: String,
    partitions: Vec<String>,
}

impl GroupPartitions {
    pub fn new(
        task_prefix: impl Into<String>,
        partitions: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            task_prefix: task_prefix.into(),
            partitions: partitions.into_iter().collect(),
        }
    }

    pub fn task_prefix(&self) -> &str {
        &self.task_prefix
    }

    pub fn partitions(&self) -> &[String] {
        &self.partitions
    }

    pub fn contains(&self, partition: &str) -> bool {
        self.partitions.iter().any(|p| p == partition)
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// A seed derived from the snapshot content, independent of the order
    /// in which the connector reported the partitions. Seeding the
    /// unassigned-partition shuffle from this value makes rebalances
    /// reproducible for a given snapshot.
    pub fn shuffle_seed(&self) -> u64 {
        let mut sorted: Vec<_> = self.partitions.iter().collect();
        sorted.sort();
        let mut hasher = DefaultHasher::new();
        self.task_prefix.hash(&mut hasher);
        sorted.hash(&mut hasher);
        hasher.finish()
    }
}

/// The connector-side source of partition metadata.
#[async_trait]
pub trait PartitionMetadataProvider: Send + Sync + 'static {
    /// The current partition snapshot for the group.
    async fn group_partitions(&self, group: &DatastreamGroup) -> CoordinatorResult<GroupPartitions>;
}

/// A provider backed by a fixed table, used by tests and local deployments
/// where partition discovery is not wired to a live source. The table can
/// be updated at any time to simulate partition growth or shrinkage.
#[derive(Debug, Default)]
pub struct StaticPartitionProvider {
    partitions: RwLock<BTreeMap<String, Vec<String>>>,
}

impl StaticPartitionProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, task_prefix: impl Into<String>, partitions: Vec<String>) {
        if let Ok(mut table) = self.partitions.write() {
            table.insert(task_prefix.into(), partitions);
        }
    }
}

#[async_trait]
impl PartitionMetadataProvider for StaticPartitionProvider {
    async fn group_partitions(&self, group: &DatastreamGroup) -> CoordinatorResult<GroupPartitions> {
        let partitions = self
            .partitions
            .read()
            .map_err(|_| CoordinatorError::Internal("partition table is poisoned".to_string()))?
            .get(group.task_prefix())
            .cloned()
            .ok_or_else(|| {
                CoordinatorError::invalid(format!(
                    "no partition metadata for datastream group {}",
                    group.task_prefix()
                ))
            })?;
        Ok(GroupPartitions::new(group.task_prefix(), partitions))
    }
}
