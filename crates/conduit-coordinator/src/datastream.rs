use std::collections::BTreeMap;

use conduit_kafka::{KafkaConnectionString, KafkaResult};
use serde::{Deserialize, Serialize};

/// Reserved metadata key carrying the task prefix shared by the
/// datastreams of a group. Falls back to the datastream name.
pub const METADATA_TASK_PREFIX: &str = "system.taskPrefix";
/// Reserved metadata key overriding the configured task count for a group.
pub const METADATA_MAX_TASKS: &str = "system.maxTasks";
/// Reserved metadata key marking a group whose destination is sharded by
/// source partition, which allows tasks to co-reside on an instance.
pub const METADATA_PARTITION_MANAGED: &str = "system.partitionManaged";
/// Metadata key naming the owner of the datastream.
pub const METADATA_OWNER: &str = "owner";

/// A named source-to-destination pipeline as stored under `/{cluster}/dms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Datastream {
    pub name: String,
    pub connector_name: String,
    pub source: DatastreamSource,
    pub destination: DatastreamDestination,
    pub transport_provider_name: String,
    pub status: DatastreamStatus,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Datastream {
    /// The task prefix this datastream contributes its work under.
    pub fn task_prefix(&self) -> &str {
        self.metadata
            .get(METADATA_TASK_PREFIX)
            .map(String::as_str)
            .unwrap_or(&self.name)
    }

    /// The task-count override from metadata, if present and well-formed.
    pub fn max_tasks(&self) -> Option<usize> {
        self.metadata
            .get(METADATA_MAX_TASKS)
            .and_then(|v| v.parse().ok())
    }

    pub fn is_partition_managed(&self) -> bool {
        self.metadata
            .get(METADATA_PARTITION_MANAGED)
            .is_some_and(|v| v == "true")
    }

    /// The parsed source connection string, for datastreams whose
    /// connector consumes a message log.
    pub fn kafka_source(&self) -> KafkaResult<KafkaConnectionString> {
        self.source.connection_string.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatastreamSource {
    pub connection_string: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatastreamDestination {
    pub connection_string: String,
    pub partitions: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DatastreamStatus {
    Ready,
    Paused,
    Stopping,
    Deleting,
}

impl DatastreamStatus {
    /// Whether the datastream should receive task assignments.
    pub fn is_assignable(&self) -> bool {
        matches!(self, DatastreamStatus::Ready)
    }
}
