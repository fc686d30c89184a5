use std::sync::Arc;
use std::time::Duration;

use conduit_common::config::AppConfig;
use conduit_server::retry::RetryStrategy;

use crate::partition::PartitionMetadataProvider;
use crate::store::CoordinationStore;

#[derive(Clone)]
pub struct CoordinatorOptions {
    /// The instance this coordinator runs on; only the elected leader
    /// instance actually rebalances.
    pub instance: String,
    pub store: Arc<dyn CoordinationStore>,
    pub partitions: Arc<dyn PartitionMetadataProvider>,
    pub debounce_interval: Duration,
    pub operation_timeout: Duration,
    pub rebalance_deadline: Duration,
    pub retry_strategy: RetryStrategy,
    pub max_tasks: usize,
    pub imbalance_threshold: usize,
    pub max_partitions_per_task: usize,
}

impl CoordinatorOptions {
    pub fn new(
        config: &AppConfig,
        instance: impl Into<String>,
        store: Arc<dyn CoordinationStore>,
        partitions: Arc<dyn PartitionMetadataProvider>,
    ) -> Self {
        Self {
            instance: instance.into(),
            store,
            partitions,
            debounce_interval: Duration::from_millis(config.cluster.debounce_interval_ms),
            operation_timeout: Duration::from_secs(config.store.operation_timeout_secs),
            rebalance_deadline: Duration::from_secs(config.store.rebalance_deadline_secs),
            retry_strategy: RetryStrategy::from(&config.store.retry_strategy),
            max_tasks: config.assignment.max_tasks,
            imbalance_threshold: config.assignment.imbalance_threshold,
            max_partitions_per_task: config.assignment.max_partitions_per_task,
        }
    }
}
