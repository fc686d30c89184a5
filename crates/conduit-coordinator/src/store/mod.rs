mod memory;
mod paths;

pub use memory::MemoryStore;
pub use paths::ClusterPaths;

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, watch};

use crate::assignment::{Assignment, TargetAssignment};
use crate::datastream::Datastream;
use crate::error::CoordinatorError;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A failure worth retrying with backoff, e.g. a connection loss.
    #[error("transient store failure: {0}")]
    Transient(String),
    /// A failure that invalidates the session; the leader must resign.
    #[error("fatal store failure: {0}")]
    Fatal(String),
}

impl From<StoreError> for CoordinatorError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Transient(message) => CoordinatorError::StoreTransient(message),
            StoreError::Fatal(message) => CoordinatorError::StoreFatal(message),
        }
    }
}

/// A change tick observed under the cluster root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreChange {
    Datastreams,
    Instances,
    TargetAssignment,
    /// A connector signalled that source partitions changed.
    Partitions,
}

/// The coordination-store surface the rebalance engine depends on.
///
/// The real client (a ZooKeeper-like hierarchical store) lives outside
/// this crate; [`MemoryStore`] implements the same contract in process
/// for tests and single-node deployments. The commit operation applies
/// the assignment, the tombstones and the consumed move requests as one
/// logical transaction: either everything becomes visible or nothing does.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// A counter that increases whenever anything under the cluster root
    /// changes. Two equal reads bracket a consistent snapshot.
    async fn epoch(&self) -> StoreResult<u64>;

    async fn live_instances(&self) -> StoreResult<Vec<String>>;

    async fn datastreams(&self) -> StoreResult<Vec<Datastream>>;

    async fn assignment(&self) -> StoreResult<Assignment>;

    /// Pending operator move requests, keyed by group task prefix.
    /// When a group has several queued requests the newest wins.
    async fn target_assignments(&self) -> StoreResult<BTreeMap<String, TargetAssignment>>;

    /// Persist a committed assignment: write the task records under their
    /// instances, delete the tombstoned predecessor nodes, and consume the
    /// satisfied move requests. Task creations are idempotent (keyed by
    /// task name) so a replay after a partial failure is safe.
    async fn commit(
        &self,
        assignment: &Assignment,
        tombstones: &BTreeMap<String, Vec<String>>,
        consumed_targets: &[String],
    ) -> StoreResult<()>;

    /// Join the leader election with an ephemeral sequential node.
    /// The returned watch yields `true` while this instance is the leader.
    async fn join_election(&self, instance: &str) -> StoreResult<watch::Receiver<bool>>;

    /// Leave the election, relinquishing leadership if held.
    async fn resign(&self, instance: &str) -> StoreResult<()>;

    /// Subscribe to change ticks under the cluster root.
    fn subscribe(&self) -> broadcast::Receiver<StoreChange>;
}
