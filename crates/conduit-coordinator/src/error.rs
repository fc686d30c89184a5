use thiserror::Error;

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Assignment(#[from] AssignmentError),
    #[error(transparent)]
    InvalidConnectionString(#[from] conduit_kafka::KafkaError),
    #[error("transient store failure: {0}")]
    StoreTransient(String),
    #[error("fatal store failure: {0}")]
    StoreFatal(String),
    #[error("leadership lost")]
    LeadershipLost,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoordinatorError {
    pub fn invalid(message: impl Into<String>) -> Self {
        CoordinatorError::InvalidArgument(message.into())
    }

    /// Whether a retry of the rebalance cycle can recover from this error.
    /// Strategy errors and transient store failures are retried in place;
    /// fatal store failures relinquish leadership first.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            CoordinatorError::StoreFatal(_) | CoordinatorError::LeadershipLost
        )
    }
}

/// Failures of the assignment strategies. Every variant carries the
/// datastream group (and the task or partitions involved) for diagnosis.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AssignmentError {
    #[error("no tasks assigned for datastream group {group}")]
    NoTasks { group: String },
    #[error("task {task} of datastream group {group} is not locked by its owner")]
    UnlockedTask { group: String, task: String },
    #[error("no task is available for datastream group {group} on target instance {instance}")]
    NoTargetTask { group: String, instance: String },
    #[error(
        "task {task} of datastream group {group} carries {count} partitions, \
         which exceeds the cap of {cap}"
    )]
    PartitionCapExceeded {
        group: String,
        task: String,
        count: usize,
        cap: usize,
    },
    #[error("datastream group {group} is missing partitions after assignment: {missing:?}")]
    Coverage { group: String, missing: Vec<String> },
    #[error(
        "datastream group {group} has {assigned} assigned partitions \
         but the snapshot has {expected}"
    )]
    CountMismatch {
        group: String,
        assigned: usize,
        expected: usize,
    },
}
