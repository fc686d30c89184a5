use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::id::TaskName;

/// A unit of work produced by the assignment strategies.
///
/// A task is immutable once it has been committed: a rebalance that needs
/// to change its partition set replaces it with a freshly named successor
/// that records this task in its dependency set. The cleanup planner
/// retires the predecessor once the successor is observed active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDescriptor {
    name: TaskName,
    /// Source partitions assigned to this task, in assignment order.
    partitions: Vec<String>,
    /// Names of predecessor tasks whose lifetime overlaps this task's
    /// creation. Dependencies always point from successor to predecessor,
    /// so the edges form a DAG.
    #[serde(default)]
    dependencies: IndexSet<String>,
    /// The instance currently holding the task's ephemeral lock node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lock_owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<TaskStatus>,
}

impl TaskDescriptor {
    pub fn new(name: TaskName) -> Self {
        Self {
            name,
            partitions: vec![],
            dependencies: IndexSet::new(),
            lock_owner: None,
            status: None,
        }
    }

    /// Create the successor of this task with the given partition set.
    /// The successor carries a fresh name (next generation, new suffix),
    /// no lock, and this task as its sole dependency.
    pub fn successor(
        &self,
        partitions: Vec<String>,
        rng: &mut dyn RngCore,
    ) -> CoordinatorResult<Self> {
        let name = self.name.successor(rng)?;
        let mut dependencies = IndexSet::new();
        dependencies.insert(self.name.to_string());
        Ok(Self {
            name,
            partitions,
            dependencies,
            lock_owner: None,
            status: None,
        })
    }

    pub fn name(&self) -> &TaskName {
        &self.name
    }

    pub fn task_prefix(&self) -> &str {
        self.name.prefix()
    }

    pub fn partitions(&self) -> &[String] {
        &self.partitions
    }

    pub fn dependencies(&self) -> &IndexSet<String> {
        &self.dependencies
    }

    /// Record an additional predecessor, e.g. the source task of a moved
    /// partition. Only meaningful before the task is committed.
    pub fn add_dependency(&mut self, task_name: impl Into<String>) {
        let task_name = task_name.into();
        if task_name != self.name.to_string() {
            self.dependencies.insert(task_name);
        }
    }

    pub fn lock_owner(&self) -> Option<&str> {
        self.lock_owner.as_deref()
    }

    pub fn is_locked_by(&self, instance: &str) -> bool {
        self.lock_owner.as_deref() == Some(instance)
    }

    pub fn with_lock_owner(mut self, instance: impl Into<String>) -> Self {
        self.lock_owner = Some(instance.into());
        self
    }

    /// The same task record with the lock released, as observed after the
    /// owner's session expired.
    pub fn without_lock(mut self) -> Self {
        self.lock_owner = None;
        self
    }

    pub fn with_partitions(mut self, partitions: Vec<String>) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn status(&self) -> Option<&TaskStatus> {
        self.status.as_ref()
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatusCode {
    Ok,
    Error,
    Complete,
    Paused,
}

/// The last reported status of a task: a code, a human-readable message,
/// and where and when the report was written.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    code: TaskStatusCode,
    message: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    timestamp: DateTime<Utc>,
    host: String,
}

impl TaskStatus {
    pub fn try_new(code: TaskStatusCode, message: impl Into<String>) -> CoordinatorResult<Self> {
        let message = message.into();
        if !matches!(code, TaskStatusCode::Error) && message.trim().is_empty() {
            return Err(CoordinatorError::invalid(
                "a non-error task status requires a message",
            ));
        }
        Ok(Self {
            code,
            message,
            timestamp: Utc::now(),
            host: local_host_name(),
        })
    }

    pub fn ok() -> Self {
        Self {
            code: TaskStatusCode::Ok,
            message: "OK".to_string(),
            timestamp: Utc::now(),
            host: local_host_name(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: TaskStatusCode::Error,
            message: message.into(),
            timestamp: Utc::now(),
            host: local_host_name(),
        }
    }

    pub fn complete() -> Self {
        Self {
            code: TaskStatusCode::Complete,
            message: "Completed.".to_string(),
            timestamp: Utc::now(),
            host: local_host_name(),
        }
    }

    pub fn paused() -> Self {
        Self {
            code: TaskStatusCode::Paused,
            message: "Paused".to_string(),
            timestamp: Utc::now(),
            host: local_host_name(),
        }
    }

    pub fn code(&self) -> TaskStatusCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

/// Two status records are the same report when both the code and the
/// message match; the timestamp and host are bookkeeping.
impl PartialEq for TaskStatus {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code && self.message == other.message
    }
}

fn local_host_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn task(prefix: &str) -> TaskDescriptor {
        let mut rng = StdRng::seed_from_u64(1);
        TaskDescriptor::new(TaskName::mint(prefix, &mut rng))
    }

    #[test]
    fn test_successor_links_predecessor() {
        let mut rng = StdRng::seed_from_u64(2);
        let predecessor = task("events").with_partitions(vec!["t-0".to_string()]);
        let successor = predecessor
            .successor(vec!["t-0".to_string(), "t-1".to_string()], &mut rng)
            .unwrap();
        assert_eq!(successor.task_prefix(), "events");
        assert_ne!(successor.name(), predecessor.name());
        assert!(successor
            .dependencies()
            .contains(&predecessor.name().to_string()));
        assert!(successor.lock_owner().is_none());
    }

    #[test]
    fn test_add_dependency_ignores_self_reference() {
        let mut t = task("events");
        let own_name = t.name().to_string();
        t.add_dependency(own_name);
        assert!(t.dependencies().is_empty());
        t.add_dependency("events_0_cafef00d");
        assert_eq!(t.dependencies().len(), 1);
    }

    #[test]
    fn test_status_equality_ignores_timestamp_and_host() {
        let a = TaskStatus::ok();
        let mut b = TaskStatus::ok();
        b.timestamp = b.timestamp + chrono::Duration::seconds(30);
        b.host = "elsewhere".to_string();
        assert_eq!(a, b);
        assert_ne!(a, TaskStatus::error("boom"));
        assert_ne!(
            TaskStatus::try_new(TaskStatusCode::Ok, "one").unwrap(),
            TaskStatus::try_new(TaskStatusCode::Ok, "two").unwrap()
        );
    }

    #[test]
    fn test_non_error_status_requires_message() {
        assert!(TaskStatus::try_new(TaskStatusCode::Ok, "  ").is_err());
        assert!(TaskStatus::try_new(TaskStatusCode::Paused, "").is_err());
        assert!(TaskStatus::try_new(TaskStatusCode::Error, "").is_ok());
    }

    #[test]
    fn test_task_json_round_trip() {
        let mut rng = StdRng::seed_from_u64(3);
        let task = TaskDescriptor::new(TaskName::mint("events", &mut rng))
            .with_partitions(vec!["t-0".to_string(), "t-1".to_string()])
            .with_lock_owner("instance1")
            .with_status(TaskStatus::ok());
        let json = serde_json::to_string(&task).unwrap();
        let parsed: TaskDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, task);
        assert_eq!(parsed.partitions(), task.partitions());
        assert!(parsed.is_locked_by("instance1"));
    }
}
