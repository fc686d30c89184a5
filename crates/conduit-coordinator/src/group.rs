use serde::{Deserialize, Serialize};

use crate::datastream::Datastream;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::task::TaskDescriptor;

/// A non-empty collection of datastreams sharing a task prefix.
/// The group is the unit at which the assignment strategies operate and
/// is uniquely identified by its task prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatastreamGroup {
    task_prefix: String,
    datastreams: Vec<Datastream>,
}

impl DatastreamGroup {
    pub fn try_new(datastreams: Vec<Datastream>) -> CoordinatorResult<Self> {
        let Some(first) = datastreams.first() else {
            return Err(CoordinatorError::invalid(
                "a datastream group must contain at least one datastream",
            ));
        };
        let task_prefix = first.task_prefix().to_string();
        for ds in &datastreams {
            if ds.task_prefix() != task_prefix {
                return Err(CoordinatorError::invalid(format!(
                    "datastream {} has task prefix {} but the group uses {task_prefix}",
                    ds.name,
                    ds.task_prefix(),
                )));
            }
        }
        Ok(Self {
            task_prefix,
            datastreams,
        })
    }

    pub fn task_prefix(&self) -> &str {
        &self.task_prefix
    }

    pub fn datastreams(&self) -> &[Datastream] {
        &self.datastreams
    }

    pub fn connector_name(&self) -> &str {
        &self.datastreams[0].connector_name
    }

    /// Whether the task belongs to this group.
    pub fn owns(&self, task: &TaskDescriptor) -> bool {
        task.task_prefix() == self.task_prefix
    }

    /// The task-count override for the group: the largest `system.maxTasks`
    /// metadata value across its members, if any carries one.
    pub fn max_tasks(&self) -> Option<usize> {
        self.datastreams.iter().filter_map(|ds| ds.max_tasks()).max()
    }

    /// A group is partition-managed when any member opts in; its tasks may
    /// then co-reside on an instance.
    pub fn is_partition_managed(&self) -> bool {
        self.datastreams.iter().any(|ds| ds.is_partition_managed())
    }
}
