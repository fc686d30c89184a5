mod cleanup;
mod multicast;
mod partition;
mod validate;

pub use cleanup::CleanupPlanner;
pub use multicast::StickyMulticastStrategy;
pub use partition::{StickyPartitionStrategy, TargetAssignment};

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::id::TaskName;
use crate::task::TaskDescriptor;

/// A committed mapping from instance name to the tasks it owns.
///
/// The mapping is copy-on-write: a rebalance never mutates the assignment
/// it read; it builds a new one, reusing the task records that were kept
/// verbatim. Instances iterate in name order and each instance's task
/// list is kept sorted by task name, so any walk over the assignment is
/// deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    tasks: BTreeMap<String, Vec<Arc<TaskDescriptor>>>,
}

impl Assignment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instance with no tasks yet. Needed so that an idle
    /// instance still shows up in placement decisions.
    pub fn add_instance(&mut self, instance: impl Into<String>) {
        self.tasks.entry(instance.into()).or_default();
    }

    pub fn insert(&mut self, instance: impl Into<String>, task: Arc<TaskDescriptor>) {
        let tasks = self.tasks.entry(instance.into()).or_default();
        tasks.push(task);
        tasks.sort_by(|a, b| a.name().cmp(b.name()));
    }

    pub fn contains_instance(&self, instance: &str) -> bool {
        self.tasks.contains_key(instance)
    }

    pub fn instances(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    pub fn instance_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks_for(&self, instance: &str) -> &[Arc<TaskDescriptor>] {
        self.tasks.get(instance).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Arc<TaskDescriptor>])> {
        self.tasks.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn all_tasks(&self) -> impl Iterator<Item = (&str, &Arc<TaskDescriptor>)> {
        self.tasks
            .iter()
            .flat_map(|(instance, tasks)| tasks.iter().map(move |t| (instance.as_str(), t)))
    }

    /// The tasks of one group, in (instance, task name) order.
    pub fn group_tasks<'a>(
        &'a self,
        task_prefix: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a Arc<TaskDescriptor>)> + 'a {
        self.all_tasks()
            .filter(move |(_, t)| t.task_prefix() == task_prefix)
    }

    pub fn group_task_count(&self, task_prefix: &str) -> usize {
        self.group_tasks(task_prefix).count()
    }

    pub fn find_task(&self, name: &TaskName) -> Option<(&str, &Arc<TaskDescriptor>)> {
        self.all_tasks().find(|(_, t)| t.name() == name)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.values().map(Vec::len).sum()
    }
}
