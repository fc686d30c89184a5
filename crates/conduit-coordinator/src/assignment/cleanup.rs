use std::collections::{BTreeMap, BTreeSet};

use log::debug;

use crate::assignment::Assignment;
use crate::group::DatastreamGroup;

/// Plans the removal of predecessor tasks after a committed rebalance.
///
/// A task name is safe to remove from the store once a task in the
/// committed assignment lists it as a dependency and no assigned task
/// carries the name anymore: the successor is active and the predecessor
/// is only a leftover store node. This also recovers intermediate tasks
/// left behind by a leader that crashed mid-commit.
#[derive(Debug, Default)]
pub struct CleanupPlanner;

impl CleanupPlanner {
    pub fn new() -> Self {
        Self
    }

    /// The predecessor task names whose removal is safe, keyed by the
    /// instance owning the successor, which is where the store keeps the
    /// predecessor's node.
    pub fn plan(
        &self,
        groups: &[DatastreamGroup],
        assignment: &Assignment,
    ) -> BTreeMap<String, Vec<String>> {
        let prefixes: BTreeSet<&str> = groups.iter().map(DatastreamGroup::task_prefix).collect();
        let assigned_names: BTreeSet<String> = assignment
            .all_tasks()
            .map(|(_, task)| task.name().to_string())
            .collect();

        let mut removable: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (instance, tasks) in assignment.iter() {
            let mut seen: BTreeSet<&str> = BTreeSet::new();
            for task in tasks {
                if !prefixes.contains(task.task_prefix()) {
                    continue;
                }
                for dependency in task.dependencies() {
                    if assigned_names.contains(dependency) {
                        debug!(
                            "predecessor {dependency} of task {} is still assigned; deferring cleanup",
                            task.name()
                        );
                        continue;
                    }
                    if seen.insert(dependency) {
                        removable
                            .entry(instance.to_string())
                            .or_default()
                            .push(dependency.clone());
                    }
                }
            }
        }
        removable
    }
}
