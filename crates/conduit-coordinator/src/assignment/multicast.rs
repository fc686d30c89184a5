use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, info};
use rand::RngCore;

use crate::assignment::Assignment;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::group::DatastreamGroup;
use crate::id::TaskName;
use crate::roster::InstanceRoster;
use crate::task::TaskDescriptor;

/// Produces the target number of tasks per datastream group and places
/// them across the live instances with as few task mutations as possible.
///
/// Tasks whose owner is alive and still holds the task lock anchor the
/// assignment; everything else is recomputed around them. The strategy
/// never mutates a task record it received: a task that has to change
/// instances is superseded by a freshly minted successor that lists the
/// original as a dependency.
#[derive(Debug, Clone)]
pub struct StickyMulticastStrategy {
    /// The task count for a group without its own override.
    /// Zero means one task per live instance.
    max_tasks: usize,
    imbalance_threshold: usize,
}

impl StickyMulticastStrategy {
    pub fn new(max_tasks: usize, imbalance_threshold: usize) -> Self {
        Self {
            max_tasks,
            // A threshold below one cannot converge.
            imbalance_threshold: imbalance_threshold.max(1),
        }
    }

    /// Compute a fresh assignment for all groups across the live instances.
    /// Tasks of groups absent from `groups` are dropped from the result.
    pub fn assign(
        &self,
        groups: &[DatastreamGroup],
        roster: &InstanceRoster,
        current: &Assignment,
        rng: &mut dyn RngCore,
    ) -> CoordinatorResult<Assignment> {
        if roster.is_empty() {
            return Err(CoordinatorError::invalid(
                "cannot compute an assignment without live instances",
            ));
        }
        let mut next = Assignment::new();
        for instance in roster.iter() {
            next.add_instance(instance);
        }
        for group in groups {
            self.assign_group(group, roster, current, &mut next, rng)?;
        }
        Ok(next)
    }

    fn assign_group(
        &self,
        group: &DatastreamGroup,
        roster: &InstanceRoster,
        current: &Assignment,
        next: &mut Assignment,
        rng: &mut dyn RngCore,
    ) -> CoordinatorResult<()> {
        let prefix = group.task_prefix();
        let num_tasks = group.max_tasks().unwrap_or(if self.max_tasks == 0 {
            roster.len()
        } else {
            self.max_tasks
        });
        // Tasks of a partition-managed group may co-reside on an instance,
        // so the requested count is not capped by the roster size.
        let target = if group.is_partition_managed() {
            num_tasks.max(1)
        } else {
            num_tasks.clamp(1, roster.len())
        };

        let mut placed: BTreeMap<&str, Vec<Arc<TaskDescriptor>>> = BTreeMap::new();
        for instance in roster.iter() {
            placed.insert(instance, vec![]);
        }
        let mut kept = 0;
        for (instance, task) in current.group_tasks(prefix) {
            if roster.contains(instance) && task.is_locked_by(instance) {
                if let Some(tasks) = placed.get_mut(instance) {
                    tasks.push(Arc::clone(task));
                    kept += 1;
                }
            } else {
                debug!(
                    "task {} of group {prefix} is orphaned (owner {instance} gone or lock lost)",
                    task.name()
                );
            }
        }

        while kept > target {
            let Some(instance) = most_loaded(&placed) else {
                break;
            };
            if let Some(tasks) = placed.get_mut(instance) {
                if let Some(task) = tasks.pop() {
                    info!("dropping surplus task {} of group {prefix}", task.name());
                }
            }
            kept -= 1;
        }

        while kept < target {
            let Some(instance) = least_loaded(&placed) else {
                return Err(CoordinatorError::Internal(format!(
                    "no eligible instance to place a task of group {prefix}"
                )));
            };
            let task = Arc::new(TaskDescriptor::new(TaskName::mint(prefix, rng)));
            debug!("creating task {} of group {prefix} on {instance}", task.name());
            if let Some(tasks) = placed.get_mut(instance) {
                tasks.push(Arc::clone(&task));
            }
            kept += 1;
        }

        loop {
            let (Some(heavy), Some(light)) = (most_loaded(&placed), least_loaded(&placed)) else {
                break;
            };
            let spread = placed[heavy].len() - placed[light].len();
            if spread <= self.imbalance_threshold {
                break;
            }
            let Some(task) = placed.get_mut(heavy).and_then(Vec::pop) else {
                break;
            };
            let successor = task.successor(task.partitions().to_vec(), rng)?;
            info!(
                "rebalancing group {prefix}: task {} on {heavy} superseded by {} on {light}",
                task.name(),
                successor.name()
            );
            if let Some(tasks) = placed.get_mut(light) {
                tasks.push(Arc::new(successor));
            }
        }

        for (instance, tasks) in placed {
            for task in tasks {
                next.insert(instance, task);
            }
        }
        Ok(())
    }
}

/// The instance carrying the most tasks; ties resolve to the first in
/// name order.
fn most_loaded<'a>(placed: &BTreeMap<&'a str, Vec<Arc<TaskDescriptor>>>) -> Option<&'a str> {
    let mut result: Option<(&'a str, usize)> = None;
    for (&instance, tasks) in placed {
        if result.is_none_or(|(_, len)| tasks.len() > len) {
            result = Some((instance, tasks.len()));
        }
    }
    result.map(|(instance, _)| instance)
}

/// The instance carrying the fewest tasks; ties resolve to the first in
/// name order.
fn least_loaded<'a>(placed: &BTreeMap<&'a str, Vec<Arc<TaskDescriptor>>>) -> Option<&'a str> {
    let mut result: Option<(&'a str, usize)> = None;
    for (&instance, tasks) in placed {
        if result.is_none_or(|(_, len)| tasks.len() < len) {
            result = Some((instance, tasks.len()));
        }
    }
    result.map(|(instance, _)| instance)
}
