use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::assignment::validate::verify_partition_coverage;
use crate::assignment::{Assignment, StickyMulticastStrategy};
use crate::error::{AssignmentError, CoordinatorResult};
use crate::partition::GroupPartitions;
use crate::task::TaskDescriptor;

/// An operator-supplied request to relocate specific partitions onto
/// specific instances.
pub type TargetAssignment = BTreeMap<String, BTreeSet<String>>;

/// Distributes the partitions of a datastream group across the group's
/// tasks, and executes operator-directed partition moves.
///
/// The strategy is sticky: a task whose partition set is unchanged is kept
/// verbatim, and the total task count never changes across a partition
/// rebalance. Task creation and placement are delegated to the held
/// [`StickyMulticastStrategy`], which runs only when the task structure
/// itself has to change.
#[derive(Debug, Clone)]
pub struct StickyPartitionStrategy {
    multicast: StickyMulticastStrategy,
    /// Zero means unbounded.
    max_partitions_per_task: usize,
}

impl StickyPartitionStrategy {
    pub fn new(multicast: StickyMulticastStrategy, max_partitions_per_task: usize) -> Self {
        Self {
            multicast,
            max_partitions_per_task,
        }
    }

    pub fn multicast(&self) -> &StickyMulticastStrategy {
        &self.multicast
    }

    /// Fold the current partition-to-task mapping forward onto a new
    /// partition snapshot.
    ///
    /// Partitions that disappeared from the snapshot are dropped, new ones
    /// are spread over the tasks up to a per-task allowance, and only the
    /// tasks whose partition set actually changed are superseded. The
    /// unassigned partitions are shuffled with an RNG seeded from the
    /// snapshot content, so the outcome is reproducible for a given input.
    pub fn assign_partitions(
        &self,
        current: &Assignment,
        metadata: &GroupPartitions,
    ) -> CoordinatorResult<Assignment> {
        let group = metadata.task_prefix();
        let mut total_tasks = 0;
        let mut assigned: BTreeSet<&str> = BTreeSet::new();
        for (instance, task) in current.group_tasks(group) {
            if !task.is_locked_by(instance) {
                return Err(AssignmentError::UnlockedTask {
                    group: group.to_string(),
                    task: task.name().to_string(),
                }
                .into());
            }
            total_tasks += 1;
            assigned.extend(task.partitions().iter().map(String::as_str));
        }
        if total_tasks == 0 {
            return Err(AssignmentError::NoTasks {
                group: group.to_string(),
            }
            .into());
        }

        let mut unassigned: Vec<String> = metadata
            .partitions()
            .iter()
            .filter(|p| !assigned.contains(p.as_str()))
            .cloned()
            .collect();
        let base = metadata.len() / total_tasks;
        let mut remainder = metadata.len() % total_tasks;
        debug!(
            "group {group}: {total_tasks} tasks, {} partitions, base allowance {base}, remainder {remainder}",
            metadata.len()
        );

        let mut rng = StdRng::seed_from_u64(metadata.shuffle_seed());
        // Spread newly observed partitions over all tasks instead of
        // packing them onto the first tasks iterated.
        unassigned.shuffle(&mut rng);

        let mut next = Assignment::new();
        let mut mutated = 0;
        for (instance, tasks) in current.iter() {
            next.add_instance(instance);
            for task in tasks {
                if task.task_prefix() != group {
                    next.insert(instance, Arc::clone(task));
                    continue;
                }
                let mut partitions: Vec<String> = task
                    .partitions()
                    .iter()
                    .filter(|p| metadata.contains(p))
                    .cloned()
                    .collect();
                let mut changed = partitions.len() != task.partitions().len();
                let allowed = if remainder > 0 { base + 1 } else { base };
                while partitions.len() < allowed {
                    let Some(partition) = unassigned.pop() else {
                        break;
                    };
                    partitions.push(partition);
                    changed = true;
                }
                if remainder > 0 {
                    remainder -= 1;
                }
                if self.max_partitions_per_task > 0
                    && partitions.len() > self.max_partitions_per_task
                {
                    return Err(AssignmentError::PartitionCapExceeded {
                        group: group.to_string(),
                        task: task.name().to_string(),
                        count: partitions.len(),
                        cap: self.max_partitions_per_task,
                    }
                    .into());
                }
                if changed {
                    let successor = task.successor(partitions, &mut rng)?;
                    debug!(
                        "group {group}: task {} superseded by {}",
                        task.name(),
                        successor.name()
                    );
                    next.insert(instance, Arc::new(successor));
                    mutated += 1;
                } else {
                    next.insert(instance, Arc::clone(task));
                }
            }
        }

        verify_partition_coverage(&next, metadata, self.max_partitions_per_task)?;
        info!(
            "group {group}: distributed {} partitions over {total_tasks} tasks, {mutated} mutated",
            metadata.len()
        );
        Ok(next)
    }

    /// Apply an operator-directed partition move as one atomic rebalance.
    ///
    /// The move is best-effort: partitions absent from the snapshot, not
    /// owned by any task of the group, or already on the requested
    /// instance are dropped from the request. Every mutated task is
    /// superseded by a successor that records both the task it replaces
    /// and the source task of every partition it gained, which defers the
    /// sources' retirement until the moved partitions are safely owned.
    pub fn move_partitions(
        &self,
        current: &Assignment,
        target: &TargetAssignment,
        metadata: &GroupPartitions,
    ) -> CoordinatorResult<Assignment> {
        let group = metadata.task_prefix();
        for (instance, task) in current.group_tasks(group) {
            if !task.is_locked_by(instance) {
                return Err(AssignmentError::UnlockedTask {
                    group: group.to_string(),
                    task: task.name().to_string(),
                }
                .into());
            }
        }

        let mut to_reassign: BTreeSet<String> = target
            .values()
            .flatten()
            .filter(|p| metadata.contains(p))
            .cloned()
            .collect();
        for partition in target.values().flatten() {
            if !metadata.contains(partition) {
                warn!("group {group}: requested partition {partition} is not in the snapshot");
            }
        }

        // The tasks that have partitions to release, and the owning task of
        // every partition with a confirmed source.
        let mut confirmed: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut partition_source: BTreeMap<String, String> = BTreeMap::new();
        let mut processed_target: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();

        for (instance, _) in current.iter() {
            let owned: BTreeSet<&str> = current
                .tasks_for(instance)
                .iter()
                .filter(|t| t.task_prefix() == group)
                .flat_map(|t| t.partitions().iter().map(String::as_str))
                .collect();
            if let Some(requested) = target.get(instance) {
                // A partition requested onto the instance that already owns
                // it is a no-op; it must not be reassigned anywhere.
                let no_op: Vec<&String> = requested
                    .iter()
                    .filter(|p| owned.contains(p.as_str()))
                    .collect();
                let updated: BTreeSet<String> = requested
                    .iter()
                    .filter(|p| !owned.contains(p.as_str()) && to_reassign.contains(p.as_str()))
                    .cloned()
                    .collect();
                for partition in no_op {
                    debug!("group {group}: partition {partition} is already on {instance}");
                    to_reassign.remove(partition);
                }
                if !updated.is_empty() {
                    processed_target.insert(instance, updated);
                }
            }
            for task in current.tasks_for(instance) {
                if task.task_prefix() != group {
                    continue;
                }
                let releasable: BTreeSet<String> = task
                    .partitions()
                    .iter()
                    .filter(|p| to_reassign.contains(p.as_str()))
                    .cloned()
                    .collect();
                if !releasable.is_empty() {
                    for partition in &releasable {
                        partition_source.insert(partition.clone(), task.name().to_string());
                    }
                    confirmed.insert(task.name().to_string(), releasable);
                }
            }
        }
        debug!("group {group}: processed move target {processed_target:?}");

        let to_release: BTreeSet<&str> = confirmed
            .values()
            .flatten()
            .map(String::as_str)
            .collect();

        let mut rng = StdRng::seed_from_u64(metadata.shuffle_seed());
        let mut next = Assignment::new();
        for (instance, tasks) in current.iter() {
            next.add_instance(instance);
            // Only partitions with a confirmed source may land here.
            let to_add: Vec<String> = processed_target
                .get(instance)
                .map(|requested| {
                    requested
                        .iter()
                        .filter(|p| to_release.contains(p.as_str()))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            let group_tasks: Vec<&Arc<TaskDescriptor>> = tasks
                .iter()
                .filter(|t| t.task_prefix() == group)
                .collect();
            if !to_add.is_empty() && group_tasks.is_empty() {
                return Err(AssignmentError::NoTargetTask {
                    group: group.to_string(),
                    instance: instance.to_string(),
                }
                .into());
            }
            // The task with the fewest partitions takes the moved ones;
            // the name-sorted task order breaks ties.
            let receiver = if to_add.is_empty() {
                None
            } else {
                group_tasks
                    .iter()
                    .copied()
                    .reduce(|a, b| {
                        if b.partitions().len() < a.partitions().len() {
                            b
                        } else {
                            a
                        }
                    })
                    .map(|t| t.name().clone())
            };

            for task in tasks {
                if task.task_prefix() != group {
                    next.insert(instance, Arc::clone(task));
                    continue;
                }
                let mut changed = false;
                let mut partitions = task.partitions().to_vec();
                let mut extra_dependencies: Vec<String> = vec![];
                if confirmed.contains_key(&task.name().to_string()) {
                    partitions.retain(|p| !to_release.contains(p.as_str()));
                    changed = true;
                }
                if receiver.as_ref() == Some(task.name()) {
                    for partition in &to_add {
                        partitions.push(partition.clone());
                        if let Some(source) = partition_source.get(partition) {
                            extra_dependencies.push(source.clone());
                        }
                    }
                    changed = true;
                }
                if changed {
                    let mut successor = task.successor(partitions, &mut rng)?;
                    for dependency in extra_dependencies {
                        successor.add_dependency(dependency);
                    }
                    info!(
                        "group {group}: task {} superseded by {} on {instance} for partition move",
                        task.name(),
                        successor.name()
                    );
                    next.insert(instance, Arc::new(successor));
                } else {
                    next.insert(instance, Arc::clone(task));
                }
            }
        }

        verify_partition_coverage(&next, metadata, self.max_partitions_per_task)?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignment::tests::seeded_assignment;
    use crate::error::CoordinatorError;

    fn strategy() -> StickyPartitionStrategy {
        StickyPartitionStrategy::new(StickyMulticastStrategy::new(0, 1), 0)
    }

    fn snapshot(partitions: &[&str]) -> GroupPartitions {
        GroupPartitions::new("ds", partitions.iter().map(|p| p.to_string()))
    }

    /// Emulate every instance acquiring the lock on its newly assigned
    /// tasks, which live workers do between two rebalance cycles.
    fn relock(assignment: &Assignment) -> Assignment {
        let mut relocked = Assignment::new();
        for (instance, tasks) in assignment.iter() {
            relocked.add_instance(instance);
            for task in tasks {
                relocked.insert(
                    instance,
                    Arc::new((**task).clone().with_lock_owner(instance)),
                );
            }
        }
        relocked
    }

    fn partitions_of(assignment: &Assignment, instance: &str) -> BTreeSet<String> {
        assignment
            .tasks_for(instance)
            .iter()
            .flat_map(|t| t.partitions().iter().cloned())
            .collect()
    }

    fn all_partitions(assignment: &Assignment) -> Vec<String> {
        assignment
            .all_tasks()
            .flat_map(|(_, t)| t.partitions().iter().cloned())
            .collect()
    }

    #[test]
    fn test_spread_across_all_tasks() {
        let assignment = seeded_assignment("ds", 1, 3, true);
        let metadata = snapshot(&["t-0", "t-1", "t1-0"]);
        let next = strategy().assign_partitions(&assignment, &metadata).unwrap();
        for task in next.tasks_for("instance0") {
            assert_eq!(task.partitions().len(), 1);
        }
        let union: BTreeSet<_> = all_partitions(&next).into_iter().collect();
        assert_eq!(union.len(), 3);
    }

    #[test]
    fn test_added_partitions_are_spread() {
        let assignment = seeded_assignment("ds", 1, 3, true);
        let first = strategy()
            .assign_partitions(&assignment, &snapshot(&["t-0", "t-1", "t1-0"]))
            .unwrap();
        let grown = snapshot(&["t-0", "t-1", "t1-0", "t2-0", "t2-1", "t2-2"]);
        let next = strategy()
            .assign_partitions(&relock(&first), &grown)
            .unwrap();
        for task in next.tasks_for("instance0") {
            assert_eq!(task.partitions().len(), 2);
        }
        assert_eq!(next.task_count(), first.task_count());
    }

    #[test]
    fn test_removed_partitions_are_dropped() {
        let assignment = seeded_assignment("ds", 3, 1, true);
        let first = strategy()
            .assign_partitions(
                &assignment,
                &snapshot(&["t-0", "t-1", "t-2", "t-3", "t-4", "t-5", "t-6"]),
            )
            .unwrap();
        let shrunk = snapshot(&["t-1", "t-3", "t-4", "t-6"]);
        let next = strategy().assign_partitions(&relock(&first), &shrunk).unwrap();
        let union: BTreeSet<_> = all_partitions(&next).into_iter().collect();
        let expected: BTreeSet<_> = ["t-1", "t-3", "t-4", "t-6"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(union, expected);
        assert_eq!(next.task_count(), 3);
    }

    #[test]
    fn test_empty_snapshot_empties_every_task() {
        let assignment = seeded_assignment("ds", 1, 3, true);
        let first = strategy()
            .assign_partitions(&assignment, &snapshot(&["t-0", "t-1"]))
            .unwrap();
        let next = strategy()
            .assign_partitions(&relock(&first), &snapshot(&[]))
            .unwrap();
        assert_eq!(next.task_count(), 3);
        assert!(all_partitions(&next).is_empty());
    }

    #[test]
    fn test_unchanged_tasks_are_kept_verbatim() {
        let assignment = seeded_assignment("ds", 1, 3, true);
        let metadata = snapshot(&["t-0", "t-1", "t1-0"]);
        let first = strategy().assign_partitions(&assignment, &metadata).unwrap();
        let relocked = relock(&first);
        let next = strategy().assign_partitions(&relocked, &metadata).unwrap();
        // Nothing changed, so every task record is reused as-is.
        assert_eq!(next, relocked);
    }

    #[test]
    fn test_assignment_is_deterministic_for_a_snapshot() {
        let assignment = seeded_assignment("ds", 2, 2, true);
        let metadata = snapshot(&["t-0", "t-1", "t-2", "t-3", "t-4"]);
        let a = strategy().assign_partitions(&assignment, &metadata).unwrap();
        let b = strategy().assign_partitions(&assignment, &metadata).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_no_tasks_is_an_error() {
        let mut assignment = Assignment::new();
        assignment.add_instance("instance0");
        let result = strategy().assign_partitions(&assignment, &snapshot(&["t-0"]));
        assert!(matches!(
            result,
            Err(CoordinatorError::Assignment(AssignmentError::NoTasks { .. }))
        ));
    }

    #[test]
    fn test_unlocked_task_blocks_rebalance() {
        let locked = seeded_assignment("ds", 1, 3, true);
        let mut assignment = Assignment::new();
        for (instance, tasks) in locked.iter() {
            assignment.add_instance(instance);
            for (i, task) in tasks.iter().enumerate() {
                if i == 0 {
                    // Drop the lock on one task.
                    assignment.insert(instance, Arc::new((**task).clone().without_lock()));
                } else {
                    assignment.insert(instance, Arc::clone(task));
                }
            }
        }
        let result = strategy().assign_partitions(&assignment, &snapshot(&["t-0"]));
        assert!(matches!(
            result,
            Err(CoordinatorError::Assignment(AssignmentError::UnlockedTask { .. }))
        ));
    }

    #[test]
    fn test_partition_cap_is_enforced() {
        let capped = StickyPartitionStrategy::new(StickyMulticastStrategy::new(0, 1), 2);
        let assignment = seeded_assignment("ds", 1, 1, true);
        let result = capped.assign_partitions(&assignment, &snapshot(&["t-0", "t-1", "t-2"]));
        assert!(matches!(
            result,
            Err(CoordinatorError::Assignment(
                AssignmentError::PartitionCapExceeded { count: 3, cap: 2, .. }
            ))
        ));
    }

    #[test]
    fn test_move_partitions() {
        let assignment = seeded_assignment("ds", 3, 2, true);
        let metadata = snapshot(&["t-0", "t-1", "t-2", "t-3", "t-4"]);
        let first = strategy().assign_partitions(&assignment, &metadata).unwrap();

        let mut target = TargetAssignment::new();
        target.insert(
            "instance2".to_string(),
            ["t-3", "t-2", "t-1", "t-5"].into_iter().map(String::from).collect(),
        );
        target.insert(
            "instance1".to_string(),
            ["t-0"].into_iter().map(String::from).collect(),
        );

        let next = strategy()
            .move_partitions(&relock(&first), &target, &metadata)
            .unwrap();

        let on_instance2 = partitions_of(&next, "instance2");
        assert!(on_instance2.contains("t-1"));
        assert!(on_instance2.contains("t-2"));
        assert!(on_instance2.contains("t-3"));
        // t-5 is not in the snapshot and is ignored.
        assert_eq!(all_partitions(&next).len(), 5);
        assert_eq!(next.task_count(), first.task_count());
    }

    #[test]
    fn test_move_to_instance_without_task_fails() {
        let assignment = seeded_assignment("ds", 3, 2, true);
        let metadata = snapshot(&["t-0", "t-1", "t-2", "t-3", "t-4"]);
        let first = strategy().assign_partitions(&assignment, &metadata).unwrap();
        let mut relocked = relock(&first);
        relocked.add_instance("empty");

        let mut target = TargetAssignment::new();
        target.insert(
            "empty".to_string(),
            ["t-3", "t-2", "t-1"].into_iter().map(String::from).collect(),
        );

        let result = strategy().move_partitions(&relocked, &target, &metadata);
        assert!(matches!(
            result,
            Err(CoordinatorError::Assignment(AssignmentError::NoTargetTask {
                ref instance, ..
            })) if instance == "empty"
        ));
    }

    #[test]
    fn test_move_is_idempotent() {
        let assignment = seeded_assignment("ds", 2, 1, true);
        let metadata = snapshot(&["t-0", "t-1", "t-2", "t-3"]);
        let first = strategy().assign_partitions(&assignment, &metadata).unwrap();

        let mut target = TargetAssignment::new();
        target.insert(
            "instance0".to_string(),
            ["t-0", "t-1", "t-2"].into_iter().map(String::from).collect(),
        );

        let moved = strategy()
            .move_partitions(&relock(&first), &target, &metadata)
            .unwrap();
        let moved_again = strategy()
            .move_partitions(&relock(&moved), &target, &metadata)
            .unwrap();
        assert_eq!(relock(&moved), moved_again);
    }

    #[test]
    fn test_move_records_source_dependencies() {
        let assignment = seeded_assignment("ds", 2, 1, true);
        let metadata = snapshot(&["t-0", "t-1"]);
        let first = strategy().assign_partitions(&assignment, &metadata).unwrap();
        let relocked = relock(&first);

        // Move everything onto instance0.
        let mut target = TargetAssignment::new();
        target.insert(
            "instance0".to_string(),
            ["t-0", "t-1"].into_iter().map(String::from).collect(),
        );
        let next = strategy()
            .move_partitions(&relocked, &target, &metadata)
            .unwrap();

        let moved_partition: Vec<_> = partitions_of(&relocked, "instance1").into_iter().collect();
        assert_eq!(moved_partition.len(), 1);
        let source_task = relocked.tasks_for("instance1")[0].name().to_string();
        let receiver = &next.tasks_for("instance0")[0];
        assert_eq!(receiver.partitions().len(), 2);
        assert!(receiver.dependencies().contains(&source_task));
        // The old instance1 task released its partition.
        assert!(partitions_of(&next, "instance1").is_empty());
    }
}
