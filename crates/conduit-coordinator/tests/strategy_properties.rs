// Property-based tests for the assignment strategies.
//
// These generate random partition snapshots, cluster shapes and move
// requests to verify the invariants that must hold after any rebalance:
// exactly-once coverage, preserved task counts, minimal mutations and
// idempotent operator moves.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

use conduit_coordinator::assignment::{
    Assignment, StickyMulticastStrategy, StickyPartitionStrategy, TargetAssignment,
};
use conduit_coordinator::error::{AssignmentError, CoordinatorError};
use conduit_coordinator::id::TaskName;
use conduit_coordinator::partition::GroupPartitions;
use conduit_coordinator::task::TaskDescriptor;

const GROUP: &str = "stream";

fn strategy(cap: usize) -> StickyPartitionStrategy {
    StickyPartitionStrategy::new(StickyMulticastStrategy::new(0, 1), cap)
}

fn empty_assignment(instances: usize, tasks_per_instance: usize) -> Assignment {
    let mut rng = StdRng::seed_from_u64(0x1234);
    let mut assignment = Assignment::new();
    for i in 0..instances {
        let instance = format!("instance{i}");
        assignment.add_instance(&instance);
        for _ in 0..tasks_per_instance {
            let task = TaskDescriptor::new(TaskName::mint(GROUP, &mut rng))
                .with_lock_owner(&instance);
            assignment.insert(&instance, Arc::new(task));
        }
    }
    assignment
}

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

fn snapshot(indices: &BTreeSet<usize>) -> GroupPartitions {
    GroupPartitions::new(GROUP, indices.iter().map(|i| format!("p-{i}")))
}

fn occurrences(assignment: &Assignment) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for (_, task) in assignment.all_tasks() {
        for partition in task.partitions() {
            *counts.entry(partition.clone()).or_insert(0) += 1;
        }
    }
    counts
}

fn partition_sets(assignment: &Assignment) -> BTreeMap<String, BTreeSet<String>> {
    assignment
        .all_tasks()
        .map(|(_, task)| {
            (
                task.name().to_string(),
                task.partitions().iter().cloned().collect(),
            )
        })
        .collect()
}

proptest! {
    #[test]
    fn prop_every_partition_is_covered_exactly_once(
        instances in 1usize..4,
        tasks_per_instance in 1usize..4,
        initial in proptest::collection::btree_set(0usize..12, 0..12),
        grown in proptest::collection::btree_set(0usize..12, 0..12),
    ) {
        let strategy = strategy(0);
        let first = strategy
            .assign_partitions(&empty_assignment(instances, tasks_per_instance), &snapshot(&initial))
            .unwrap();
        let counts = occurrences(&first);
        for index in &initial {
            prop_assert_eq!(counts.get(&format!("p-{index}")), Some(&1));
        }
        prop_assert_eq!(counts.values().sum::<usize>(), initial.len());

        let next = strategy
            .assign_partitions(&relock(&first), &snapshot(&grown))
            .unwrap();
        let counts = occurrences(&next);
        for index in &grown {
            prop_assert_eq!(counts.get(&format!("p-{index}")), Some(&1));
        }
        prop_assert_eq!(counts.values().sum::<usize>(), grown.len());
    }

    #[test]
    fn prop_task_count_is_preserved(
        instances in 1usize..4,
        tasks_per_instance in 1usize..4,
        initial in proptest::collection::btree_set(0usize..12, 0..12),
        grown in proptest::collection::btree_set(0usize..12, 0..12),
    ) {
        let strategy = strategy(0);
        let first = strategy
            .assign_partitions(&empty_assignment(instances, tasks_per_instance), &snapshot(&initial))
            .unwrap();
        prop_assert_eq!(first.task_count(), instances * tasks_per_instance);
        let next = strategy
            .assign_partitions(&relock(&first), &snapshot(&grown))
            .unwrap();
        prop_assert_eq!(next.task_count(), first.task_count());
    }

    #[test]
    fn prop_only_changed_tasks_are_superseded(
        instances in 1usize..4,
        tasks_per_instance in 1usize..4,
        initial in proptest::collection::btree_set(0usize..12, 0..12),
        grown in proptest::collection::btree_set(0usize..12, 0..12),
    ) {
        let strategy = strategy(0);
        let first = strategy
            .assign_partitions(&empty_assignment(instances, tasks_per_instance), &snapshot(&initial))
            .unwrap();
        let before = relock(&first);
        let old_sets = partition_sets(&before);
        let next = strategy
            .assign_partitions(&before, &snapshot(&grown))
            .unwrap();

        for (_, task) in next.all_tasks() {
            let name = task.name().to_string();
            let new_set: BTreeSet<String> = task.partitions().iter().cloned().collect();
            match old_sets.get(&name) {
                // A task kept by name is kept verbatim.
                Some(old_set) => prop_assert_eq!(&new_set, old_set),
                // A renamed task must have actually changed: its partition
                // set differs from every predecessor it references.
                None => {
                    for dependency in task.dependencies() {
                        let old_set = old_sets.get(dependency).unwrap();
                        prop_assert_ne!(&new_set, old_set);
                    }
                }
            }
        }
    }

    #[test]
    fn prop_move_is_idempotent(
        instances in 1usize..4,
        tasks_per_instance in 1usize..4,
        partitions in proptest::collection::btree_set(0usize..12, 1..12),
        requested in proptest::collection::btree_set(0usize..14, 0..14),
        target_instance in 0usize..4,
    ) {
        let strategy = strategy(0);
        let first = strategy
            .assign_partitions(&empty_assignment(instances, tasks_per_instance), &snapshot(&partitions))
            .unwrap();

        let mut target = TargetAssignment::new();
        target.insert(
            format!("instance{}", target_instance % instances),
            requested.iter().map(|i| format!("p-{i}")).collect(),
        );

        let moved = strategy
            .move_partitions(&relock(&first), &target, &snapshot(&partitions))
            .unwrap();
        let again = strategy
            .move_partitions(&relock(&moved), &target, &snapshot(&partitions))
            .unwrap();
        prop_assert_eq!(again, relock(&moved));
    }

    #[test]
    fn prop_cap_violations_abort_without_output(
        tasks_per_instance in 1usize..3,
        partitions in proptest::collection::btree_set(0usize..12, 0..12),
        cap in 1usize..4,
    ) {
        let capped = strategy(cap);
        match capped.assign_partitions(&empty_assignment(1, tasks_per_instance), &snapshot(&partitions)) {
            Ok(assignment) => {
                for (_, task) in assignment.all_tasks() {
                    prop_assert!(task.partitions().len() <= cap);
                }
            }
            Err(CoordinatorError::Assignment(
                AssignmentError::PartitionCapExceeded { cap: reported, .. },
            )) => {
                prop_assert_eq!(reported, cap);
            }
            Err(other) => prop_assert!(false, "unexpected error: {other}"),
        }
    }
}
