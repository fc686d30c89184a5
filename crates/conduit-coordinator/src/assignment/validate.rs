use std::collections::BTreeSet;

use crate::assignment::Assignment;
use crate::error::AssignmentError;
use crate::partition::GroupPartitions;

/// Verify the partition invariants of a candidate assignment before it is
/// returned to the orchestrator: every snapshot partition is covered
/// exactly once and no task exceeds the partition cap. A failure aborts
/// the rebalance; nothing is persisted.
pub(crate) fn verify_partition_coverage(
    assignment: &Assignment,
    metadata: &GroupPartitions,
    max_partitions_per_task: usize,
) -> Result<(), AssignmentError> {
    let group = metadata.task_prefix();
    let mut assigned_total = 0;
    let mut covered: BTreeSet<&str> = BTreeSet::new();
    for (_, task) in assignment.group_tasks(group) {
        assigned_total += task.partitions().len();
        for partition in task.partitions() {
            covered.insert(partition.as_str());
        }
        if max_partitions_per_task > 0 && task.partitions().len() > max_partitions_per_task {
            return Err(AssignmentError::PartitionCapExceeded {
                group: group.to_string(),
                task: task.name().to_string(),
                count: task.partitions().len(),
                cap: max_partitions_per_task,
            });
        }
    }

    let missing: Vec<String> = metadata
        .partitions()
        .iter()
        .filter(|p| !covered.contains(p.as_str()))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(AssignmentError::Coverage {
            group: group.to_string(),
            missing,
        });
    }
    if assigned_total != metadata.len() {
        return Err(AssignmentError::CountMismatch {
            group: group.to_string(),
            assigned: assigned_total,
            expected: metadata.len(),
        });
    }
    Ok(())
}
