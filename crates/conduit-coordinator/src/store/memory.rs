use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use log::debug;
use tokio::sync::{broadcast, watch};

use crate::assignment::{Assignment, TargetAssignment};
use crate::datastream::Datastream;
use crate::store::{
    ClusterPaths, CoordinationStore, StoreChange, StoreError, StoreResult,
};
use crate::task::TaskDescriptor;

const CHANGE_CHANNEL_SIZE: usize = 64;

/// An in-process coordination store holding the same path-addressed
/// layout a real deployment keeps in its hierarchical store.
///
/// Tests and single-node deployments drive the cluster through the
/// mutator methods (`add_live_instance`, `put_datastream`, ...), which
/// behave like external writers: they bump the epoch and emit change
/// ticks. One simplification: a committed task is locked by its owner
/// synchronously, where live workers acquire their locks asynchronously
/// after observing the assignment.
pub struct MemoryStore {
    paths: ClusterPaths,
    state: Mutex<StoreState>,
    changes: broadcast::Sender<StoreChange>,
}

#[derive(Default)]
struct StoreState {
    epoch: u64,
    /// Path-addressed nodes, value is the node payload (JSON or plain).
    nodes: BTreeMap<String, String>,
    /// Election entries in (sequence, instance) order; the first entry is
    /// the leader.
    election: Vec<(u64, String)>,
    next_sequence: u64,
    leader_watches: Vec<(String, watch::Sender<bool>)>,
}

impl StoreState {
    fn bump(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    fn refresh_leader(&mut self) {
        let leader = self.election.first().map(|(_, instance)| instance.clone());
        for (instance, sender) in &self.leader_watches {
            let _ = sender.send(leader.as_deref() == Some(instance));
        }
    }
}

impl MemoryStore {
    pub fn new(cluster: impl Into<String>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_SIZE);
        Self {
            paths: ClusterPaths::new(cluster),
            state: Mutex::new(StoreState::default()),
            changes,
        }
    }

    pub fn paths(&self) -> &ClusterPaths {
        &self.paths
    }

    fn lock_state(&self) -> StoreResult<std::sync::MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|_| StoreError::Fatal("store state is poisoned".to_string()))
    }

    fn notify(&self, change: StoreChange) {
        let _ = self.changes.send(change);
    }

    /// Register a live instance, as the instance itself would on startup.
    pub fn add_live_instance(&self, instance: &str, host: &str) -> StoreResult<()> {
        let mut state = self.lock_state()?;
        state
            .nodes
            .insert(self.paths.instance(instance), host.to_string());
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state
            .nodes
            .insert(self.paths.live_instance(sequence), instance.to_string());
        state.election.push((sequence, instance.to_string()));
        state.refresh_leader();
        state.bump();
        drop(state);
        self.notify(StoreChange::Instances);
        Ok(())
    }

    /// Expire an instance's session: its ephemeral live node and task
    /// locks vanish, and it drops out of the election.
    pub fn remove_live_instance(&self, instance: &str) -> StoreResult<()> {
        let mut state = self.lock_state()?;
        let live: Vec<String> = state
            .nodes
            .iter()
            .filter(|(path, value)| {
                path.starts_with(&format!("{}/", self.paths.live_instances()))
                    && value.as_str() == instance
            })
            .map(|(path, _)| path.clone())
            .collect();
        for path in live {
            state.nodes.remove(&path);
        }
        let assignments_prefix = format!("{}/", self.paths.instance_assignments(instance));
        let owned: Vec<String> = state
            .nodes
            .keys()
            .filter(|path| path.starts_with(&assignments_prefix))
            .cloned()
            .collect();
        for path in owned {
            let Some(payload) = state.nodes.get(&path).cloned() else {
                continue;
            };
            let Ok(task) = serde_json::from_str::<TaskDescriptor>(&payload) else {
                continue;
            };
            if let Ok(payload) = serde_json::to_string(&task.without_lock()) {
                state.nodes.insert(path, payload);
            }
        }
        state.election.retain(|(_, name)| name != instance);
        state.refresh_leader();
        state.bump();
        drop(state);
        self.notify(StoreChange::Instances);
        Ok(())
    }

    pub fn put_datastream(&self, datastream: &Datastream) -> StoreResult<()> {
        let payload = serde_json::to_string(datastream)
            .map_err(|e| StoreError::Fatal(e.to_string()))?;
        let mut state = self.lock_state()?;
        state
            .nodes
            .insert(self.paths.datastream(&datastream.name), payload);
        state.bump();
        drop(state);
        self.notify(StoreChange::Datastreams);
        Ok(())
    }

    pub fn remove_datastream(&self, name: &str) -> StoreResult<()> {
        let mut state = self.lock_state()?;
        state.nodes.remove(&self.paths.datastream(name));
        state.bump();
        drop(state);
        self.notify(StoreChange::Datastreams);
        Ok(())
    }

    /// Queue an operator move request for a group.
    pub fn set_target_assignment(
        &self,
        connector: &str,
        group: &str,
        target: &TargetAssignment,
    ) -> StoreResult<()> {
        let payload =
            serde_json::to_string(target).map_err(|e| StoreError::Fatal(e.to_string()))?;
        let mut state = self.lock_state()?;
        let timestamp = state.bump();
        state.nodes.insert(
            self.paths.target_assignment_request(connector, group, timestamp),
            payload,
        );
        drop(state);
        self.notify(StoreChange::TargetAssignment);
        Ok(())
    }

    /// Record that a connector observed a partition change. The tick only
    /// nudges the leader; the authoritative snapshot still comes from the
    /// partition metadata provider.
    pub fn signal_partitions_changed(&self) -> StoreResult<()> {
        let mut state = self.lock_state()?;
        state.bump();
        drop(state);
        self.notify(StoreChange::Partitions);
        Ok(())
    }

    fn parse_assignment(&self, state: &StoreState) -> StoreResult<Assignment> {
        let mut assignment = Assignment::new();
        let instances_prefix = format!("{}/", self.paths.instances());
        for (path, payload) in &state.nodes {
            let Some(rest) = path.strip_prefix(&instances_prefix) else {
                continue;
            };
            match rest.split_once('/') {
                None => assignment.add_instance(rest),
                Some((instance, child)) => {
                    if child.starts_with("assignments/") {
                        let task: TaskDescriptor = serde_json::from_str(payload)
                            .map_err(|e| StoreError::Fatal(e.to_string()))?;
                        assignment.insert(instance, std::sync::Arc::new(task));
                    }
                }
            }
        }
        Ok(assignment)
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn epoch(&self) -> StoreResult<u64> {
        Ok(self.lock_state()?.epoch)
    }

    async fn live_instances(&self) -> StoreResult<Vec<String>> {
        let state = self.lock_state()?;
        let prefix = format!("{}/", self.paths.live_instances());
        Ok(state
            .nodes
            .iter()
            .filter(|(path, _)| path.starts_with(&prefix))
            .map(|(_, value)| value.clone())
            .collect())
    }

    async fn datastreams(&self) -> StoreResult<Vec<Datastream>> {
        let state = self.lock_state()?;
        let prefix = format!("{}/", self.paths.datastreams());
        state
            .nodes
            .iter()
            .filter(|(path, _)| path.starts_with(&prefix))
            .map(|(_, payload)| {
                serde_json::from_str(payload).map_err(|e| StoreError::Fatal(e.to_string()))
            })
            .collect()
    }

    async fn assignment(&self) -> StoreResult<Assignment> {
        let state = self.lock_state()?;
        self.parse_assignment(&state)
    }

    async fn target_assignments(&self) -> StoreResult<BTreeMap<String, TargetAssignment>> {
        let state = self.lock_state()?;
        let mut newest: BTreeMap<String, (u64, TargetAssignment)> = BTreeMap::new();
        for (path, payload) in &state.nodes {
            let Some(rest) = path.strip_prefix(&format!("{}/connectors/", self.paths.root()))
            else {
                continue;
            };
            let parts: Vec<&str> = rest.split('/').collect();
            let [_, group, "targetAssignment", timestamp] = parts.as_slice() else {
                continue;
            };
            let Ok(timestamp) = timestamp.parse::<u64>() else {
                continue;
            };
            let target: TargetAssignment =
                serde_json::from_str(payload).map_err(|e| StoreError::Fatal(e.to_string()))?;
            let entry = newest.entry((*group).to_string()).or_insert((0, TargetAssignment::new()));
            if timestamp >= entry.0 {
                *entry = (timestamp, target);
            }
        }
        Ok(newest
            .into_iter()
            .map(|(group, (_, target))| (group, target))
            .collect())
    }

    async fn commit(
        &self,
        assignment: &Assignment,
        tombstones: &BTreeMap<String, Vec<String>>,
        consumed_targets: &[String],
    ) -> StoreResult<()> {
        let mut state = self.lock_state()?;

        // Instances absent from the committed assignment are gone; their
        // leftover task nodes would otherwise shadow the new assignment.
        let instances_prefix = format!("{}/", self.paths.instances());
        let dead: Vec<String> = state
            .nodes
            .keys()
            .filter(|path| {
                path.strip_prefix(&instances_prefix).is_some_and(|rest| {
                    let instance = rest.split('/').next().unwrap_or(rest);
                    !assignment.contains_instance(instance)
                })
            })
            .cloned()
            .collect();
        for path in dead {
            debug!("removing node {path} of a departed instance");
            state.nodes.remove(&path);
        }

        // Replace each live instance's task list. Creations are keyed by
        // task name so a replayed commit rewrites the same nodes.
        for (instance, tasks) in assignment.iter() {
            let instance_path = self.paths.instance(instance);
            state.nodes.entry(instance_path).or_default();
            let prefix = format!("{}/", self.paths.instance_assignments(instance));
            let listed: Vec<String> = tasks.iter().map(|t| t.name().to_string()).collect();
            let stale: Vec<String> = state
                .nodes
                .keys()
                .filter(|path| {
                    path.strip_prefix(&prefix)
                        .is_some_and(|name| !listed.iter().any(|l| l.as_str() == name))
                })
                .cloned()
                .collect();
            for path in stale {
                state.nodes.remove(&path);
            }
            for task in tasks {
                let locked = (**task).clone().with_lock_owner(instance);
                let payload = serde_json::to_string(&locked)
                    .map_err(|e| StoreError::Fatal(e.to_string()))?;
                let path = self
                    .paths
                    .instance_assignment(instance, &task.name().to_string());
                state.nodes.insert(path, payload);
            }
        }

        // Deletions are guarded by dependency metadata: only names the
        // cleanup planner proved retired arrive here. The predecessor node
        // may live under any instance, including one that is gone.
        for name in tombstones.values().flatten() {
            let suffix = format!("/assignments/{name}");
            let debris: Vec<String> = state
                .nodes
                .keys()
                .filter(|path| path.ends_with(&suffix))
                .cloned()
                .collect();
            for path in debris {
                debug!("removing retired task node {path}");
                state.nodes.remove(&path);
            }
        }

        for group in consumed_targets {
            let marker = format!("/{group}/targetAssignment/");
            let consumed: Vec<String> = state
                .nodes
                .keys()
                .filter(|path| path.contains(&marker))
                .cloned()
                .collect();
            for path in consumed {
                state.nodes.remove(&path);
            }
        }

        state.bump();
        Ok(())
    }

    async fn join_election(&self, instance: &str) -> StoreResult<watch::Receiver<bool>> {
        let mut state = self.lock_state()?;
        if !state.election.iter().any(|(_, name)| name == instance) {
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state
                .nodes
                .insert(self.paths.live_instance(sequence), instance.to_string());
            state.election.push((sequence, instance.to_string()));
            state.bump();
        }
        let is_leader = state
            .election
            .first()
            .is_some_and(|(_, name)| name == instance);
        let (tx, rx) = watch::channel(is_leader);
        state.leader_watches.push((instance.to_string(), tx));
        state.refresh_leader();
        Ok(rx)
    }

    async fn resign(&self, instance: &str) -> StoreResult<()> {
        let mut state = self.lock_state()?;
        state.election.retain(|(_, name)| name != instance);
        state.refresh_leader();
        state.bump();
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::datastream::tests::datastream;
    use crate::id::TaskName;

    fn store() -> MemoryStore {
        MemoryStore::new("test-cluster")
    }

    #[tokio::test]
    async fn test_live_instances_and_epoch() {
        let store = store();
        let before = store.epoch().await.unwrap();
        store.add_live_instance("instance0", "host-a").unwrap();
        store.add_live_instance("instance1", "host-b").unwrap();
        assert!(store.epoch().await.unwrap() > before);
        assert_eq!(
            store.live_instances().await.unwrap(),
            vec!["instance0".to_string(), "instance1".to_string()]
        );
        store.remove_live_instance("instance0").unwrap();
        assert_eq!(
            store.live_instances().await.unwrap(),
            vec!["instance1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_datastream_round_trip() {
        let store = store();
        let ds = datastream("orders", "orders");
        store.put_datastream(&ds).unwrap();
        assert_eq!(store.datastreams().await.unwrap(), vec![ds]);
        store.remove_datastream("orders").unwrap();
        assert!(store.datastreams().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_locks_tasks_and_replaces_lists() {
        let store = store();
        store.add_live_instance("instance0", "host-a").unwrap();
        let mut rng = StdRng::seed_from_u64(21);
        let task = TaskDescriptor::new(TaskName::mint("ds", &mut rng));

        let mut assignment = Assignment::new();
        assignment.insert("instance0", Arc::new(task.clone()));
        store
            .commit(&assignment, &BTreeMap::new(), &[])
            .await
            .unwrap();

        let read = store.assignment().await.unwrap();
        assert_eq!(read.tasks_for("instance0").len(), 1);
        assert!(read.tasks_for("instance0")[0].is_locked_by("instance0"));

        // A follow-up commit without the task removes its node.
        let successor = task.successor(vec![], &mut rng).unwrap();
        let mut next = Assignment::new();
        next.insert("instance0", Arc::new(successor.clone()));
        store.commit(&next, &BTreeMap::new(), &[]).await.unwrap();
        let read = store.assignment().await.unwrap();
        let names: Vec<String> = read
            .tasks_for("instance0")
            .iter()
            .map(|t| t.name().to_string())
            .collect();
        assert_eq!(names, vec![successor.name().to_string()]);
    }

    #[tokio::test]
    async fn test_tombstones_remove_debris_under_other_instances() {
        let store = store();
        store.add_live_instance("instance0", "host-a").unwrap();
        store.add_live_instance("instance1", "host-b").unwrap();
        let mut rng = StdRng::seed_from_u64(22);
        let predecessor = TaskDescriptor::new(TaskName::mint("ds", &mut rng));

        let mut first = Assignment::new();
        first.add_instance("instance1");
        first.insert("instance0", Arc::new(predecessor.clone()));
        store.commit(&first, &BTreeMap::new(), &[]).await.unwrap();

        // The successor lands on the other instance; the predecessor node
        // under instance0 is retired via tombstone.
        let successor = predecessor.successor(vec![], &mut rng).unwrap();
        let mut next = Assignment::new();
        next.add_instance("instance0");
        next.insert("instance1", Arc::new(successor));
        let mut tombstones = BTreeMap::new();
        tombstones.insert(
            "instance1".to_string(),
            vec![predecessor.name().to_string()],
        );
        store.commit(&next, &tombstones, &[]).await.unwrap();

        let read = store.assignment().await.unwrap();
        assert!(read.tasks_for("instance0").is_empty());
        assert_eq!(read.tasks_for("instance1").len(), 1);
    }

    #[tokio::test]
    async fn test_newest_target_assignment_wins_and_is_consumed() {
        let store = store();
        let mut old = TargetAssignment::new();
        old.insert("instance0".to_string(), ["t-0".to_string()].into());
        let mut new = TargetAssignment::new();
        new.insert("instance1".to_string(), ["t-0".to_string()].into());
        store.set_target_assignment("kafka", "ds", &old).unwrap();
        store.set_target_assignment("kafka", "ds", &new).unwrap();

        let targets = store.target_assignments().await.unwrap();
        assert_eq!(targets.get("ds"), Some(&new));

        store
            .commit(&Assignment::new(), &BTreeMap::new(), &["ds".to_string()])
            .await
            .unwrap();
        assert!(store.target_assignments().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_election_promotes_next_joiner() {
        let store = store();
        store.add_live_instance("instance0", "host-a").unwrap();
        store.add_live_instance("instance1", "host-b").unwrap();
        let first = store.join_election("instance0").await.unwrap();
        let second = store.join_election("instance1").await.unwrap();
        assert!(*first.borrow());
        assert!(!*second.borrow());

        store.remove_live_instance("instance0").unwrap();
        assert!(*second.borrow());
    }

    #[tokio::test]
    async fn test_change_ticks_are_published() {
        let store = store();
        let mut changes = store.subscribe();
        store.add_live_instance("instance0", "host-a").unwrap();
        store.put_datastream(&datastream("orders", "orders")).unwrap();
        store.signal_partitions_changed().unwrap();
        assert_eq!(changes.recv().await.unwrap(), StoreChange::Instances);
        assert_eq!(changes.recv().await.unwrap(), StoreChange::Datastreams);
        assert_eq!(changes.recv().await.unwrap(), StoreChange::Partitions);
    }
}
