use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use conduit_server::actor::{Actor, ActorAction, ActorContext};
use conduit_server::retry::{RetryStrategy, Retryable};
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::broadcast;
use tokio::sync::watch;

use crate::assignment::{
    Assignment, CleanupPlanner, StickyMulticastStrategy, StickyPartitionStrategy, TargetAssignment,
};
use crate::coordinator::{CoordinatorEvent, CoordinatorOptions, RebalanceCoordinator};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::partition::PartitionMetadataProvider;
use crate::registry::StreamRegistry;
use crate::roster::InstanceRoster;
use crate::store::{CoordinationStore, StoreChange, StoreResult};

/// How many times a snapshot read is repeated waiting for the store epoch
/// to hold still across all reads.
const STABLE_SNAPSHOT_ATTEMPTS: usize = 5;

impl Actor for RebalanceCoordinator {
    type Message = CoordinatorEvent;
    type Options = CoordinatorOptions;

    fn name() -> &'static str {
        "RebalanceCoordinator"
    }

    fn new(options: CoordinatorOptions) -> Self {
        let multicast =
            StickyMulticastStrategy::new(options.max_tasks, options.imbalance_threshold);
        let strategy = StickyPartitionStrategy::new(multicast, options.max_partitions_per_task);
        Self {
            options,
            strategy,
            leadership: None,
            is_leader: false,
            rebalance_queued: false,
            in_flight: None,
            dirty: false,
            retry_attempt: 0,
        }
    }

    fn start(&mut self, ctx: &mut ActorContext<Self>) {
        let store = Arc::clone(&self.options.store);
        let instance = self.options.instance.clone();
        let retry = self.options.retry_strategy.clone();
        let handle = ctx.handle().clone();
        ctx.spawn(async move {
            let join = move || {
                let store = Arc::clone(&store);
                let instance = instance.clone();
                async move { store.join_election(&instance).await }
            };
            let mut leadership = match join.retry(retry).await {
                Ok(leadership) => leadership,
                Err(e) => {
                    error!("failed to join the leader election: {e}");
                    return;
                }
            };
            if handle
                .send(CoordinatorEvent::ElectionJoined {
                    leadership: leadership.clone(),
                })
                .await
                .is_err()
            {
                return;
            }
            loop {
                let is_leader = *leadership.borrow_and_update();
                if handle
                    .send(CoordinatorEvent::LeadershipChanged { is_leader })
                    .await
                    .is_err()
                {
                    return;
                }
                if leadership.changed().await.is_err() {
                    return;
                }
            }
        });

        let mut changes = self.options.store.subscribe();
        let handle = ctx.handle().clone();
        ctx.spawn(async move {
            loop {
                let change = match changes.recv().await {
                    Ok(change) => change,
                    // Missed ticks are fine: any tick triggers a full
                    // rebalance from store state.
                    Err(broadcast::error::RecvError::Lagged(_)) => StoreChange::Datastreams,
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                if handle
                    .send(CoordinatorEvent::StoreChanged { change })
                    .await
                    .is_err()
                {
                    return;
                }
            }
        });
    }

    fn receive(&mut self, ctx: &mut ActorContext<Self>, message: CoordinatorEvent) -> ActorAction {
        match message {
            CoordinatorEvent::ElectionJoined { leadership } => {
                self.leadership = Some(leadership);
                ActorAction::Continue
            }
            CoordinatorEvent::LeadershipChanged { is_leader } => {
                self.handle_leadership_changed(ctx, is_leader)
            }
            CoordinatorEvent::StoreChanged { change } => self.handle_store_changed(ctx, change),
            CoordinatorEvent::Rebalance => self.handle_rebalance(ctx),
            CoordinatorEvent::RebalanceCompleted { epoch, follow_up } => {
                self.handle_rebalance_completed(ctx, epoch, follow_up)
            }
            CoordinatorEvent::RebalanceFailed { error } => {
                self.handle_rebalance_failed(ctx, error)
            }
            CoordinatorEvent::Shutdown => ActorAction::Stop,
        }
    }

    fn stop(self) {
        info!("rebalance coordinator for instance {} stopped", self.options.instance);
    }
}

impl RebalanceCoordinator {
    fn handle_leadership_changed(
        &mut self,
        ctx: &mut ActorContext<Self>,
        is_leader: bool,
    ) -> ActorAction {
        if is_leader == self.is_leader {
            return ActorAction::Continue;
        }
        self.is_leader = is_leader;
        if is_leader {
            info!("instance {} acquired leadership", self.options.instance);
            self.schedule_rebalance(ctx);
        } else {
            info!("instance {} lost leadership", self.options.instance);
            if let Some(in_flight) = self.in_flight.take() {
                // Cancellation discards the in-memory candidate; nothing
                // has been persisted yet.
                in_flight.abort();
            }
            self.dirty = false;
            self.retry_attempt = 0;
        }
        ActorAction::Continue
    }

    fn handle_store_changed(
        &mut self,
        ctx: &mut ActorContext<Self>,
        change: StoreChange,
    ) -> ActorAction {
        debug!("store change observed: {change:?}");
        if self.in_flight.is_some() {
            self.dirty = true;
        } else {
            self.schedule_rebalance(ctx);
        }
        ActorAction::Continue
    }

    /// Queue a debounced rebalance unless one is already queued.
    fn schedule_rebalance(&mut self, ctx: &mut ActorContext<Self>) {
        if !self.is_leader || self.rebalance_queued {
            return;
        }
        self.rebalance_queued = true;
        ctx.send_with_delay(CoordinatorEvent::Rebalance, self.options.debounce_interval);
    }

    fn handle_rebalance(&mut self, ctx: &mut ActorContext<Self>) -> ActorAction {
        self.rebalance_queued = false;
        if !self.is_leader {
            debug!("skipping rebalance: not the leader");
            return ActorAction::Continue;
        }
        if self.in_flight.is_some() {
            self.dirty = true;
            return ActorAction::Continue;
        }
        let Some(leadership) = self.leadership.clone() else {
            return ActorAction::Continue;
        };
        let cycle = RebalanceCycle {
            store: Arc::clone(&self.options.store),
            partitions: Arc::clone(&self.options.partitions),
            strategy: self.strategy.clone(),
            leadership,
            operation_timeout: self.options.operation_timeout,
            retry_strategy: self.options.retry_strategy.clone(),
        };
        let deadline = self.options.rebalance_deadline;
        let handle = ctx.handle().clone();
        let in_flight = ctx.spawn(async move {
            let event = match tokio::time::timeout(deadline, cycle.run()).await {
                Ok(Ok(outcome)) => CoordinatorEvent::RebalanceCompleted {
                    epoch: outcome.epoch,
                    follow_up: outcome.follow_up,
                },
                Ok(Err(error)) => CoordinatorEvent::RebalanceFailed { error },
                Err(_) => CoordinatorEvent::RebalanceFailed {
                    error: CoordinatorError::StoreTransient(
                        "rebalance deadline exceeded".to_string(),
                    ),
                },
            };
            let _ = handle.send(event).await;
        });
        self.in_flight = Some(in_flight);
        ActorAction::Continue
    }

    fn handle_rebalance_completed(
        &mut self,
        ctx: &mut ActorContext<Self>,
        epoch: u64,
        follow_up: bool,
    ) -> ActorAction {
        debug!("rebalance completed at epoch {epoch}");
        self.in_flight = None;
        self.retry_attempt = 0;
        if follow_up || self.dirty {
            self.dirty = false;
            self.schedule_rebalance(ctx);
        }
        ActorAction::Continue
    }

    fn handle_rebalance_failed(
        &mut self,
        ctx: &mut ActorContext<Self>,
        error: CoordinatorError,
    ) -> ActorAction {
        self.in_flight = None;
        if !error.is_recoverable() {
            error!("relinquishing leadership after unrecoverable rebalance failure: {error}");
            self.retry_attempt = 0;
            let store = Arc::clone(&self.options.store);
            let instance = self.options.instance.clone();
            ctx.spawn(async move {
                if let Err(e) = store.resign(&instance).await {
                    error!("failed to resign from the election: {e}");
                }
            });
            return ActorAction::Continue;
        }
        if !self.is_leader || self.rebalance_queued {
            return ActorAction::Continue;
        }
        let delay = self
            .options
            .retry_strategy
            .delay_for_attempt(self.retry_attempt);
        self.retry_attempt += 1;
        warn!(
            "rebalance failed: {error}; retry {} in {delay:?}",
            self.retry_attempt
        );
        self.rebalance_queued = true;
        ctx.send_with_delay(CoordinatorEvent::Rebalance, delay);
        ActorAction::Continue
    }
}

struct RebalanceOutcome {
    epoch: u64,
    follow_up: bool,
}

/// One rebalance cycle, run on the coordinator's task context.
struct RebalanceCycle {
    store: Arc<dyn CoordinationStore>,
    partitions: Arc<dyn PartitionMetadataProvider>,
    strategy: StickyPartitionStrategy,
    leadership: watch::Receiver<bool>,
    operation_timeout: Duration,
    retry_strategy: RetryStrategy,
}

struct Snapshot {
    epoch: u64,
    instances: Vec<String>,
    current: Assignment,
    registry: StreamRegistry,
    targets: BTreeMap<String, TargetAssignment>,
}

impl RebalanceCycle {
    async fn run(self) -> CoordinatorResult<RebalanceOutcome> {
        let snapshot = self.read_snapshot().await?;
        let epoch = snapshot.epoch;
        let roster = InstanceRoster::new(snapshot.instances);
        if roster.is_empty() {
            info!("no live instances; nothing to assign");
            return Ok(RebalanceOutcome {
                epoch,
                follow_up: false,
            });
        }
        let groups = snapshot.registry.assignable_groups()?;
        let current = snapshot.current;

        // Task structure first: counts and placement. Partition
        // distribution needs the new tasks to be locked by their owners,
        // which happens between cycles, so a structural change commits on
        // its own and a follow-up cycle distributes the partitions.
        let mut rng = StdRng::seed_from_u64(epoch);
        let structural = self
            .strategy
            .multicast()
            .assign(&groups, &roster, &current, &mut rng)?;
        let (next, consumed, follow_up) = if structural != current {
            info!("task structure changed; partitions follow on the next cycle");
            (structural, vec![], true)
        } else {
            let mut next = current.clone();
            let mut consumed = vec![];
            for group in &groups {
                let metadata = self.read_partitions(group).await?;
                if let Some(target) = snapshot.targets.get(group.task_prefix()) {
                    next = self.strategy.move_partitions(&next, target, &metadata)?;
                    consumed.push(group.task_prefix().to_string());
                } else {
                    next = self.strategy.assign_partitions(&next, &metadata)?;
                }
            }
            (next, consumed, false)
        };

        let tombstones = CleanupPlanner::new().plan(&groups, &next);
        if next == current && consumed.is_empty() && tombstones.is_empty() {
            debug!("assignment is unchanged; skipping commit");
            return Ok(RebalanceOutcome {
                epoch,
                follow_up: false,
            });
        }

        if !*self.leadership.borrow() {
            return Err(CoordinatorError::LeadershipLost);
        }
        self.commit(&next, &tombstones, &consumed).await?;
        info!(
            "committed assignment for epoch {epoch}: {} tasks on {} instances, {} retired",
            next.task_count(),
            next.instance_count(),
            tombstones.values().map(Vec::len).sum::<usize>()
        );
        Ok(RebalanceOutcome { epoch, follow_up })
    }

    /// Read all inputs, re-reading until the epoch is stable across the
    /// whole set so the cycle works from a consistent snapshot.
    async fn read_snapshot(&self) -> CoordinatorResult<Snapshot> {
        for attempt in 0..STABLE_SNAPSHOT_ATTEMPTS {
            let before = self.read(self.store.epoch()).await?;
            let instances = self.read(self.store.live_instances()).await?;
            let datastreams = self.read(self.store.datastreams()).await?;
            let current = self.read(self.store.assignment()).await?;
            let targets = self.read(self.store.target_assignments()).await?;
            let after = self.read(self.store.epoch()).await?;
            if before == after {
                return Ok(Snapshot {
                    epoch: after,
                    instances,
                    current,
                    registry: StreamRegistry::new(datastreams),
                    targets,
                });
            }
            debug!("snapshot attempt {attempt} raced a store change; re-reading");
        }
        Err(CoordinatorError::StoreTransient(
            "could not read a stable snapshot".to_string(),
        ))
    }

    async fn read<T>(
        &self,
        operation: impl std::future::Future<Output = StoreResult<T>>,
    ) -> CoordinatorResult<T> {
        match tokio::time::timeout(self.operation_timeout, operation).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(CoordinatorError::StoreTransient(
                "store operation timed out".to_string(),
            )),
        }
    }

    async fn read_partitions(
        &self,
        group: &crate::group::DatastreamGroup,
    ) -> CoordinatorResult<crate::partition::GroupPartitions> {
        match tokio::time::timeout(self.operation_timeout, self.partitions.group_partitions(group))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(CoordinatorError::StoreTransient(
                "partition metadata read timed out".to_string(),
            )),
        }
    }

    /// Persist the cycle result, retrying transient failures and
    /// escalating to a fatal failure once the schedule is exhausted.
    async fn commit(
        &self,
        next: &Assignment,
        tombstones: &BTreeMap<String, Vec<String>>,
        consumed: &[String],
    ) -> CoordinatorResult<()> {
        let mut delays = self.retry_strategy.iter();
        loop {
            match self
                .read(self.store.commit(next, tombstones, consumed))
                .await
            {
                Ok(()) => return Ok(()),
                Err(error @ CoordinatorError::StoreTransient(_)) => match delays.next() {
                    Some(delay) => {
                        warn!("commit failed: {error}; retrying in {delay:?}");
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        return Err(CoordinatorError::StoreFatal(format!(
                            "commit retries exhausted: {error}"
                        )));
                    }
                },
                Err(error) => return Err(error),
            }
        }
    }
}
