mod core;
mod options;

pub use options::CoordinatorOptions;

use conduit_server::actor::ActorHandle;
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::assignment::StickyPartitionStrategy;
use crate::error::CoordinatorError;
use crate::store::StoreChange;

/// The leader-owned driver of the rebalance loop.
///
/// The coordinator reacts to change ticks from the coordination store,
/// coalesces them over a debounce window, and runs one rebalance cycle at
/// a time: read a stable snapshot, invoke the strategies, and persist the
/// result. Strategy computation happens inside the actor's spawned cycle
/// task; the actor itself only routes events, so a leadership loss can
/// abort an in-flight cycle at any store suspension point.
pub struct RebalanceCoordinator {
    options: CoordinatorOptions,
    strategy: StickyPartitionStrategy,
    leadership: Option<watch::Receiver<bool>>,
    is_leader: bool,
    /// Whether a (possibly delayed) rebalance event is already queued.
    rebalance_queued: bool,
    /// The in-flight rebalance cycle, if any.
    in_flight: Option<AbortHandle>,
    /// Set when changes arrive while a cycle is in flight.
    dirty: bool,
    retry_attempt: usize,
}

pub enum CoordinatorEvent {
    /// The election was joined; the watch tracks leadership from now on.
    ElectionJoined {
        leadership: watch::Receiver<bool>,
    },
    LeadershipChanged {
        is_leader: bool,
    },
    StoreChanged {
        change: StoreChange,
    },
    /// The debounced trigger that starts a rebalance cycle.
    Rebalance,
    RebalanceCompleted {
        epoch: u64,
        /// Whether another cycle should follow, e.g. to distribute
        /// partitions after a task-structure change.
        follow_up: bool,
    },
    RebalanceFailed {
        error: CoordinatorError,
    },
    Shutdown,
}

pub type CoordinatorHandle = ActorHandle<RebalanceCoordinator>;
