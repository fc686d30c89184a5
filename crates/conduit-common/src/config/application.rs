use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{CommonError, CommonResult};

const DEFAULT_CONFIG: &str = include_str!("default.toml");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub cluster: ClusterConfig,
    pub store: StoreConfig,
    pub assignment: AssignmentConfig,
}

impl AppConfig {
    pub fn load() -> CommonResult<Self> {
        Figment::from(Toml::string(DEFAULT_CONFIG))
            .merge(Env::prefixed("CONDUIT_").map(|p| p.as_str().replace("__", ".").into()))
            .extract()
            .map_err(|e| CommonError::InvalidConfiguration(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// The cluster name, which scopes every coordination store path.
    pub name: String,
    pub store_endpoint: String,
    pub session_timeout_secs: u64,
    pub connection_timeout_secs: u64,
    /// Change notifications arriving within this window are coalesced
    /// into a single rebalance.
    pub debounce_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub operation_timeout_secs: u64,
    /// A rebalance that has not persisted its result within this deadline
    /// is discarded and retried.
    pub rebalance_deadline_secs: u64,
    pub retry_strategy: RetryStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Fixed {
        max_count: usize,
        delay_secs: u64,
    },
    ExponentialBackoff {
        max_count: usize,
        initial_delay_secs: u64,
        max_delay_secs: u64,
        factor: u32,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentConfig {
    /// The task count for a datastream group that does not carry its own
    /// `system.maxTasks` metadata. Zero means one task per live instance.
    pub max_tasks: usize,
    /// The largest tolerated difference in task count between any two
    /// eligible instances.
    pub imbalance_threshold: usize,
    /// The largest partition count a single task may carry.
    /// Zero means unbounded.
    pub max_partitions_per_task: usize,
}

/// Environment variables for cluster configuration.
pub struct ClusterConfigEnv;

macro_rules! define_cluster_config_env {
    ($($name:ident),* $(,)?) => {
        $(pub const $name: &'static str = concat!("CONDUIT_CLUSTER__", stringify!($name));)*
    };
}

impl ClusterConfigEnv {
    define_cluster_config_env! {
        NAME,
        STORE_ENDPOINT,
        SESSION_TIMEOUT_SECS,
        CONNECTION_TIMEOUT_SECS,
        DEBOUNCE_INTERVAL_MS,
    }
}
