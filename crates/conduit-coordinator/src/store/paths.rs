/// The coordination-store key layout, scoped to one cluster deployment.
///
/// Layout:
/// - `/{cluster}/instances/{instance}` holds the instance host, with the
///   owned tasks under `assignments/{taskName}`;
/// - `/{cluster}/liveinstances/{seq}` are the ephemeral sequential
///   election nodes, smallest sequence number is the leader;
/// - `/{cluster}/dms/{datastream}` holds the datastream records, with a
///   timestamp write to `/{cluster}/dms` as the change-notification tick;
/// - `/{cluster}/connectors/{connector}/{group}` holds the operator move
///   requests and the opaque source checkpoints.
#[derive(Debug, Clone)]
pub struct ClusterPaths {
    cluster: String,
}

impl ClusterPaths {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
        }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn root(&self) -> String {
        format!("/{}", self.cluster)
    }

    pub fn instances(&self) -> String {
        format!("/{}/instances", self.cluster)
    }

    pub fn instance(&self, instance: &str) -> String {
        format!("/{}/instances/{instance}", self.cluster)
    }

    pub fn instance_assignments(&self, instance: &str) -> String {
        format!("/{}/instances/{instance}/assignments", self.cluster)
    }

    pub fn instance_assignment(&self, instance: &str, task: &str) -> String {
        format!("/{}/instances/{instance}/assignments/{task}", self.cluster)
    }

    pub fn live_instances(&self) -> String {
        format!("/{}/liveinstances", self.cluster)
    }

    pub fn live_instance(&self, sequence: u64) -> String {
        format!("/{}/liveinstances/{sequence:010}", self.cluster)
    }

    pub fn datastreams(&self) -> String {
        format!("/{}/dms", self.cluster)
    }

    pub fn datastream(&self, name: &str) -> String {
        format!("/{}/dms/{name}", self.cluster)
    }

    pub fn target_assignments(&self, connector: &str, group: &str) -> String {
        format!(
            "/{}/connectors/{connector}/{group}/targetAssignment",
            self.cluster
        )
    }

    pub fn target_assignment_request(&self, connector: &str, group: &str, timestamp: u64) -> String {
        format!(
            "/{}/connectors/{connector}/{group}/targetAssignment/{timestamp}",
            self.cluster
        )
    }

    pub fn checkpoint(&self, connector: &str, group: &str, task: &str) -> String {
        format!(
            "/{}/connectors/{connector}/{group}/checkpoints/{task}",
            self.cluster
        )
    }
}
