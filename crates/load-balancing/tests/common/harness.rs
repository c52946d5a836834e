//! Builders that wire fakes into a load balancer.

use std::sync::Arc;
use std::time::Duration;

use helios_load_balancing::{
    ConnectionProxy, LoadBalancer, LoadBalancingConfig, MemoryStore, Node, Sticking,
};

use super::fakes::FakeNode;

/// A primary, its replicas and the load balancer over them.
pub struct Cluster {
    pub primary: Arc<FakeNode>,
    pub replicas: Vec<Arc<FakeNode>>,
    pub load_balancer: Arc<LoadBalancer>,
}

impl Cluster {
    /// A primary `primary:5432` with replicas `replica-<n>:5432`.
    ///
    /// Replica status is re-checked on every use so tests see changes immediately.
    pub fn new(replica_count: usize) -> Self {
        Self::with_config(replica_count, fresh_config())
    }

    pub fn with_config(replica_count: usize, mut config: LoadBalancingConfig) -> Self {
        let primary = FakeNode::primary("primary:5432");
        let replicas: Vec<Arc<FakeNode>> = (1..=replica_count)
            .map(|n| FakeNode::replica(&format!("replica-{n}:5432")))
            .collect();
        config.hosts = replicas.iter().map(|r| r.address().to_string()).collect();

        let load_balancer = Arc::new(LoadBalancer::new(
            primary.as_node(),
            replicas.iter().map(|r| r.as_node()).collect(),
            config,
        ));

        Self {
            primary,
            replicas,
            load_balancer,
        }
    }

    pub fn proxy(&self) -> ConnectionProxy {
        ConnectionProxy::new(self.load_balancer.clone())
    }

    pub fn sticking(&self) -> (Sticking, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (Sticking::new(self.load_balancer.clone(), store.clone()), store)
    }

    /// Moves the primary ahead of every replica.
    pub fn advance_primary(&self, location: u64) {
        self.primary.set_write_location(Some(location));
    }

    /// Lets every replica replay up to `location`.
    pub fn replay_all(&self, location: u64) {
        for replica in &self.replicas {
            replica.set_replayed(location);
        }
    }
}

/// Configuration that re-checks replica status on every use.
pub fn fresh_config() -> LoadBalancingConfig {
    LoadBalancingConfig {
        replica_check_interval: Duration::ZERO,
        ..Default::default()
    }
}
