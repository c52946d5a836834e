//! Dispatching queries to the primary or a replica.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::LoadBalancingConfig;
use crate::error::{LbResult, LoadBalancingError};
use crate::host::Host;
use crate::host_list::HostList;
use crate::location::WalLocation;
use crate::node::{DbRole, Node, NodeConnection, NodeFactory, QueryResult};
use crate::service_discovery::ServiceAddress;

/// How many times each replica may be tried after recovery conflicts before
/// a read falls back to the primary.
const CONFLICT_RETRIES_PER_HOST: usize = 3;

/// Result of a routed query, tagged with the node that served it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedResult {
    /// Role of the node that ran the query.
    pub role: DbRole,
    /// Address of the node that ran the query.
    pub address: String,
    /// Rows returned by the query.
    pub result: QueryResult,
}

/// Sends reads to replicas and writes to the primary.
#[derive(Debug)]
pub struct LoadBalancer {
    primary: Arc<dyn Node>,
    host_list: HostList,
    config: Arc<LoadBalancingConfig>,
}

impl LoadBalancer {
    /// Creates a load balancer over `primary` and the given replica nodes.
    pub fn new(
        primary: Arc<dyn Node>,
        replicas: Vec<Arc<dyn Node>>,
        config: LoadBalancingConfig,
    ) -> Self {
        let config = Arc::new(config);
        let hosts = replicas
            .into_iter()
            .map(|node| Arc::new(Host::new(node, primary.clone(), config.clone())))
            .collect();
        Self {
            primary,
            host_list: HostList::new(hosts),
            config,
        }
    }

    /// Creates a load balancer whose replicas are the configured `hosts`.
    pub fn from_config(
        primary: Arc<dyn Node>,
        factory: &dyn NodeFactory,
        config: LoadBalancingConfig,
    ) -> LbResult<Self> {
        config.validate()?;
        let replicas = config
            .hosts
            .iter()
            .map(|h| factory.build(&h.parse::<ServiceAddress>()?))
            .collect::<LbResult<Vec<_>>>()?;
        Ok(Self::new(primary, replicas, config))
    }

    /// The load balancing configuration.
    pub fn config(&self) -> &LoadBalancingConfig {
        &self.config
    }

    /// Returns true if replicas are configured or discovered.
    pub fn enabled(&self) -> bool {
        self.config.enabled()
    }

    /// The replicas.
    pub fn host_list(&self) -> &HostList {
        &self.host_list
    }

    /// The primary node.
    pub fn primary(&self) -> &Arc<dyn Node> {
        &self.primary
    }

    /// Creates a host for a replica node, sharing this balancer's configuration.
    pub fn build_host(&self, node: Arc<dyn Node>) -> Arc<Host> {
        Arc::new(Host::new(node, self.primary.clone(), self.config.clone()))
    }

    /// Runs a read on a replica, falling back to the primary.
    ///
    /// A replica that cannot be reached is marked offline and the next one is
    /// tried. Recovery conflicts move on to another replica at most three times
    /// per host. Other query errors are returned as-is.
    pub async fn read(&self, sql: &str) -> LbResult<RoutedResult> {
        if self.host_list.is_empty() {
            return self.read_write(sql).await;
        }

        let max_conflicts = self.host_list.len() * CONFLICT_RETRIES_PER_HOST;
        let max_attempts = max_conflicts + self.host_list.len() + 1;
        let mut conflicts = 0;

        for _ in 0..max_attempts {
            let Some(host) = self.host_list.next().await else {
                break;
            };
            match host.query(sql).await {
                Ok(result) => {
                    return Ok(RoutedResult {
                        role: DbRole::Replica,
                        address: host.address().to_string(),
                        result,
                    });
                }
                Err(e) if e.is_serialization_failure() => {
                    let will_retry = conflicts < max_conflicts;
                    warn!(host = %host.address(), will_retry, conflicts, "Query conflict on replica");
                    if !will_retry {
                        break;
                    }
                    conflicts += 1;
                }
                Err(e) if e.is_connection_error() => {
                    warn!(host = %host.address(), error = %e, "Replica connection failed");
                    host.offline();
                }
                Err(e) => return Err(e),
            }
        }

        warn!(event = "no_secondaries_available", "No secondaries available, using primary");
        self.read_write(sql).await
    }

    /// Runs a query on the primary.
    pub async fn read_write(&self, sql: &str) -> LbResult<RoutedResult> {
        let mut conn = self.primary_connection().await?;
        let result = conn.query(sql).await?;
        Ok(RoutedResult {
            role: DbRole::Primary,
            address: self.primary.address().to_string(),
            result,
        })
    }

    /// Checks out a connection to the primary.
    pub async fn primary_connection(&self) -> LbResult<Box<dyn NodeConnection>> {
        self.primary.connect().await
    }

    /// The primary's current WAL insert position.
    pub async fn primary_write_location(&self) -> LbResult<WalLocation> {
        let mut conn = self.primary_connection().await?;
        conn.current_write_location()
            .await?
            .ok_or_else(|| LoadBalancingError::NoWriteLocation {
                address: self.primary.address().to_string(),
            })
    }

    /// Returns true if every replica has replayed WAL up to `location`.
    pub async fn all_caught_up(&self, location: &WalLocation) -> bool {
        for host in self.host_list.hosts() {
            if !host.caught_up(location).await {
                debug!(host = %host.address(), %location, "Replica not caught up");
                return false;
            }
        }
        true
    }

    /// Reports whether `address` belongs to the primary or a replica.
    pub fn db_role_for_address(&self, address: &str) -> Option<DbRole> {
        if self.primary.address() == address {
            return Some(DbRole::Primary);
        }
        self.host_list
            .host_names()
            .iter()
            .any(|h| h == address)
            .then_some(DbRole::Replica)
    }
}
