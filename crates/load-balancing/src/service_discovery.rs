//! DNS based replica discovery.
//!
//! A single background task per process resolves the replica record, and when
//! the sorted address set changes it swaps in a new host list. Hosts that were
//! removed keep serving in-flight queries until their busy connections are
//! returned or `disconnect_timeout` passes.
//!
//! # Example
//!
//! ```ignore
//! let discovery = Arc::new(ServiceDiscovery::new(
//!     load_balancer.clone(),
//!     Arc::new(DnsResolver::new(discover_config.clone()).await?),
//!     Arc::new(PgNodeFactory::new(primary_config, pool_size)),
//!     discover_config,
//! ));
//! let handle = discovery.start();
//! // ...
//! discovery.stop().await;
//! handle.await?;
//! ```

use std::fmt;
use std::fmt::Debug;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::DiscoveryConfig;
use crate::error::{ErrorTracker, LbResult, LoadBalancingError, TracingErrorTracker};
use crate::load_balancer::LoadBalancer;
use crate::node::NodeFactory;

/// A replica address found by discovery.
///
/// Without a port, the primary's port is used. The `Display` form is
/// `host` or `host:port`; nodes built for an address report it as their
/// [`address`](crate::node::Node::address).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceAddress {
    /// Host name or IP address.
    pub host: String,
    /// Port, if the record carried one.
    pub port: Option<u16>,
}

impl ServiceAddress {
    /// Creates an address.
    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.host, port),
            None => write!(f, "{}", self.host),
        }
    }
}

impl FromStr for ServiceAddress {
    type Err = LoadBalancingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || LoadBalancingError::Config {
            message: format!("invalid host address: '{s}'"),
        };

        match s.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse().map_err(|_| invalid())?;
                if host.is_empty() {
                    return Err(invalid());
                }
                Ok(Self::new(host, Some(port)))
            }
            None if !s.is_empty() => Ok(Self::new(s, None)),
            None => Err(invalid()),
        }
    }
}

/// Addresses returned by one lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Resolved addresses, in record order.
    pub addresses: Vec<ServiceAddress>,
    /// How long the answer may be cached.
    pub ttl: Duration,
}

/// Looks up the current replica addresses.
#[async_trait]
pub trait Resolver: Send + Sync + Debug {
    /// Resolves the replica record.
    async fn resolve(&self) -> LbResult<Resolution>;
}

/// Keeps a load balancer's host list in sync with a DNS record.
pub struct ServiceDiscovery {
    load_balancer: Arc<LoadBalancer>,
    resolver: Arc<dyn Resolver>,
    factory: Arc<dyn NodeFactory>,
    config: DiscoveryConfig,
    error_tracker: Arc<dyn ErrorTracker>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl Debug for ServiceDiscovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDiscovery")
            .field("record", &self.config.record)
            .field("record_type", &self.config.record_type)
            .field("running", &self.shutdown_tx.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl ServiceDiscovery {
    /// Creates a discovery loop. Errors are reported to a [`TracingErrorTracker`].
    pub fn new(
        load_balancer: Arc<LoadBalancer>,
        resolver: Arc<dyn Resolver>,
        factory: Arc<dyn NodeFactory>,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            load_balancer,
            resolver,
            factory,
            config,
            error_tracker: Arc::new(TracingErrorTracker),
            shutdown_tx: Mutex::new(None),
        }
    }

    /// Reports discovery errors to `tracker`.
    pub fn with_error_tracker(mut self, tracker: Arc<dyn ErrorTracker>) -> Self {
        self.error_tracker = tracker;
        self
    }

    /// Starts the background loop.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::channel(1);
        *self.shutdown_tx.lock() = Some(tx);
        let discovery = Arc::clone(self);

        tokio::spawn(async move {
            info!(record = %discovery.config.record, "Service discovery started");
            loop {
                match rx.try_recv() {
                    Err(TryRecvError::Empty) => {}
                    _ => break,
                }

                let wait = discovery.perform_service_discovery().await;
                let sleep = discovery.next_sleep(wait);
                debug!(?sleep, "Service discovery sleeping");

                tokio::select! {
                    _ = rx.recv() => break,
                    _ = tokio::time::sleep(sleep) => {}
                }
            }
            debug!("Service discovery shutting down");
        })
    }

    /// Stops the background loop.
    pub async fn stop(&self) {
        let tx = self.shutdown_tx.lock().take();
        if let Some(tx) = tx {
            let _ = tx.send(()).await;
        }
    }

    /// Runs one discovery round and returns how long to wait before the next.
    ///
    /// Failures are reported to the error tracker and answered with twice the
    /// configured interval.
    pub async fn perform_service_discovery(&self) -> Duration {
        match self.refresh_if_necessary().await {
            Ok(wait) => wait,
            Err(e) => {
                warn!(record = %self.config.record, error = %e, "Service discovery failed");
                self.error_tracker.track(&e);
                self.config.interval * 2
            }
        }
    }

    /// Resolves the record and replaces the hosts if the address set changed.
    ///
    /// Returns the larger of the record TTL and the configured interval.
    pub async fn refresh_if_necessary(&self) -> LbResult<Duration> {
        let resolution = self.resolver.resolve().await?;

        let mut addresses = resolution.addresses;
        addresses.sort();
        addresses.dedup();

        let mut new_names: Vec<String> = addresses.iter().map(ToString::to_string).collect();
        new_names.sort();
        let mut current = self.load_balancer.host_list().host_names();
        current.sort();

        if new_names != current {
            self.replace_hosts(&addresses)?;
        }

        Ok(resolution.ttl.max(self.config.interval))
    }

    /// Swaps in hosts for `addresses` and disconnects the old ones in the background.
    pub fn replace_hosts(&self, addresses: &[ServiceAddress]) -> LbResult<()> {
        let hosts = addresses
            .iter()
            .map(|address| {
                self.factory
                    .build(address)
                    .map(|node| self.load_balancer.build_host(node))
            })
            .collect::<LbResult<Vec<_>>>()?;

        let old_hosts = self.load_balancer.host_list().replace(hosts);
        info!(
            old = ?old_hosts.iter().map(|h| h.address()).collect::<Vec<_>>(),
            new = ?self.load_balancer.host_list().host_names(),
            "Replaced load balancing hosts"
        );

        let timeout = self.config.disconnect_timeout;
        for host in old_hosts {
            tokio::spawn(async move { host.disconnect(timeout).await });
        }
        Ok(())
    }

    /// Adds random jitter of up to `max_sleep_adjustment` to `wait`.
    pub fn next_sleep(&self, wait: Duration) -> Duration {
        let max_ms = self.config.max_sleep_adjustment.as_millis() as u64;
        if max_ms == 0 {
            return wait;
        }
        wait + Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

#[cfg(feature = "dns")]
pub use dns::DnsResolver;

#[cfg(feature = "dns")]
mod dns {
    use std::net::SocketAddr;
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use hickory_resolver::TokioAsyncResolver;
    use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};

    use super::{Resolution, Resolver, ServiceAddress};
    use crate::config::{DiscoveryConfig, RecordType};
    use crate::error::{LbResult, LoadBalancingError};

    /// [`Resolver`] that queries the configured nameserver for A or SRV records.
    pub struct DnsResolver {
        resolver: TokioAsyncResolver,
        record: String,
        record_type: RecordType,
    }

    impl std::fmt::Debug for DnsResolver {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("DnsResolver")
                .field("record", &self.record)
                .field("record_type", &self.record_type)
                .finish_non_exhaustive()
        }
    }

    impl DnsResolver {
        /// Creates a resolver for `config`. The nameserver name itself is
        /// resolved with the system resolver.
        pub async fn new(config: &DiscoveryConfig) -> LbResult<Self> {
            let nameserver = tokio::net::lookup_host((config.nameserver.as_str(), config.port))
                .await
                .map_err(|e| discovery_error(format!("cannot resolve nameserver: {e}")))?
                .next()
                .ok_or_else(|| {
                    discovery_error(format!("nameserver {} has no address", config.nameserver))
                })?;
            Ok(Self::with_nameserver(nameserver, config))
        }

        /// Creates a resolver that queries `nameserver` directly.
        pub fn with_nameserver(nameserver: SocketAddr, config: &DiscoveryConfig) -> Self {
            let protocol = if config.use_tcp {
                Protocol::Tcp
            } else {
                Protocol::Udp
            };
            let mut resolver_config = ResolverConfig::new();
            resolver_config.add_name_server(NameServerConfig::new(nameserver, protocol));

            Self {
                resolver: TokioAsyncResolver::tokio(resolver_config, ResolverOpts::default()),
                record: config.record.clone(),
                record_type: config.record_type,
            }
        }
    }

    #[async_trait]
    impl Resolver for DnsResolver {
        async fn resolve(&self) -> LbResult<Resolution> {
            match self.record_type {
                RecordType::A => {
                    let lookup = self
                        .resolver
                        .ipv4_lookup(self.record.as_str())
                        .await
                        .map_err(|e| discovery_error(e.to_string()))?;
                    let addresses = lookup
                        .iter()
                        .map(|a| ServiceAddress::new(a.0.to_string(), None))
                        .collect();
                    Ok(Resolution {
                        addresses,
                        ttl: remaining(lookup.as_lookup().valid_until()),
                    })
                }
                RecordType::Srv => {
                    let lookup = self
                        .resolver
                        .srv_lookup(self.record.as_str())
                        .await
                        .map_err(|e| discovery_error(e.to_string()))?;
                    let addresses = lookup
                        .iter()
                        .map(|srv| {
                            let target = srv.target().to_utf8();
                            let host = target.trim_end_matches('.').to_string();
                            ServiceAddress::new(host, Some(srv.port()))
                        })
                        .collect();
                    Ok(Resolution {
                        addresses,
                        ttl: remaining(lookup.as_lookup().valid_until()),
                    })
                }
            }
        }
    }

    fn remaining(valid_until: Instant) -> Duration {
        valid_until.saturating_duration_since(Instant::now())
    }

    fn discovery_error(message: String) -> LoadBalancingError {
        LoadBalancingError::Discovery { message }
    }
}
