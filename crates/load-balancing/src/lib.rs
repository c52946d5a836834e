//! Helios Database Load Balancing
//!
//! This crate routes queries between a PostgreSQL primary and its streaming
//! replicas while keeping reads consistent with a caller's own writes.
//!
//! # Features
//!
//! - **Routing**: Reads go to replicas, writes and locking reads to the primary
//! - **Health**: Replicas lagging behind the primary are taken out of rotation
//! - **Read-after-write**: Sessions and shared sticking records keep callers on
//!   the primary until replicas have replayed their writes
//! - **Service discovery**: Replica addresses are refreshed from DNS A or SRV records
//!
//! Available features:
//! - `postgres` (default) - PostgreSQL nodes and sticking store via `deadpool-postgres`
//! - `dns` (default) - DNS resolver via `hickory-resolver`
//!
//! # Architecture
//!
//! - [`location`] - WAL positions
//! - [`node`] - Database node and connection traits
//! - [`host`] / [`host_list`] - Replica health and round-robin selection
//! - [`load_balancer`] - Read/write dispatch with replica fallback
//! - [`session`] - Per unit-of-work routing state
//! - [`query`] - Query classification
//! - [`proxy`] - The router and primary transactions
//! - [`sticking`] / [`store`] - Cross-process read-after-write consistency
//! - [`service_discovery`] - DNS driven host list replacement
//! - [`boundary`] - Request and job units of work
//!
//! # Quick Start
//!
//! ```no_run
//! # #[cfg(feature = "postgres")]
//! # async fn run() -> Result<(), helios_load_balancing::LoadBalancingError> {
//! use std::sync::Arc;
//!
//! use helios_load_balancing::postgres::{PgNode, PgNodeFactory, PostgresConfig};
//! use helios_load_balancing::{
//!     ConnectionProxy, LoadBalancer, LoadBalancingConfig, Query, Session,
//! };
//!
//! let primary_config = PostgresConfig::from_env();
//! let config = LoadBalancingConfig {
//!     hosts: vec!["replica-1".to_string(), "replica-2".to_string()],
//!     ..Default::default()
//! };
//!
//! let primary = Arc::new(PgNode::connect_to(&primary_config)?);
//! let factory = PgNodeFactory::new(primary_config, config.pool_size);
//! let load_balancer = Arc::new(LoadBalancer::from_config(primary, &factory, config)?);
//! let proxy = ConnectionProxy::new(load_balancer);
//!
//! let mut session = Session::new();
//! proxy.execute(&mut session, &Query::new("SELECT 1")).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod boundary;
pub mod config;
pub mod error;
pub mod host;
pub mod host_list;
pub mod load_balancer;
pub mod location;
pub mod node;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod proxy;
pub mod query;
pub mod service_discovery;
pub mod session;
pub mod sticking;
pub mod store;

pub use boundary::{DataConsistency, JobBoundary, JobDecision, RequestBoundary, StickyKey, UnitOfWork};
pub use config::{DiscoveryConfig, LoadBalancingConfig, RecordType};
pub use error::{ErrorTracker, LbResult, LoadBalancingError, TracingErrorTracker};
pub use host::{Host, HostStatus};
pub use host_list::HostList;
pub use load_balancer::{LoadBalancer, RoutedResult};
pub use location::WalLocation;
pub use node::{DbRole, Node, NodeConnection, NodeFactory, QueryResult};
pub use proxy::{ConnectionProxy, ProxyTransaction};
pub use query::{Query, QueryKind, classify};
pub use service_discovery::{Resolution, Resolver, ServiceAddress, ServiceDiscovery};
pub use session::{Session, SessionScope};
pub use sticking::Sticking;
pub use store::{MemoryStore, StickingStore};

#[cfg(feature = "dns")]
pub use service_discovery::DnsResolver;
