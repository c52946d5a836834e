//! Helios Database Reindexing
//!
//! This crate rebuilds bloated PostgreSQL indexes online, one at a time
//! across a cluster of application processes.
//!
//! # Features
//!
//! - **Selection**: Indexes are picked by size and estimated bloat, with a
//!   cooldown per index and tables that may only be rebuilt on one weekday
//! - **Strategies**: Either build a replacement and swap it in under lock
//!   retries, or use `REINDEX INDEX CONCURRENTLY`
//! - **Coordination**: A cluster-wide lease, a weekday schedule and an audit
//!   history of every attempt
//! - **Recovery**: Leftovers from interrupted runs are reported or dropped
//! - **Notifications**: Optional Grafana annotations per rebuild
//!
//! Available features:
//! - `postgres` (default) - Catalog, history and lease tables via `deadpool-postgres`
//!
//! # Architecture
//!
//! - [`index`] - Index metadata and naming
//! - [`database`] - Connection traits the strategies run against
//! - [`timeouts`] / [`lock_retries`] - Scoped timeouts and lock retry timing
//! - [`strategy`] - The two rebuild strategies
//! - [`selection`] - Candidate heuristics
//! - [`action`] / [`lease`] / [`notifier`] - Audit trail, mutual exclusion, annotations
//! - [`coordinator`] - One rebuild or drop under the lease
//! - [`runner`] - A full automatic run
//!
//! # Quick Start
//!
//! ```no_run
//! # #[cfg(feature = "postgres")]
//! # async fn run(pool: deadpool_postgres::Pool) -> Result<(), helios_reindexing::ReindexError> {
//! use std::sync::Arc;
//!
//! use helios_reindexing::postgres::{PgLease, PgReindexDatabase, PgReindexHistory};
//! use helios_reindexing::{
//!     Coordinator, NullNotifier, Reindexing, ReindexingConfig, build_strategy,
//! };
//!
//! let config = ReindexingConfig::default();
//! let database = Arc::new(PgReindexDatabase::new(pool.clone()));
//! let history = Arc::new(PgReindexHistory::new(pool.clone()));
//! let lease = Arc::new(PgLease::new(pool));
//! history.ensure_table().await?;
//! lease.ensure_table().await?;
//!
//! let strategy = build_strategy(database.clone(), &config);
//! let coordinator = Coordinator::new(
//!     database.clone(),
//!     strategy,
//!     lease,
//!     history.clone(),
//!     Arc::new(NullNotifier),
//!     &config,
//! );
//! let report = Reindexing::new(database, coordinator, history, &config)
//!     .automatic_reindexing()
//!     .await?;
//! println!("rebuilt {:?}", report.reindexed);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod action;
pub mod config;
pub mod coordinator;
pub mod database;
pub mod error;
pub mod index;
pub mod lease;
pub mod lock_retries;
pub mod notifier;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod runner;
pub mod selection;
pub mod strategy;
pub mod timeouts;

pub use action::{ActionState, MemoryHistory, ReindexAction, ReindexHistory};
pub use config::{NotifierConfig, ReindexingConfig, ScheduleConfig, SelectionConfig, StrategyKind};
pub use coordinator::{Coordinator, CoordinatorOutcome, StopReason};
pub use database::{ReindexConnection, ReindexDatabase};
pub use error::{ReindexError, ReindexResult, UnsupportedReason};
pub use index::Index;
pub use lease::{ExclusiveLease, LeaseToken, MemoryLease, REINDEX_LEASE_KEY};
pub use lock_retries::{LockRetries, LockRetryStep};
pub use notifier::{GrafanaNotifier, Notifier, NullNotifier};
pub use runner::{RecoveryReport, Reindexing, ReindexingReport};
pub use selection::IndexSelection;
pub use strategy::{
    ConcurrentReindex, RebuildStrategy, ReindexConcurrently, build_strategy,
    drop_index_concurrently,
};
