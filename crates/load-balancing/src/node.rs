//! Database node abstractions.
//!
//! A [`Node`] is one database server (the primary or a replica) together with
//! its connection pool. Routing logic only talks to nodes through these traits,
//! so the PostgreSQL implementation in [`crate::postgres`] and the in-memory
//! fakes used by tests are interchangeable.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LbResult;
use crate::location::WalLocation;
use crate::service_discovery::ServiceAddress;

/// The role a database node plays for the load balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbRole {
    /// The writable primary.
    Primary,
    /// A streaming replica.
    Replica,
}

impl std::fmt::Display for DbRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbRole::Primary => write!(f, "primary"),
            DbRole::Replica => write!(f, "replica"),
        }
    }
}

/// Rows returned by a simple-protocol query, with every value in text form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    /// Column names.
    pub columns: Vec<String>,
    /// Row values, `None` for SQL NULL.
    pub rows: Vec<Vec<Option<String>>>,
    /// Rows affected by the last command.
    pub rows_affected: u64,
}

impl QueryResult {
    /// Returns the first value of the first row, if any.
    pub fn scalar(&self) -> Option<&str> {
        self.rows.first()?.first()?.as_deref()
    }
}

/// A database server with a connection pool.
#[async_trait]
pub trait Node: Send + Sync + Debug {
    /// Address used for logging and for matching discovery results.
    fn address(&self) -> &str;

    /// Checks out a connection, waiting if the pool is exhausted.
    async fn connect(&self) -> LbResult<Box<dyn NodeConnection>>;

    /// Closes idle pooled connections.
    fn disconnect(&self);

    /// Number of connections currently checked out.
    fn busy_connections(&self) -> usize;
}

/// A connection checked out from a [`Node`]. Dropping it returns it to the pool.
#[async_trait]
pub trait NodeConnection: Send {
    /// Runs one or more statements with the simple query protocol.
    async fn query(&mut self, sql: &str) -> LbResult<QueryResult>;

    /// Time since the last replayed transaction, `None` on a primary.
    async fn replication_lag_time(&mut self) -> LbResult<Option<Duration>>;

    /// Bytes of WAL between `primary` and what this node has replayed.
    async fn replication_lag_size(&mut self, primary: &WalLocation) -> LbResult<Option<u64>>;

    /// Returns true if this node has replayed WAL up to `location`.
    async fn caught_up(&mut self, location: &WalLocation) -> LbResult<bool>;

    /// The current WAL insert position, `None` on a replica.
    async fn current_write_location(&mut self) -> LbResult<Option<WalLocation>>;

    /// Removes the connection from its pool and closes it.
    ///
    /// Used when the session state of the connection is unknown, such as a
    /// transaction abandoned without commit or rollback.
    fn detach(self: Box<Self>);
}

/// Builds nodes for addresses found by service discovery.
pub trait NodeFactory: Send + Sync + Debug {
    /// Creates a node for `address`. No connection is opened yet.
    fn build(&self, address: &ServiceAddress) -> LbResult<Arc<dyn Node>>;
}
