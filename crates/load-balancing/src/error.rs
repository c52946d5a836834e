//! Error types for the load balancing layer.
//!
//! Errors raised while talking to a single replica are normally absorbed by
//! the [`Host`](crate::host::Host) that owns it (the host is marked offline),
//! so the variants here mostly surface from the primary, the sticking store,
//! or service discovery.

// Error enum variant fields are self-documenting via their #[error(...)] messages
#![allow(missing_docs)]

use std::fmt::Debug;

use thiserror::Error;
use tracing::error;

/// SQLSTATE raised when a query conflicts with replication recovery or a
/// serializable transaction cannot be completed.
pub const SERIALIZATION_FAILURE: &str = "40001";

/// The error type for all load balancing operations.
#[derive(Error, Debug)]
pub enum LoadBalancingError {
    /// A connection could not be checked out or was lost mid-query.
    #[error("connection to {address} failed: {message}")]
    Connection { address: String, message: String },

    /// The database rejected or failed a statement.
    #[error("query on {address} failed: {message}")]
    Query {
        address: String,
        code: Option<String>,
        message: String,
    },

    /// The primary did not report a write location.
    #[error("no write location reported by {address}")]
    NoWriteLocation { address: String },

    /// A stored or reported WAL location could not be parsed.
    #[error("invalid WAL location: {value}")]
    InvalidLocation { value: String },

    /// The shared sticking store failed.
    #[error("sticking store error: {message}")]
    Store { message: String },

    /// Replica discovery failed.
    #[error("service discovery failed: {message}")]
    Discovery { message: String },

    /// Invalid configuration.
    #[error("invalid load balancing configuration: {message}")]
    Config { message: String },

    /// Transaction control statements must go through the transaction API.
    #[error("transaction control statement must use ConnectionProxy::transaction: {sql}")]
    TransactionStatement { sql: String },

    /// The transaction was already committed or rolled back.
    #[error("transaction is no longer active")]
    TransactionClosed,
}

impl LoadBalancingError {
    /// Returns true if the error means the node could not be reached.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, LoadBalancingError::Connection { .. })
    }

    /// Returns true if the query failed with a serialization failure.
    pub fn is_serialization_failure(&self) -> bool {
        matches!(
            self,
            LoadBalancingError::Query { code: Some(code), .. } if code == SERIALIZATION_FAILURE
        )
    }

    pub(crate) fn connection(address: &str, message: impl ToString) -> Self {
        LoadBalancingError::Connection {
            address: address.to_string(),
            message: message.to_string(),
        }
    }
}

/// Result type alias for load balancing operations.
pub type LbResult<T> = Result<T, LoadBalancingError>;

/// Receives errors that are recovered locally instead of propagated.
///
/// Service discovery reports every failed refresh here before it backs off.
pub trait ErrorTracker: Send + Sync + Debug {
    /// Records an error.
    fn track(&self, error: &LoadBalancingError);
}

/// An [`ErrorTracker`] that writes errors to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorTracker;

impl ErrorTracker for TracingErrorTracker {
    fn track(&self, err: &LoadBalancingError) {
        error!(error = %err, "Tracked load balancing error");
    }
}

#[cfg(feature = "postgres")]
impl LoadBalancingError {
    /// Converts a driver error raised on the node at `address`.
    pub fn from_postgres(address: &str, err: tokio_postgres::Error) -> Self {
        if err.is_closed() || err.code().is_none() {
            return LoadBalancingError::connection(address, err);
        }
        LoadBalancingError::Query {
            address: address.to_string(),
            code: err.code().map(|c| c.code().to_string()),
            message: err.to_string(),
        }
    }

    /// Converts a pool checkout error for the node at `address`.
    pub fn from_pool(address: &str, err: deadpool_postgres::PoolError) -> Self {
        LoadBalancingError::connection(address, err)
    }
}
