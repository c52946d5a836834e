//! Error types for index rebuilding.
//!
//! Every error raised by a rebuild strategy is returned only after the
//! strategy has removed what it built, so the caller never has to clean up.

// Error enum variant fields are self-documenting via their #[error(...)] messages
#![allow(missing_docs)]

use std::fmt;

use thiserror::Error;

/// SQLSTATE raised when `lock_timeout` expires.
pub const LOCK_NOT_AVAILABLE: &str = "55P03";

/// SQLSTATE raised when `statement_timeout` expires.
pub const QUERY_CANCELED: &str = "57014";

/// Why an index cannot be rebuilt by a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsupportedReason {
    /// The index enforces uniqueness.
    Unique,
    /// The index is partitioned.
    Partitioned,
    /// The index serves an exclusion constraint.
    Exclusion,
    /// The index is built over expressions.
    Expression,
    /// The index is itself a leftover of an interrupted rebuild.
    Leftover,
}

impl fmt::Display for UnsupportedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            UnsupportedReason::Unique => "unique indexes are not supported",
            UnsupportedReason::Partitioned => "partitioned indexes are not supported",
            UnsupportedReason::Exclusion => {
                "indexes serving an exclusion constraint are not supported"
            }
            UnsupportedReason::Expression => "expression indexes are not supported",
            UnsupportedReason::Leftover => {
                "index is a leftover temporary index from a previous reindexing run"
            }
        };
        f.write_str(reason)
    }
}

/// The error type for all reindexing operations.
#[derive(Error, Debug)]
pub enum ReindexError {
    /// The strategy cannot rebuild this kind of index.
    #[error("cannot reindex {index}: {reason}")]
    UnsupportedIndexKind {
        index: String,
        reason: UnsupportedReason,
    },

    /// A temporary index from an earlier run is still present.
    #[error("temporary index {index} left over from a previous run must be removed first")]
    LeftoverTemporaryIndex { index: String },

    /// The replacement index was built but is not valid.
    #[error("replacement index {replacement} for {index} is invalid")]
    ReplacementInvalid { index: String, replacement: String },

    /// Every lock retry timed out.
    #[error("could not acquire locks after {attempts} attempts")]
    LockRetriesExhausted { attempts: usize },

    /// A statement failed, timed out or lost its connection.
    #[error("database error: {message}")]
    Database {
        code: Option<String>,
        message: String,
    },

    /// The index definition could not be rewritten for the replacement.
    #[error("unexpected definition for index {index}")]
    InvalidDefinition { index: String },

    /// The exclusive lease store failed.
    #[error("lease error: {message}")]
    Lease { message: String },

    /// The action history store failed.
    #[error("reindex history error: {message}")]
    History { message: String },

    /// Invalid configuration.
    #[error("invalid reindexing configuration: {message}")]
    Config { message: String },
}

impl ReindexError {
    /// Returns true if the statement gave up waiting for a lock.
    pub fn is_lock_timeout(&self) -> bool {
        matches!(
            self,
            ReindexError::Database { code: Some(code), .. } if code == LOCK_NOT_AVAILABLE
        )
    }

    /// Returns true if the statement hit its statement timeout.
    pub fn is_statement_timeout(&self) -> bool {
        matches!(
            self,
            ReindexError::Database { code: Some(code), .. } if code == QUERY_CANCELED
        )
    }

    pub(crate) fn database(message: impl ToString) -> Self {
        ReindexError::Database {
            code: None,
            message: message.to_string(),
        }
    }
}

/// Result type alias for reindexing operations.
pub type ReindexResult<T> = Result<T, ReindexError>;

#[cfg(feature = "postgres")]
impl From<tokio_postgres::Error> for ReindexError {
    fn from(err: tokio_postgres::Error) -> Self {
        ReindexError::Database {
            code: err.code().map(|c| c.code().to_string()),
            message: err.to_string(),
        }
    }
}

#[cfg(feature = "postgres")]
impl From<deadpool_postgres::PoolError> for ReindexError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        ReindexError::database(err)
    }
}
