//! Rebuild with `REINDEX INDEX CONCURRENTLY`.
//!
//! An interrupted native rebuild leaves an invalid `<name>_ccnew` (or
//! `<name>_ccnew<N>`) index behind. Those are dropped before and after every
//! run.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{RebuildStrategy, drop_index_concurrently};
use crate::config::ReindexingConfig;
use crate::database::{ReindexConnection, ReindexDatabase};
use crate::error::{ReindexError, ReindexResult, UnsupportedReason};
use crate::index::{Index, NATIVE_LEFTOVER_MARKER};
use crate::lock_retries::LockRetries;
use crate::timeouts::with_statement_timeout;

/// Native strategy.
#[derive(Debug, Clone)]
pub struct ReindexConcurrently {
    database: Arc<dyn ReindexDatabase>,
    statement_timeout: Duration,
    removal_retries: LockRetries,
}

impl ReindexConcurrently {
    /// Creates the strategy.
    pub fn new(database: Arc<dyn ReindexDatabase>, config: &ReindexingConfig) -> Self {
        Self {
            database,
            statement_timeout: config.native_statement_timeout,
            removal_retries: LockRetries::for_index_removal(),
        }
    }

    /// Uses `removal` when dropping leftovers.
    pub fn with_removal_retries(mut self, removal: LockRetries) -> Self {
        self.removal_retries = removal;
        self
    }

    async fn remove_leftovers(
        &self,
        conn: &mut dyn ReindexConnection,
        index: &Index,
    ) -> ReindexResult<()> {
        let prefix = format!("{}{}", index.name, NATIVE_LEFTOVER_MARKER);
        let leftovers = conn.indexes_with_prefix(&index.schema, &prefix).await?;

        for leftover in leftovers.iter().filter(|l| index.owns_native_leftover(l)) {
            warn!(index = %leftover.identifier(), "Removing dangling index");
            drop_index_concurrently(conn, &self.removal_retries, &leftover.schema, &leftover.name)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl RebuildStrategy for ReindexConcurrently {
    fn name(&self) -> &'static str {
        "native"
    }

    fn check_supported(&self, index: &Index) -> ReindexResult<()> {
        let reason = if index.partitioned {
            Some(UnsupportedReason::Partitioned)
        } else if index.exclusion {
            Some(UnsupportedReason::Exclusion)
        } else if index.is_native_leftover() || index.is_replacement_leftover() {
            Some(UnsupportedReason::Leftover)
        } else {
            None
        };

        match reason {
            Some(reason) => Err(ReindexError::UnsupportedIndexKind {
                index: index.identifier(),
                reason,
            }),
            None => Ok(()),
        }
    }

    async fn perform(&self, index: &Index) -> ReindexResult<()> {
        self.check_supported(index)?;

        let mut conn = self.database.connect().await?;
        self.remove_leftovers(conn.as_mut(), index).await?;

        info!(index = %index.identifier(), "Reindexing concurrently");
        let result = with_statement_timeout(
            conn.as_mut(),
            self.statement_timeout,
            &[format!("REINDEX INDEX CONCURRENTLY {}", index.quoted_identifier())],
        )
        .await;
        if let Err(e) = &result {
            warn!(index = %index.identifier(), error = %e, "Reindex failed, cleaning up");
        }

        let cleanup = self.remove_leftovers(conn.as_mut(), index).await;
        match (result, cleanup) {
            (Err(e), Err(cleanup_err)) => {
                warn!(index = %index.identifier(), error = %cleanup_err, "Cleanup failed");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(()), cleanup) => cleanup,
        }
    }
}
