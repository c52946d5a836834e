//! Serializes rebuilds across the cluster and keeps their audit trail.
//!
//! Every rebuild and every leftover drop first takes the single
//! [`REINDEX_LEASE_KEY`] lease. A caller that does not get it returns at once;
//! another process is already working on an index.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::action::{ReindexAction, ReindexHistory};
use crate::config::{ReindexingConfig, ScheduleConfig};
use crate::database::ReindexDatabase;
use crate::error::ReindexResult;
use crate::index::Index;
use crate::lease::{ExclusiveLease, LeaseToken, REINDEX_LEASE_KEY};
use crate::lock_retries::LockRetries;
use crate::notifier::Notifier;
use crate::strategy::{RebuildStrategy, drop_index_concurrently};

/// What a coordinator call did.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorOutcome {
    /// The index was rebuilt; the finished action.
    Performed(ReindexAction),
    /// The index was dropped.
    Dropped,
    /// Rebuilds are not allowed today.
    OutsideSchedule,
    /// Another process holds the lease.
    LeaseTaken,
}

impl CoordinatorOutcome {
    /// Why nothing was done, if nothing was.
    pub fn stop_reason(&self) -> Option<StopReason> {
        match self {
            CoordinatorOutcome::OutsideSchedule => Some(StopReason::OutsideSchedule),
            CoordinatorOutcome::LeaseTaken => Some(StopReason::LeaseTaken),
            CoordinatorOutcome::Performed(_) | CoordinatorOutcome::Dropped => None,
        }
    }
}

/// Why a coordinator call did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Rebuilds are not allowed today.
    OutsideSchedule,
    /// Another process holds the lease.
    LeaseTaken,
}

/// Runs rebuilds and drops one at a time across the cluster.
#[derive(Debug, Clone)]
pub struct Coordinator {
    database: Arc<dyn ReindexDatabase>,
    strategy: Arc<dyn RebuildStrategy>,
    lease: Arc<dyn ExclusiveLease>,
    history: Arc<dyn ReindexHistory>,
    notifier: Arc<dyn Notifier>,
    schedule: ScheduleConfig,
    lease_timeout: Duration,
    removal_retries: LockRetries,
}

impl Coordinator {
    /// Creates a coordinator.
    pub fn new(
        database: Arc<dyn ReindexDatabase>,
        strategy: Arc<dyn RebuildStrategy>,
        lease: Arc<dyn ExclusiveLease>,
        history: Arc<dyn ReindexHistory>,
        notifier: Arc<dyn Notifier>,
        config: &ReindexingConfig,
    ) -> Self {
        Self {
            database,
            strategy,
            lease,
            history,
            notifier,
            schedule: config.schedule.clone(),
            lease_timeout: config.lease_timeout,
            removal_retries: LockRetries::for_index_removal(),
        }
    }

    /// Uses `removal` for [`drop`](Self::drop).
    pub fn with_removal_retries(mut self, removal: LockRetries) -> Self {
        self.removal_retries = removal;
        self
    }

    /// The rebuild strategy.
    pub fn strategy(&self) -> &Arc<dyn RebuildStrategy> {
        &self.strategy
    }

    /// Rebuilds `index` if today is a scheduled day and the lease is free.
    ///
    /// The action is recorded before the rebuild and finalized after it
    /// whatever the outcome. A strategy error is returned once the action is
    /// recorded, the end notification sent and the lease released.
    pub async fn perform(&self, index: &Index) -> ReindexResult<CoordinatorOutcome> {
        if !self.schedule.allows(Utc::now()) {
            info!(index = %index.identifier(), "Outside the reindexing schedule, skipping");
            return Ok(CoordinatorOutcome::OutsideSchedule);
        }

        let Some(token) = self.obtain_lease().await? else {
            return Ok(CoordinatorOutcome::LeaseTaken);
        };
        let result = self.perform_with_lease(index).await;
        self.release_lease(&token).await;
        result
    }

    /// Drops `index` concurrently if the lease is free.
    pub async fn drop(&self, index: &Index) -> ReindexResult<CoordinatorOutcome> {
        let Some(token) = self.obtain_lease().await? else {
            return Ok(CoordinatorOutcome::LeaseTaken);
        };

        info!(index = %index.identifier(), "Removing leftover index");
        let result = async {
            let mut conn = self.database.connect().await?;
            drop_index_concurrently(conn.as_mut(), &self.removal_retries, &index.schema, &index.name)
                .await
        }
        .await;

        self.release_lease(&token).await;
        result.map(|()| CoordinatorOutcome::Dropped)
    }

    async fn perform_with_lease(&self, index: &Index) -> ReindexResult<CoordinatorOutcome> {
        let mut action = ReindexAction::new(index);
        action.start();
        self.history.record(&action).await?;
        self.notifier.notify_start(index, &action).await;

        info!(
            index = %index.identifier(),
            strategy = self.strategy.name(),
            ondisk_size_bytes = index.ondisk_size_bytes,
            bloat_size_bytes = ?index.bloat_size_bytes,
            "Starting reindex"
        );
        let started = Instant::now();
        let result = self.strategy.perform(index).await;

        let rebuilt = match self.reload(index).await {
            Ok(rebuilt) => rebuilt,
            Err(e) => {
                warn!(index = %index.identifier(), error = %e, "Could not re-read index");
                None
            }
        };
        action.finish(rebuilt.as_ref(), result.is_ok());
        let recorded = self.history.record(&action).await;

        match &result {
            Ok(()) => info!(
                index = %index.identifier(),
                ondisk_size_bytes_start = action.ondisk_size_bytes_start,
                ondisk_size_bytes_end = ?action.ondisk_size_bytes_end,
                elapsed = ?started.elapsed(),
                "Finished reindex"
            ),
            Err(e) => warn!(
                index = %index.identifier(),
                error = %e,
                elapsed = ?started.elapsed(),
                "Reindex failed"
            ),
        }

        self.notifier.notify_end(index, &action).await;

        match (result, recorded) {
            (Err(e), Err(record_err)) => {
                warn!(index = %index.identifier(), error = %record_err, "Failed to record action");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(()), Err(record_err)) => Err(record_err),
            (Ok(()), Ok(())) => Ok(CoordinatorOutcome::Performed(action)),
        }
    }

    async fn reload(&self, index: &Index) -> ReindexResult<Option<Index>> {
        let mut conn = self.database.connect().await?;
        conn.find_index(&index.schema, &index.name).await
    }

    async fn obtain_lease(&self) -> ReindexResult<Option<LeaseToken>> {
        let token = self
            .lease
            .try_obtain(REINDEX_LEASE_KEY, self.lease_timeout)
            .await?;
        if token.is_none() {
            info!(key = REINDEX_LEASE_KEY, "Lease not obtained, another process is reindexing");
        }
        Ok(token)
    }

    async fn release_lease(&self, token: &LeaseToken) {
        match self.lease.release(REINDEX_LEASE_KEY, token).await {
            Ok(true) => {}
            Ok(false) => warn!(key = REINDEX_LEASE_KEY, "Lease expired before release"),
            Err(e) => warn!(key = REINDEX_LEASE_KEY, error = %e, "Failed to release lease"),
        }
    }
}
