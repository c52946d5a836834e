//! One automatic reindexing run.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::action::ReindexHistory;
use crate::config::ReindexingConfig;
use crate::coordinator::{Coordinator, StopReason};
use crate::database::ReindexDatabase;
use crate::error::ReindexResult;
use crate::index::Index;
use crate::selection::IndexSelection;

/// Replacement-strategy leftovers found at startup.
///
/// A `tmp_reindex_*` index is either a half-built replacement or, if the run
/// died after the swap, the original index under its temporary name. An
/// `old_reindex_*` index should never survive a run. Neither is dropped
/// automatically.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    /// Leftover indexes, by identifier.
    pub leftovers: Vec<String>,
}

impl RecoveryReport {
    /// Returns true if nothing was found.
    pub fn is_clean(&self) -> bool {
        self.leftovers.is_empty()
    }
}

/// What an automatic run did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReindexingReport {
    /// Startup check result.
    pub recovery: RecoveryReport,
    /// `_ccnew` leftovers dropped.
    pub dropped: Vec<String>,
    /// Indexes rebuilt.
    pub reindexed: Vec<String>,
    /// Set when the run stopped early.
    pub stopped: Option<StopReason>,
}

/// Runs leftover recovery, cleanup and heuristic rebuilds.
#[derive(Debug, Clone)]
pub struct Reindexing {
    database: Arc<dyn ReindexDatabase>,
    coordinator: Coordinator,
    selection: IndexSelection,
    max_indexes_per_invocation: usize,
}

impl Reindexing {
    /// Creates a runner.
    pub fn new(
        database: Arc<dyn ReindexDatabase>,
        coordinator: Coordinator,
        history: Arc<dyn ReindexHistory>,
        config: &ReindexingConfig,
    ) -> Self {
        Self {
            database,
            coordinator,
            selection: IndexSelection::new(config.selection.clone(), history),
            max_indexes_per_invocation: config.max_indexes_per_invocation,
        }
    }

    /// The coordinator used for rebuilds and drops.
    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Recovers, cleans up, then rebuilds up to `max_indexes_per_invocation` indexes.
    pub async fn automatic_reindexing(&self) -> ReindexResult<ReindexingReport> {
        let mut report = ReindexingReport {
            recovery: self.recovery_check().await?,
            ..Default::default()
        };

        let (dropped, stopped) = self.cleanup_leftovers().await?;
        report.dropped = dropped;
        if stopped.is_some() {
            report.stopped = stopped;
            return Ok(report);
        }

        let (reindexed, stopped) = self.perform_with_heuristic().await?;
        report.reindexed = reindexed;
        report.stopped = stopped;

        info!(
            dropped = report.dropped.len(),
            reindexed = report.reindexed.len(),
            stopped = ?report.stopped,
            "Automatic reindexing finished"
        );
        Ok(report)
    }

    /// Lists replacement-strategy leftovers without touching them.
    pub async fn recovery_check(&self) -> ReindexResult<RecoveryReport> {
        let mut conn = self.database.connect().await?;
        let leftovers: Vec<String> = conn
            .list_indexes()
            .await?
            .into_iter()
            .filter(Index::is_replacement_leftover)
            .map(|i| i.identifier())
            .collect();

        for identifier in &leftovers {
            warn!(index = %identifier, "Leftover index from an interrupted rebuild, remove it manually");
        }
        Ok(RecoveryReport { leftovers })
    }

    /// Drops every `_ccnew` leftover through the coordinator.
    ///
    /// Returns the dropped identifiers and, if the lease was taken, why it stopped.
    pub async fn cleanup_leftovers(&self) -> ReindexResult<(Vec<String>, Option<StopReason>)> {
        let mut conn = self.database.connect().await?;
        let leftovers: Vec<Index> = conn
            .list_indexes()
            .await?
            .into_iter()
            .filter(Index::is_native_leftover)
            .collect();
        drop(conn);

        let mut dropped = Vec::new();
        for index in leftovers {
            let outcome = self.coordinator.drop(&index).await?;
            if let Some(reason) = outcome.stop_reason() {
                return Ok((dropped, Some(reason)));
            }
            dropped.push(index.identifier());
        }
        Ok((dropped, None))
    }

    /// Candidates for the configured strategy, most bloated first.
    pub async fn candidates(&self) -> ReindexResult<Vec<Index>> {
        let mut conn = self.database.connect().await?;
        let indexes: Vec<Index> = conn
            .list_indexes()
            .await?
            .into_iter()
            .filter(|i| self.coordinator.strategy().check_supported(i).is_ok())
            .collect();
        self.selection.select(indexes, Utc::now()).await
    }

    /// Rebuilds the top candidates.
    ///
    /// Returns the rebuilt identifiers and, if the run stopped early, why.
    pub async fn perform_with_heuristic(
        &self,
    ) -> ReindexResult<(Vec<String>, Option<StopReason>)> {
        let candidates = self.candidates().await?;
        info!(candidates = candidates.len(), "Selected reindexing candidates");

        let mut reindexed = Vec::new();
        for index in candidates.iter().take(self.max_indexes_per_invocation) {
            let outcome = self.coordinator.perform(index).await?;
            if let Some(reason) = outcome.stop_reason() {
                return Ok((reindexed, Some(reason)));
            }
            reindexed.push(index.identifier());
        }
        Ok((reindexed, None))
    }
}
