//! Picks indexes worth rebuilding.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use tracing::debug;

use crate::action::ReindexHistory;
use crate::config::SelectionConfig;
use crate::error::{ReindexError, ReindexResult};
use crate::index::Index;

/// Filters and ranks rebuild candidates.
///
/// An index qualifies when it is valid, not a rebuild leftover, at least
/// `minimum_index_size` large, and either bloated by at least
/// `minimum_relative_bloat` or at least `large_index_size` large. Indexes with
/// an action started within the cooldown are skipped, as are indexes of
/// restricted tables on any day but the restricted weekday. Survivors are
/// ordered by descending relative bloat.
#[derive(Debug, Clone)]
pub struct IndexSelection {
    config: SelectionConfig,
    history: Arc<dyn ReindexHistory>,
}

impl IndexSelection {
    /// Creates a selection over `history`.
    pub fn new(config: SelectionConfig, history: Arc<dyn ReindexHistory>) -> Self {
        Self { config, history }
    }

    /// The selection rules.
    pub fn config(&self) -> &SelectionConfig {
        &self.config
    }

    /// Returns the qualifying indexes, most bloated first.
    pub async fn select(&self, indexes: Vec<Index>, now: DateTime<Utc>) -> ReindexResult<Vec<Index>> {
        let recent = self.recently_reindexed(now).await?;
        let restricted_day = now.weekday() == self.config.restricted_weekday;

        let mut candidates: Vec<Index> = indexes
            .into_iter()
            .filter(|index| {
                if !self.is_eligible(index) {
                    return false;
                }
                if recent.contains(&index.identifier()) {
                    debug!(index = %index.identifier(), "Skipping index in cooldown");
                    return false;
                }
                if !restricted_day && self.config.restricted_tables.contains(&index.table) {
                    debug!(index = %index.identifier(), "Skipping index of restricted table");
                    return false;
                }
                true
            })
            .collect();

        candidates.sort_by(|a, b| b.relative_bloat().total_cmp(&a.relative_bloat()));
        Ok(candidates)
    }

    /// Size and bloat rules, without history or calendar.
    pub fn is_eligible(&self, index: &Index) -> bool {
        if !index.valid || index.is_replacement_leftover() || index.is_native_leftover() {
            return false;
        }
        if index.ondisk_size_bytes < self.config.minimum_index_size {
            return false;
        }
        index.ondisk_size_bytes >= self.config.large_index_size
            || index.relative_bloat() >= self.config.minimum_relative_bloat
    }

    async fn recently_reindexed(&self, now: DateTime<Utc>) -> ReindexResult<HashSet<String>> {
        let cooldown =
            chrono::Duration::from_std(self.config.cooldown).map_err(|e| ReindexError::Config {
                message: format!("selection.cooldown out of range: {e}"),
            })?;
        let actions = self.history.actions_between(now - cooldown, now).await?;
        Ok(actions.into_iter().map(|a| a.index_identifier).collect())
    }
}
