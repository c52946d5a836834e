//! Index rebuild strategies.
//!
//! Both strategies keep the table readable and writable while they run. A
//! strategy that fails removes what it built before returning the error, so
//! a failed run never leaves more than the original index behind.

mod concurrent_reindex;
mod reindex_concurrently;

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

pub use concurrent_reindex::ConcurrentReindex;
pub use reindex_concurrently::ReindexConcurrently;

use crate::config::{ReindexingConfig, StrategyKind};
use crate::database::{ReindexConnection, ReindexDatabase};
use crate::error::ReindexResult;
use crate::index::{Index, qualified};
use crate::lock_retries::LockRetries;

/// Rebuilds one index without blocking writes.
#[async_trait]
pub trait RebuildStrategy: Send + Sync + Debug {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Fails with the reason if this strategy cannot rebuild `index`.
    fn check_supported(&self, index: &Index) -> ReindexResult<()>;

    /// Rebuilds `index`.
    async fn perform(&self, index: &Index) -> ReindexResult<()>;
}

/// Creates the strategy selected by `config`.
pub fn build_strategy(
    database: Arc<dyn ReindexDatabase>,
    config: &ReindexingConfig,
) -> Arc<dyn RebuildStrategy> {
    match config.strategy {
        StrategyKind::Replacement => Arc::new(ConcurrentReindex::new(database, config)),
        StrategyKind::Native => Arc::new(ReindexConcurrently::new(database, config)),
    }
}

/// Drops an index concurrently if it exists, retrying on lock timeouts.
pub async fn drop_index_concurrently(
    conn: &mut dyn ReindexConnection,
    retries: &LockRetries,
    schema: &str,
    name: &str,
) -> ReindexResult<()> {
    info!(schema, index = name, "Dropping index");
    retries
        .run(
            conn,
            &[format!(
                "DROP INDEX CONCURRENTLY IF EXISTS {}",
                qualified(schema, name)
            )],
        )
        .await
}
