//! Rebuild by building a replacement and swapping names.
//!
//! 1. `CREATE INDEX CONCURRENTLY tmp_reindex_<oid>` from the original's definition.
//! 2. Re-read the replacement and give up if it is invalid.
//! 3. In one transaction, under lock retries: original to `old_reindex_<oid>`,
//!    replacement to the original name, `old_reindex_<oid>` to `tmp_reindex_<oid>`.
//! 4. `DROP INDEX CONCURRENTLY tmp_reindex_<oid>`, which now holds the original.
//!
//! The renames commit together, so the original always keeps a name. Whatever
//! carries `tmp_reindex_<oid>` when the run ends is dropped, on success and on
//! failure alike.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{RebuildStrategy, drop_index_concurrently};
use crate::config::ReindexingConfig;
use crate::database::{ReindexConnection, ReindexDatabase};
use crate::error::{ReindexError, ReindexResult, UnsupportedReason};
use crate::index::{Index, qualified, quote_ident};
use crate::lock_retries::LockRetries;
use crate::timeouts::with_statement_timeout;

/// Replacement strategy.
#[derive(Debug, Clone)]
pub struct ConcurrentReindex {
    database: Arc<dyn ReindexDatabase>,
    statement_timeout: Duration,
    allow_expression_indexes: bool,
    swap_retries: LockRetries,
    removal_retries: LockRetries,
}

impl ConcurrentReindex {
    /// Creates the strategy.
    pub fn new(database: Arc<dyn ReindexDatabase>, config: &ReindexingConfig) -> Self {
        Self {
            database,
            statement_timeout: config.replacement_statement_timeout,
            allow_expression_indexes: config.allow_expression_indexes,
            swap_retries: LockRetries::new(),
            removal_retries: LockRetries::for_index_removal(),
        }
    }

    /// Uses `swap` for the renames and `removal` for index drops.
    pub fn with_lock_retries(mut self, swap: LockRetries, removal: LockRetries) -> Self {
        self.swap_retries = swap;
        self.removal_retries = removal;
        self
    }

    async fn rebuild(
        &self,
        conn: &mut dyn ReindexConnection,
        index: &Index,
        replacement: &str,
    ) -> ReindexResult<()> {
        let create = replacement_definition(index, replacement)?;

        info!(index = %index.identifier(), replacement, "Creating replacement index");
        with_statement_timeout(conn, self.statement_timeout, &[create]).await?;

        let built = conn.find_index(&index.schema, replacement).await?;
        if !built.as_ref().is_some_and(|b| b.valid) {
            return Err(ReindexError::ReplacementInvalid {
                index: index.identifier(),
                replacement: replacement.to_string(),
            });
        }

        info!(index = %index.identifier(), replacement, "Swapping index names");
        let old = index.old_name();
        let renames = [
            rename(&index.schema, &index.name, &old),
            rename(&index.schema, replacement, &index.name),
            rename(&index.schema, &old, replacement),
        ];
        self.swap_retries.run(conn, &renames).await?;

        if index.expression {
            info!(table = %index.table, "Analyzing table for expression index");
            conn.execute(&format!("ANALYZE {}", qualified(&index.schema, &index.table)))
                .await?;
        }

        drop_index_concurrently(conn, &self.removal_retries, &index.schema, replacement).await
    }

    async fn remove_replacement(
        &self,
        conn: &mut dyn ReindexConnection,
        index: &Index,
        replacement: &str,
    ) -> ReindexResult<()> {
        if conn.find_index(&index.schema, replacement).await?.is_some() {
            warn!(index = %index.identifier(), replacement, "Removing replacement index");
            drop_index_concurrently(conn, &self.removal_retries, &index.schema, replacement)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl RebuildStrategy for ConcurrentReindex {
    fn name(&self) -> &'static str {
        "replacement"
    }

    fn check_supported(&self, index: &Index) -> ReindexResult<()> {
        let reason = if index.unique {
            Some(UnsupportedReason::Unique)
        } else if index.partitioned {
            Some(UnsupportedReason::Partitioned)
        } else if index.exclusion {
            Some(UnsupportedReason::Exclusion)
        } else if index.expression && !self.allow_expression_indexes {
            Some(UnsupportedReason::Expression)
        } else if index.is_replacement_leftover() || index.is_native_leftover() {
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
        let replacement = index.replacement_name();

        for name in [replacement.clone(), index.old_name()] {
            if conn.find_index(&index.schema, &name).await?.is_some() {
                return Err(ReindexError::LeftoverTemporaryIndex {
                    index: format!("{}.{}", index.schema, name),
                });
            }
        }

        let result = self.rebuild(conn.as_mut(), index, &replacement).await;
        if let Err(e) = &result {
            warn!(index = %index.identifier(), error = %e, "Rebuild failed, cleaning up");
        }

        let cleanup = self
            .remove_replacement(conn.as_mut(), index, &replacement)
            .await;
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

fn rename(schema: &str, from: &str, to: &str) -> String {
    format!(
        "ALTER INDEX {} RENAME TO {}",
        qualified(schema, from),
        quote_ident(to)
    )
}

/// Turns the original's `CREATE INDEX <name> ON ...` into a concurrent
/// build of `replacement`.
pub(crate) fn replacement_definition(index: &Index, replacement: &str) -> ReindexResult<String> {
    let invalid = || ReindexError::InvalidDefinition {
        index: index.identifier(),
    };

    let rest = index
        .definition
        .strip_prefix("CREATE INDEX ")
        .ok_or_else(invalid)?;
    let rest = rest
        .strip_prefix(&quote_ident(&index.name))
        .or_else(|| rest.strip_prefix(index.name.as_str()))
        .ok_or_else(invalid)?;
    let rest = rest.strip_prefix(" ON ").ok_or_else(invalid)?;

    Ok(format!(
        "CREATE INDEX CONCURRENTLY {} ON {}",
        quote_ident(replacement),
        rest
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::tests::index;

    #[test]
    fn test_replacement_definition() {
        let idx = index("index_users_on_email");
        assert_eq!(
            replacement_definition(&idx, "tmp_reindex_16384").unwrap(),
            "CREATE INDEX CONCURRENTLY \"tmp_reindex_16384\" ON public.users USING btree (email)"
        );
    }

    #[test]
    fn test_replacement_definition_quoted_name() {
        let mut idx = index("Mixed Case");
        idx.definition = "CREATE INDEX \"Mixed Case\" ON public.users USING btree (email)".to_string();
        assert_eq!(
            replacement_definition(&idx, "tmp_reindex_1").unwrap(),
            "CREATE INDEX CONCURRENTLY \"tmp_reindex_1\" ON public.users USING btree (email)"
        );
    }

    #[test]
    fn test_replacement_definition_rejects_unique() {
        let mut idx = index("index_users_on_email");
        idx.definition =
            "CREATE UNIQUE INDEX index_users_on_email ON public.users USING btree (email)"
                .to_string();
        assert!(matches!(
            replacement_definition(&idx, "tmp_reindex_1"),
            Err(ReindexError::InvalidDefinition { .. })
        ));
    }

    #[test]
    fn test_rename_statement() {
        assert_eq!(
            rename("public", "a", "b"),
            "ALTER INDEX \"public\".\"a\" RENAME TO \"b\""
        );
    }
}
