//! Seams between the rebuild logic and the database.

use std::fmt::Debug;

use async_trait::async_trait;

use crate::error::ReindexResult;
use crate::index::Index;

/// A dedicated session on the primary.
///
/// Rebuilds change session settings such as `statement_timeout`, so each
/// operation holds one connection from start to end.
#[async_trait]
pub trait ReindexConnection: Send {
    /// Executes one statement.
    async fn execute(&mut self, sql: &str) -> ReindexResult<()>;

    /// Looks up an index by schema and name.
    async fn find_index(&mut self, schema: &str, name: &str) -> ReindexResult<Option<Index>>;

    /// Lists the indexes in `schema` whose name starts with `prefix`.
    ///
    /// Bloat is not estimated.
    async fn indexes_with_prefix(
        &mut self,
        schema: &str,
        prefix: &str,
    ) -> ReindexResult<Vec<Index>>;

    /// Lists every user index with its bloat estimate.
    async fn list_indexes(&mut self) -> ReindexResult<Vec<Index>>;
}

/// Hands out connections to the primary.
#[async_trait]
pub trait ReindexDatabase: Send + Sync + Debug {
    /// Opens a session.
    async fn connect(&self) -> ReindexResult<Box<dyn ReindexConnection>>;
}
