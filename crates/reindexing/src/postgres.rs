//! PostgreSQL catalog, history and lease implementations.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Object, Pool};
use tokio_postgres::Row;
use uuid::Uuid;

use crate::action::{ActionState, ReindexAction, ReindexHistory};
use crate::database::{ReindexConnection, ReindexDatabase};
use crate::error::{ReindexError, ReindexResult};
use crate::index::Index;
use crate::lease::{ExclusiveLease, LeaseToken};

const INDEX_COLUMNS: &str = "\
    SELECT c.oid::bigint AS oid, \
           n.nspname AS schema, \
           c.relname AS name, \
           t.relname AS tablename, \
           pg_get_indexdef(c.oid) AS definition, \
           x.indisunique AS is_unique, \
           x.indisvalid AS is_valid, \
           c.relkind = 'I' AS partitioned, \
           EXISTS (SELECT 1 FROM pg_constraint con \
                   WHERE con.conindid = c.oid AND con.contype = 'x') AS exclusion, \
           x.indexprs IS NOT NULL AS expression, \
           pg_relation_size(c.oid)::bigint AS ondisk_size_bytes";

const INDEX_FROM: &str = "\
    FROM pg_index x \
    JOIN pg_class c ON c.oid = x.indexrelid \
    JOIN pg_class t ON t.oid = x.indrelid \
    JOIN pg_namespace n ON n.oid = c.relnamespace";

const USER_SCHEMAS: &str =
    "n.nspname NOT IN ('pg_catalog', 'information_schema') AND n.nspname !~ '^pg_toast'";

/// Estimated btree bloat per index, from table statistics.
const BTREE_BLOAT: &str = "\
WITH bloat AS (
  SELECT idxoid,
         GREATEST(bs * (relpages - est_pages_ff), 0)::bigint AS bloat_size_bytes
  FROM (
    SELECT idxoid, bs, relpages,
           COALESCE(1 + CEIL(reltuples / FLOOR((bs - pageopqdata - pagehdr) * fillfactor
             / (100 * (4 + nulldatahdrwidth)::float))), 0) AS est_pages_ff
    FROM (
      SELECT bs, reltuples, relpages, idxoid, fillfactor, pagehdr, pageopqdata,
             (index_tuple_hdr_bm + maxalign
               - CASE WHEN index_tuple_hdr_bm % maxalign = 0 THEN maxalign
                      ELSE index_tuple_hdr_bm % maxalign END
               + nulldatawidth + maxalign
               - CASE WHEN nulldatawidth = 0 THEN 0
                      WHEN nulldatawidth::integer % maxalign = 0 THEN maxalign
                      ELSE nulldatawidth::integer % maxalign END
             )::numeric AS nulldatahdrwidth
      FROM (
        SELECT i.idxoid, i.reltuples, i.relpages, i.fillfactor,
               current_setting('block_size')::numeric AS bs,
               8 AS maxalign, 24 AS pagehdr, 16 AS pageopqdata,
               CASE WHEN max(COALESCE(s.null_frac, 0)) = 0 THEN 8
                    ELSE 8 + ((32 + 8 - 1) / 8) END AS index_tuple_hdr_bm,
               sum((1 - COALESCE(s.null_frac, 0)) * COALESCE(s.avg_width, 1024)) AS nulldatawidth
        FROM (
          SELECT ct.relnamespace, ic.reltuples, ic.relpages, ic.idxoid, ic.fillfactor,
                 COALESCE(a1.attname, a2.attname) AS attname,
                 CASE WHEN a1.attnum IS NULL THEN ic.idxname ELSE ct.relname END AS attrelname
          FROM (
            SELECT idxname, reltuples, relpages, tbloid, idxoid, fillfactor, indkey,
                   generate_series(1, indnatts) AS attpos
            FROM (
              SELECT ci.relname AS idxname, ci.reltuples, ci.relpages,
                     x.indrelid AS tbloid, x.indexrelid AS idxoid,
                     COALESCE(substring(array_to_string(ci.reloptions, ' ')
                       FROM 'fillfactor=([0-9]+)')::smallint, 90) AS fillfactor,
                     x.indnatts,
                     string_to_array(textin(int2vectorout(x.indkey)), ' ')::int[] AS indkey
              FROM pg_index x
              JOIN pg_class ci ON ci.oid = x.indexrelid
              WHERE ci.relam = (SELECT oid FROM pg_am WHERE amname = 'btree')
                AND ci.relpages > 0
            ) AS idx_data
          ) AS ic
          JOIN pg_class ct ON ct.oid = ic.tbloid
          LEFT JOIN pg_attribute a1 ON ic.indkey[ic.attpos] <> 0
            AND a1.attrelid = ic.tbloid AND a1.attnum = ic.indkey[ic.attpos]
          LEFT JOIN pg_attribute a2 ON ic.indkey[ic.attpos] = 0
            AND a2.attrelid = ic.idxoid AND a2.attnum = ic.attpos
        ) i
        JOIN pg_namespace n ON n.oid = i.relnamespace
        JOIN pg_stats s ON s.schemaname = n.nspname
          AND s.tablename = i.attrelname AND s.attname = i.attname
        GROUP BY 1, 2, 3, 4, 5, 6, 7, 8
      ) AS rows_data_stats
    ) AS rows_hdr_pdg_stats
  ) AS relation_stats
)";

/// Catalog query listing every user index with its bloat estimate.
pub fn list_indexes_sql() -> String {
    format!(
        "{BTREE_BLOAT} {INDEX_COLUMNS}, b.bloat_size_bytes {INDEX_FROM} \
         LEFT JOIN bloat b ON b.idxoid = c.oid \
         WHERE {USER_SCHEMAS} ORDER BY n.nspname, c.relname"
    )
}

/// Catalog query for one index by schema and name.
pub fn find_index_sql() -> String {
    format!(
        "{INDEX_COLUMNS}, NULL::bigint AS bloat_size_bytes {INDEX_FROM} \
         WHERE n.nspname = $1 AND c.relname = $2"
    )
}

/// Catalog query for indexes of a schema by name prefix.
pub fn indexes_with_prefix_sql() -> String {
    format!(
        "{INDEX_COLUMNS}, NULL::bigint AS bloat_size_bytes {INDEX_FROM} \
         WHERE n.nspname = $1 AND starts_with(c.relname, $2) ORDER BY c.relname"
    )
}

fn index_from_row(row: &Row) -> ReindexResult<Index> {
    let oid: i64 = row.try_get("oid")?;
    let ondisk: i64 = row.try_get("ondisk_size_bytes")?;
    let bloat: Option<i64> = row.try_get("bloat_size_bytes")?;

    Ok(Index {
        oid: u32::try_from(oid).map_err(|e| ReindexError::database(format!("bad oid: {e}")))?,
        schema: row.try_get("schema")?,
        name: row.try_get("name")?,
        table: row.try_get("tablename")?,
        definition: row.try_get("definition")?,
        unique: row.try_get("is_unique")?,
        valid: row.try_get("is_valid")?,
        partitioned: row.try_get("partitioned")?,
        exclusion: row.try_get("exclusion")?,
        expression: row.try_get("expression")?,
        ondisk_size_bytes: u64::try_from(ondisk).unwrap_or(0),
        bloat_size_bytes: bloat.map(|b| u64::try_from(b).unwrap_or(0)),
    })
}

/// [`ReindexDatabase`] over a pool connected to the primary.
#[derive(Clone)]
pub struct PgReindexDatabase {
    pool: Pool,
}

impl std::fmt::Debug for PgReindexDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgReindexDatabase")
            .field("status", &self.pool.status())
            .finish()
    }
}

impl PgReindexDatabase {
    /// Creates a database handle using `pool`.
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReindexDatabase for PgReindexDatabase {
    async fn connect(&self) -> ReindexResult<Box<dyn ReindexConnection>> {
        let client = self.pool.get().await?;
        Ok(Box::new(PgReindexConnection { client }))
    }
}

/// A pooled session used by one rebuild.
pub struct PgReindexConnection {
    client: Object,
}

#[async_trait]
impl ReindexConnection for PgReindexConnection {
    async fn execute(&mut self, sql: &str) -> ReindexResult<()> {
        self.client.batch_execute(sql).await?;
        Ok(())
    }

    async fn find_index(&mut self, schema: &str, name: &str) -> ReindexResult<Option<Index>> {
        let row = self
            .client
            .query_opt(&find_index_sql(), &[&schema, &name])
            .await?;
        row.as_ref().map(index_from_row).transpose()
    }

    async fn indexes_with_prefix(
        &mut self,
        schema: &str,
        prefix: &str,
    ) -> ReindexResult<Vec<Index>> {
        let rows = self
            .client
            .query(&indexes_with_prefix_sql(), &[&schema, &prefix])
            .await?;
        rows.iter().map(index_from_row).collect()
    }

    async fn list_indexes(&mut self) -> ReindexResult<Vec<Index>> {
        let rows = self.client.query(&list_indexes_sql(), &[]).await?;
        rows.iter().map(index_from_row).collect()
    }
}

/// [`ReindexHistory`] stored in `postgres_reindex_actions`.
#[derive(Clone)]
pub struct PgReindexHistory {
    pool: Pool,
}

impl std::fmt::Debug for PgReindexHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgReindexHistory").finish_non_exhaustive()
    }
}

impl PgReindexHistory {
    /// Creates a history using `pool`.
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Creates the backing table if it does not exist.
    pub async fn ensure_table(&self) -> ReindexResult<()> {
        let client = self.client().await?;
        client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS postgres_reindex_actions (
                    id UUID PRIMARY KEY,
                    index_identifier TEXT NOT NULL,
                    action_start TIMESTAMPTZ NOT NULL,
                    action_end TIMESTAMPTZ,
                    ondisk_size_bytes_start BIGINT NOT NULL,
                    ondisk_size_bytes_end BIGINT,
                    bloat_estimate_bytes_start BIGINT,
                    state TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS index_postgres_reindex_actions_on_identifier_and_start
                    ON postgres_reindex_actions (index_identifier, action_start);",
            )
            .await
            .map_err(history_error)
    }

    async fn client(&self) -> ReindexResult<Object> {
        self.pool.get().await.map_err(|e| ReindexError::History {
            message: e.to_string(),
        })
    }
}

const ACTION_COLUMNS: &str = "id, index_identifier, action_start, action_end, \
    ondisk_size_bytes_start, ondisk_size_bytes_end, bloat_estimate_bytes_start, state";

fn action_from_row(row: &Row) -> ReindexResult<ReindexAction> {
    let state: String = row.try_get("state").map_err(history_error)?;
    let ondisk_start: i64 = row.try_get("ondisk_size_bytes_start").map_err(history_error)?;
    let ondisk_end: Option<i64> = row.try_get("ondisk_size_bytes_end").map_err(history_error)?;
    let bloat_start: Option<i64> = row
        .try_get("bloat_estimate_bytes_start")
        .map_err(history_error)?;

    Ok(ReindexAction {
        id: row.try_get::<_, Uuid>("id").map_err(history_error)?,
        index_identifier: row.try_get("index_identifier").map_err(history_error)?,
        action_start: row.try_get("action_start").map_err(history_error)?,
        action_end: row.try_get("action_end").map_err(history_error)?,
        ondisk_size_bytes_start: u64::try_from(ondisk_start).unwrap_or(0),
        ondisk_size_bytes_end: ondisk_end.map(|b| u64::try_from(b).unwrap_or(0)),
        bloat_estimate_bytes_start: bloat_start.map(|b| u64::try_from(b).unwrap_or(0)),
        state: state
            .parse::<ActionState>()
            .map_err(|message| ReindexError::History { message })?,
    })
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl ReindexHistory for PgReindexHistory {
    async fn record(&self, action: &ReindexAction) -> ReindexResult<()> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO postgres_reindex_actions (id, index_identifier, action_start, \
                     action_end, ondisk_size_bytes_start, ondisk_size_bytes_end, \
                     bloat_estimate_bytes_start, state) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
                 ON CONFLICT (id) DO UPDATE SET \
                     action_end = EXCLUDED.action_end, \
                     ondisk_size_bytes_end = EXCLUDED.ondisk_size_bytes_end, \
                     state = EXCLUDED.state",
                &[
                    &action.id,
                    &action.index_identifier,
                    &action.action_start,
                    &action.action_end,
                    &to_i64(action.ondisk_size_bytes_start),
                    &action.ondisk_size_bytes_end.map(to_i64),
                    &action.bloat_estimate_bytes_start.map(to_i64),
                    &action.state.as_str(),
                ],
            )
            .await
            .map_err(history_error)?;
        Ok(())
    }

    async fn actions_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> ReindexResult<Vec<ReindexAction>> {
        let client = self.client().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {ACTION_COLUMNS} FROM postgres_reindex_actions \
                     WHERE action_start >= $1 AND action_start < $2 ORDER BY action_start"
                ),
                &[&from, &to],
            )
            .await
            .map_err(history_error)?;
        rows.iter().map(action_from_row).collect()
    }

    async fn actions_for(
        &self,
        index_identifier: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> ReindexResult<Vec<ReindexAction>> {
        let client = self.client().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {ACTION_COLUMNS} FROM postgres_reindex_actions \
                     WHERE index_identifier = $1 AND action_start >= $2 AND action_start < $3 \
                     ORDER BY action_start"
                ),
                &[&index_identifier, &from, &to],
            )
            .await
            .map_err(history_error)?;
        rows.iter().map(action_from_row).collect()
    }
}

fn history_error(err: tokio_postgres::Error) -> ReindexError {
    ReindexError::History {
        message: err.to_string(),
    }
}

/// [`ExclusiveLease`] stored in `exclusive_leases`.
#[derive(Clone)]
pub struct PgLease {
    pool: Pool,
}

impl std::fmt::Debug for PgLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgLease").finish_non_exhaustive()
    }
}

impl PgLease {
    /// Creates a lease store using `pool`, which must point at the primary.
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Creates the backing table if it does not exist.
    pub async fn ensure_table(&self) -> ReindexResult<()> {
        let client = self.client().await?;
        client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS exclusive_leases (
                    key TEXT PRIMARY KEY,
                    token TEXT NOT NULL,
                    expires_at TIMESTAMPTZ NOT NULL
                )",
            )
            .await
            .map_err(lease_error)
    }

    async fn client(&self) -> ReindexResult<Object> {
        self.pool.get().await.map_err(|e| ReindexError::Lease {
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl ExclusiveLease for PgLease {
    async fn try_obtain(&self, key: &str, timeout: Duration) -> ReindexResult<Option<LeaseToken>> {
        let client = self.client().await?;
        let token = LeaseToken::generate();
        let row = client
            .query_opt(
                "INSERT INTO exclusive_leases (key, token, expires_at) \
                 VALUES ($1, $2, now() + make_interval(secs => $3)) \
                 ON CONFLICT (key) DO UPDATE \
                 SET token = EXCLUDED.token, expires_at = EXCLUDED.expires_at \
                 WHERE exclusive_leases.expires_at <= now() \
                 RETURNING token",
                &[&key, &token.as_str(), &timeout.as_secs_f64()],
            )
            .await
            .map_err(lease_error)?;
        Ok(row.map(|_| token))
    }

    async fn release(&self, key: &str, token: &LeaseToken) -> ReindexResult<bool> {
        let client = self.client().await?;
        let deleted = client
            .execute(
                "DELETE FROM exclusive_leases WHERE key = $1 AND token = $2",
                &[&key, &token.as_str()],
            )
            .await
            .map_err(lease_error)?;
        Ok(deleted > 0)
    }
}

fn lease_error(err: tokio_postgres::Error) -> ReindexError {
    ReindexError::Lease {
        message: err.to_string(),
    }
}
