//! The query router.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{LbResult, LoadBalancingError};
use crate::load_balancer::{LoadBalancer, RoutedResult};
use crate::node::{DbRole, NodeConnection};
use crate::query::{Query, QueryKind};
use crate::session::Session;

/// Routes each query to the primary or a replica based on its kind and the
/// caller's [`Session`].
///
/// # Example
///
/// ```ignore
/// let proxy = ConnectionProxy::new(load_balancer);
/// let mut session = Session::new();
///
/// proxy.execute(&mut session, &Query::new("SELECT * FROM users")).await?;       // replica
/// proxy.execute(&mut session, &Query::new("UPDATE users SET name = 'x'")).await?; // primary
/// proxy.execute(&mut session, &Query::new("SELECT * FROM users")).await?;       // primary
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionProxy {
    load_balancer: Arc<LoadBalancer>,
}

impl ConnectionProxy {
    /// Creates a router over `load_balancer`.
    pub fn new(load_balancer: Arc<LoadBalancer>) -> Self {
        Self { load_balancer }
    }

    /// The underlying load balancer.
    pub fn load_balancer(&self) -> &Arc<LoadBalancer> {
        &self.load_balancer
    }

    /// Runs a single statement outside an explicit transaction.
    ///
    /// Transaction control statements are rejected; use
    /// [`transaction`](Self::transaction) instead.
    pub async fn execute(&self, session: &mut Session, query: &Query) -> LbResult<RoutedResult> {
        match query.kind() {
            QueryKind::Transaction => Err(LoadBalancingError::TransactionStatement {
                sql: query.sql().to_string(),
            }),
            QueryKind::Read => self.read(session, query).await,
            QueryKind::LockingRead | QueryKind::StickyWrite => {
                self.write(session, query, true).await
            }
            QueryKind::Write => {
                if session.fallback_to_replicas_for_ambiguous_queries() {
                    self.load_balancer.read(query.sql()).await
                } else {
                    self.write(session, query, false).await
                }
            }
        }
    }

    /// Begins a transaction on the primary.
    ///
    /// Every statement in the transaction runs on the primary, and the session
    /// stays pinned to it afterwards.
    pub async fn transaction<'s>(
        &'s self,
        session: &'s mut Session,
    ) -> LbResult<ProxyTransaction<'s>> {
        session.write();
        let mut conn = self.load_balancer.primary_connection().await?;
        conn.query("BEGIN").await?;
        session.enter_transaction();
        debug!(depth = session.transaction_depth(), "Transaction started on primary");

        Ok(ProxyTransaction {
            load_balancer: &self.load_balancer,
            session,
            conn: Some(conn),
            savepoints: 0,
        })
    }

    async fn read(&self, session: &mut Session, query: &Query) -> LbResult<RoutedResult> {
        if session.use_replicas_for_read_queries() {
            return self.load_balancer.read(query.sql()).await;
        }

        if session.using_primary() || session.in_transaction() {
            return self.load_balancer.read_write(query.sql()).await;
        }

        if let Some(location) = session.last_write_location() {
            if !self.load_balancer.all_caught_up(&location).await {
                return self.load_balancer.read_write(query.sql()).await;
            }
            session.clear_last_write_location();
        }

        self.load_balancer.read(query.sql()).await
    }

    async fn write(
        &self,
        session: &mut Session,
        query: &Query,
        sticky: bool,
    ) -> LbResult<RoutedResult> {
        if sticky {
            session.write();
        }

        let result = self.load_balancer.read_write(query.sql()).await?;

        if query.tracks_location() && !session.in_transaction() {
            record_write_location(&self.load_balancer, session).await;
        }

        Ok(result)
    }
}

/// A transaction on the primary, holding the session for its duration.
///
/// Dropping a transaction that was neither committed nor rolled back closes
/// its connection instead of returning it to the pool, which makes the server
/// roll it back.
pub struct ProxyTransaction<'s> {
    load_balancer: &'s Arc<LoadBalancer>,
    session: &'s mut Session,
    conn: Option<Box<dyn NodeConnection>>,
    savepoints: usize,
}

impl std::fmt::Debug for ProxyTransaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyTransaction")
            .field("active", &self.conn.is_some())
            .field("savepoints", &self.savepoints)
            .finish_non_exhaustive()
    }
}

impl ProxyTransaction<'_> {
    /// Runs a statement inside the transaction.
    pub async fn execute(&mut self, query: &Query) -> LbResult<RoutedResult> {
        if query.kind() == QueryKind::Transaction {
            return Err(LoadBalancingError::TransactionStatement {
                sql: query.sql().to_string(),
            });
        }
        if query.kind().is_sticky() {
            self.session.write();
        }

        let result = self.connection()?.query(query.sql()).await?;
        Ok(RoutedResult {
            role: DbRole::Primary,
            address: self.load_balancer.primary().address().to_string(),
            result,
        })
    }

    /// The session this transaction belongs to.
    pub fn session(&self) -> &Session {
        &*self.session
    }

    /// Opens a nested savepoint.
    pub async fn savepoint(&mut self, name: &str) -> LbResult<()> {
        let sql = format!("SAVEPOINT {}", quote_ident(name));
        self.connection()?.query(&sql).await?;
        self.savepoints += 1;
        self.session.enter_transaction();
        Ok(())
    }

    /// Releases a savepoint opened with [`savepoint`](Self::savepoint).
    pub async fn release_savepoint(&mut self, name: &str) -> LbResult<()> {
        let sql = format!("RELEASE SAVEPOINT {}", quote_ident(name));
        self.connection()?.query(&sql).await?;
        self.leave_savepoint();
        Ok(())
    }

    /// Rolls back to a savepoint and releases it.
    pub async fn rollback_to_savepoint(&mut self, name: &str) -> LbResult<()> {
        let name = quote_ident(name);
        let sql = format!("ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name}");
        self.connection()?.query(&sql).await?;
        self.leave_savepoint();
        Ok(())
    }

    /// Commits the transaction and records the primary write location once
    /// the outermost transaction has ended.
    pub async fn commit(mut self) -> LbResult<()> {
        self.finish("COMMIT").await?;
        if !self.session.in_transaction() && self.session.performed_write() {
            record_write_location(self.load_balancer, self.session).await;
        }
        Ok(())
    }

    /// Rolls the transaction back.
    pub async fn rollback(mut self) -> LbResult<()> {
        self.finish("ROLLBACK").await
    }

    async fn finish(&mut self, sql: &str) -> LbResult<()> {
        let mut conn = self.conn.take().ok_or(LoadBalancingError::TransactionClosed)?;
        let result = conn.query(sql).await;
        self.unwind_depth();
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                conn.detach();
                Err(e)
            }
        }
    }

    fn connection(&mut self) -> LbResult<&mut Box<dyn NodeConnection>> {
        self.conn.as_mut().ok_or(LoadBalancingError::TransactionClosed)
    }

    fn leave_savepoint(&mut self) {
        if self.savepoints > 0 {
            self.savepoints -= 1;
            self.session.leave_transaction();
        }
    }

    fn unwind_depth(&mut self) {
        for _ in 0..=self.savepoints {
            self.session.leave_transaction();
        }
        self.savepoints = 0;
    }
}

impl Drop for ProxyTransaction<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!("Transaction dropped without commit or rollback, closing connection");
            self.unwind_depth();
            conn.detach();
        }
    }
}

async fn record_write_location(load_balancer: &LoadBalancer, session: &mut Session) {
    match load_balancer.primary_write_location().await {
        Ok(location) => session.set_last_write_location(location),
        Err(e) => {
            warn!(error = %e, "Could not read primary write location, pinning session");
            session.use_primary();
        }
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
