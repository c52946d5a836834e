//! A single replica and its cached health state.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::LoadBalancingConfig;
use crate::error::LbResult;
use crate::location::WalLocation;
use crate::node::{Node, NodeConnection, QueryResult};

/// How often [`Host::disconnect`] polls for busy connections.
const DISCONNECT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// A replica known to the load balancer.
///
/// The online status is cached for `replica_check_interval` (plus jitter so a
/// fleet of processes does not check all replicas at the same moment). Any
/// failure while checking counts as "not up to date" rather than an error.
pub struct Host {
    node: Arc<dyn Node>,
    primary: Arc<dyn Node>,
    config: Arc<LoadBalancingConfig>,
    state: Mutex<HostState>,
}

#[derive(Debug)]
struct HostState {
    online: bool,
    last_checked_at: Instant,
    check_after: Duration,
    lag_time: Option<Duration>,
    lag_size: Option<u64>,
}

/// Point-in-time view of a host's health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostStatus {
    /// Replica address.
    pub address: String,
    /// Cached online flag.
    pub online: bool,
    /// Last measured replication lag in time.
    pub lag_time: Option<Duration>,
    /// Last measured replication lag in bytes.
    pub lag_size: Option<u64>,
    /// Connections currently checked out.
    pub busy_connections: usize,
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("address", &self.node.address())
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl Host {
    /// Creates a host for `node`. It starts out online.
    pub fn new(
        node: Arc<dyn Node>,
        primary: Arc<dyn Node>,
        config: Arc<LoadBalancingConfig>,
    ) -> Self {
        let check_after = jittered_interval(config.replica_check_interval);
        Self {
            node,
            primary,
            config,
            state: Mutex::new(HostState {
                online: true,
                last_checked_at: Instant::now(),
                check_after,
                lag_time: None,
                lag_size: None,
            }),
        }
    }

    /// The replica's address.
    pub fn address(&self) -> &str {
        self.node.address()
    }

    /// Checks out a connection from this replica's pool.
    pub async fn connection(&self) -> LbResult<Box<dyn NodeConnection>> {
        self.node.connect().await
    }

    /// Runs `sql` on this replica.
    pub async fn query(&self, sql: &str) -> LbResult<QueryResult> {
        let mut conn = self.node.connect().await?;
        conn.query(sql).await
    }

    /// Returns the cached online status, refreshing it first if it is stale.
    pub async fn online(&self) -> bool {
        let (online, stale) = {
            let state = self.state.lock();
            (
                state.online,
                state.last_checked_at.elapsed() >= state.check_after,
            )
        };

        if !stale {
            return online;
        }

        self.refresh_status().await;
        self.state.lock().online
    }

    /// Measures replication lag and updates the online status.
    pub async fn refresh_status(&self) {
        let (lag_time, lag_size) = self.measure_lag().await;
        let up_to_date =
            self.lag_time_below_threshold(lag_time) || self.lag_size_below_threshold(lag_size);

        let was_online = {
            let mut state = self.state.lock();
            let was_online = state.online;
            state.online = up_to_date;
            state.lag_time = lag_time;
            state.lag_size = lag_size;
            state.last_checked_at = Instant::now();
            state.check_after = jittered_interval(self.config.replica_check_interval);
            was_online
        };

        if up_to_date && !was_online {
            info!(host = %self.address(), ?lag_time, ?lag_size, "Host back online");
        } else if !up_to_date && was_online {
            warn!(host = %self.address(), ?lag_time, ?lag_size, "Host lagging behind primary");
        } else {
            debug!(host = %self.address(), online = up_to_date, "Host status refreshed");
        }
    }

    /// Marks the host offline and drops its idle connections.
    pub fn offline(&self) {
        {
            let mut state = self.state.lock();
            state.online = false;
        }
        warn!(host = %self.address(), "Host marked offline");
        self.node.disconnect();
    }

    /// Returns true if the replica has replayed WAL up to `location`.
    ///
    /// Connection or query failures count as not caught up.
    pub async fn caught_up(&self, location: &WalLocation) -> bool {
        let mut conn = match self.node.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                debug!(host = %self.address(), error = %e, "Caught-up check failed to connect");
                return false;
            }
        };
        match conn.caught_up(location).await {
            Ok(caught_up) => caught_up,
            Err(e) => {
                debug!(host = %self.address(), error = %e, "Caught-up check failed");
                false
            }
        }
    }

    /// Waits up to `timeout` for busy connections to be returned, then closes the pool.
    pub async fn disconnect(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;

        loop {
            let busy = self.node.busy_connections();
            if busy == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(host = %self.address(), busy, "Forcing disconnect with busy connections");
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(DISCONNECT_POLL_INTERVAL.min(remaining)).await;
        }

        self.node.disconnect();
        debug!(host = %self.address(), "Host disconnected");
    }

    /// Returns the host's last known health.
    pub fn status(&self) -> HostStatus {
        let state = self.state.lock();
        HostStatus {
            address: self.address().to_string(),
            online: state.online,
            lag_time: state.lag_time,
            lag_size: state.lag_size,
            busy_connections: self.node.busy_connections(),
        }
    }

    async fn measure_lag(&self) -> (Option<Duration>, Option<u64>) {
        let mut conn = match self.node.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                debug!(host = %self.address(), error = %e, "Status check failed to connect");
                return (None, None);
            }
        };

        let lag_time = conn.replication_lag_time().await.unwrap_or_else(|e| {
            debug!(host = %self.address(), error = %e, "Replication lag time query failed");
            None
        });

        let lag_size = match self.primary_write_location().await {
            Some(primary) => conn.replication_lag_size(&primary).await.unwrap_or_else(|e| {
                debug!(host = %self.address(), error = %e, "Replication lag size query failed");
                None
            }),
            None => None,
        };

        (lag_time, lag_size)
    }

    async fn primary_write_location(&self) -> Option<WalLocation> {
        let mut conn = self.primary.connect().await.ok()?;
        conn.current_write_location().await.ok().flatten()
    }

    fn lag_time_below_threshold(&self, lag_time: Option<Duration>) -> bool {
        lag_time.is_some_and(|lag| lag < self.config.max_replication_lag_time)
    }

    fn lag_size_below_threshold(&self, lag_size: Option<u64>) -> bool {
        lag_size.is_some_and(|lag| lag <= self.config.max_replication_difference)
    }
}

/// Picks a check interval between `interval` and twice `interval`.
fn jittered_interval(interval: Duration) -> Duration {
    if interval.is_zero() {
        return interval;
    }
    let extra_ms = rand::thread_rng().gen_range(0..=interval.as_millis() as u64);
    interval + Duration::from_millis(extra_ms)
}
