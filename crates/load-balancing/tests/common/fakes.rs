//! In-memory fakes for nodes, resolvers and error trackers.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use helios_load_balancing::{
    ErrorTracker, LbResult, LoadBalancingError, Node, NodeConnection, NodeFactory, QueryResult,
    Resolution, Resolver, ServiceAddress, WalLocation,
};

/// Failure injected into the next query on a fake node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeFailure {
    /// The connection drops.
    Connection,
    /// A recovery conflict (SQLSTATE 40001).
    Conflict,
    /// Any other query error.
    Syntax,
}

#[derive(Debug, Default)]
struct FakeNodeState {
    reachable: bool,
    lag_time: Option<Duration>,
    lag_size: Option<u64>,
    replayed: Option<WalLocation>,
    write_location: Option<WalLocation>,
    failures: VecDeque<FakeFailure>,
    executed: Vec<String>,
    query_attempts: usize,
    caught_up_checks: usize,
    disconnects: usize,
    detached: usize,
    busy: usize,
}

/// A database node held entirely in memory.
#[derive(Debug, Clone)]
pub struct FakeNode {
    address: String,
    state: Arc<Mutex<FakeNodeState>>,
}

impl FakeNode {
    /// A reachable primary at WAL location `0/1000`.
    pub fn primary(address: &str) -> Arc<Self> {
        Arc::new(Self {
            address: address.to_string(),
            state: Arc::new(Mutex::new(FakeNodeState {
                reachable: true,
                write_location: Some(WalLocation::new(0x1000)),
                ..Default::default()
            })),
        })
    }

    /// A reachable replica with no lag, replayed up to `0/1000`.
    pub fn replica(address: &str) -> Arc<Self> {
        Arc::new(Self {
            address: address.to_string(),
            state: Arc::new(Mutex::new(FakeNodeState {
                reachable: true,
                lag_time: Some(Duration::ZERO),
                lag_size: Some(0),
                replayed: Some(WalLocation::new(0x1000)),
                ..Default::default()
            })),
        })
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    pub fn set_lag(&self, lag_time: Option<Duration>, lag_size: Option<u64>) {
        let mut state = self.state.lock();
        state.lag_time = lag_time;
        state.lag_size = lag_size;
    }

    pub fn set_replayed(&self, location: u64) {
        self.state.lock().replayed = Some(WalLocation::new(location));
    }

    pub fn set_write_location(&self, location: Option<u64>) {
        self.state.lock().write_location = location.map(WalLocation::new);
    }

    pub fn write_location(&self) -> Option<WalLocation> {
        self.state.lock().write_location
    }

    pub fn fail_next(&self, failure: FakeFailure, times: usize) {
        let mut state = self.state.lock();
        for _ in 0..times {
            state.failures.push_back(failure);
        }
    }

    /// Statements that completed on this node.
    pub fn executed(&self) -> Vec<String> {
        self.state.lock().executed.clone()
    }

    pub fn query_attempts(&self) -> usize {
        self.state.lock().query_attempts
    }

    pub fn caught_up_checks(&self) -> usize {
        self.state.lock().caught_up_checks
    }

    pub fn disconnects(&self) -> usize {
        self.state.lock().disconnects
    }

    pub fn detached(&self) -> usize {
        self.state.lock().detached
    }

    pub fn as_node(self: &Arc<Self>) -> Arc<dyn Node> {
        self.clone()
    }

    fn check_reachable(&self) -> LbResult<()> {
        if self.state.lock().reachable {
            Ok(())
        } else {
            Err(LoadBalancingError::Connection {
                address: self.address.clone(),
                message: "connection refused".to_string(),
            })
        }
    }
}

#[async_trait]
impl Node for FakeNode {
    fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self) -> LbResult<Box<dyn NodeConnection>> {
        self.check_reachable()?;
        self.state.lock().busy += 1;
        Ok(Box::new(FakeConnection { node: self.clone() }))
    }

    fn disconnect(&self) {
        self.state.lock().disconnects += 1;
    }

    fn busy_connections(&self) -> usize {
        self.state.lock().busy
    }
}

/// A checked out connection to a [`FakeNode`].
pub struct FakeConnection {
    node: FakeNode,
}

impl Drop for FakeConnection {
    fn drop(&mut self) {
        let mut state = self.node.state.lock();
        state.busy = state.busy.saturating_sub(1);
    }
}

#[async_trait]
impl NodeConnection for FakeConnection {
    async fn query(&mut self, sql: &str) -> LbResult<QueryResult> {
        self.node.check_reachable()?;
        let mut state = self.node.state.lock();
        state.query_attempts += 1;

        let address = self.node.address.clone();
        match state.failures.pop_front() {
            Some(FakeFailure::Connection) => {
                return Err(LoadBalancingError::Connection {
                    address,
                    message: "server closed the connection unexpectedly".to_string(),
                });
            }
            Some(FakeFailure::Conflict) => {
                return Err(LoadBalancingError::Query {
                    address,
                    code: Some("40001".to_string()),
                    message: "canceling statement due to conflict with recovery".to_string(),
                });
            }
            Some(FakeFailure::Syntax) => {
                return Err(LoadBalancingError::Query {
                    address,
                    code: Some("42601".to_string()),
                    message: "syntax error".to_string(),
                });
            }
            None => {}
        }

        state.executed.push(sql.to_string());
        Ok(QueryResult {
            columns: vec!["node".to_string()],
            rows: vec![vec![Some(address)]],
            rows_affected: 1,
        })
    }

    async fn replication_lag_time(&mut self) -> LbResult<Option<Duration>> {
        self.node.check_reachable()?;
        Ok(self.node.state.lock().lag_time)
    }

    async fn replication_lag_size(&mut self, _primary: &WalLocation) -> LbResult<Option<u64>> {
        self.node.check_reachable()?;
        Ok(self.node.state.lock().lag_size)
    }

    async fn caught_up(&mut self, location: &WalLocation) -> LbResult<bool> {
        self.node.check_reachable()?;
        let mut state = self.node.state.lock();
        state.caught_up_checks += 1;
        Ok(state.replayed.is_some_and(|replayed| replayed >= *location))
    }

    async fn current_write_location(&mut self) -> LbResult<Option<WalLocation>> {
        self.node.check_reachable()?;
        Ok(self.node.state.lock().write_location)
    }

    fn detach(self: Box<Self>) {
        self.node.state.lock().detached += 1;
    }
}

/// Builds replicas for discovered addresses and remembers them.
#[derive(Debug, Default)]
pub struct FakeNodeFactory {
    built: Mutex<Vec<Arc<FakeNode>>>,
}

impl FakeNodeFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn built(&self) -> Vec<Arc<FakeNode>> {
        self.built.lock().clone()
    }
}

impl NodeFactory for FakeNodeFactory {
    fn build(&self, address: &ServiceAddress) -> LbResult<Arc<dyn Node>> {
        let node = FakeNode::replica(&address.to_string());
        self.built.lock().push(node.clone());
        Ok(node)
    }
}

/// A resolver whose answer is set by the test.
#[derive(Debug)]
pub struct FakeResolver {
    answer: Mutex<Option<Resolution>>,
    calls: Mutex<usize>,
}

impl FakeResolver {
    pub fn new(addresses: &[&str], ttl: Duration) -> Arc<Self> {
        let resolver = Arc::new(Self {
            answer: Mutex::new(None),
            calls: Mutex::new(0),
        });
        resolver.answer(addresses, ttl);
        resolver
    }

    pub fn answer(&self, addresses: &[&str], ttl: Duration) {
        let addresses = addresses
            .iter()
            .map(|a| a.parse::<ServiceAddress>().expect("valid address"))
            .collect();
        *self.answer.lock() = Some(Resolution { addresses, ttl });
    }

    pub fn fail(&self) {
        *self.answer.lock() = None;
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock()
    }
}

#[async_trait]
impl Resolver for FakeResolver {
    async fn resolve(&self) -> LbResult<Resolution> {
        *self.calls.lock() += 1;
        self.answer
            .lock()
            .clone()
            .ok_or_else(|| LoadBalancingError::Discovery {
                message: "SERVFAIL".to_string(),
            })
    }
}

/// Error tracker that keeps every tracked message.
#[derive(Debug, Default)]
pub struct RecordingTracker {
    errors: Mutex<Vec<String>>,
}

impl RecordingTracker {
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }
}

impl ErrorTracker for RecordingTracker {
    fn track(&self, error: &LoadBalancingError) {
        self.errors.lock().push(error.to_string());
    }
}
