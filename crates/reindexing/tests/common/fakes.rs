//! In-memory catalog, history and notifier fakes.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use helios_reindexing::error::{LOCK_NOT_AVAILABLE, QUERY_CANCELED};
use helios_reindexing::{
    ActionState, Index, Notifier, ReindexAction, ReindexConnection, ReindexDatabase,
    ReindexError, ReindexHistory, ReindexResult,
};

const REPLACEMENT_SIZE: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone)]
struct InjectedFailure {
    pattern: String,
    code: Option<String>,
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct CatalogState {
    indexes: Vec<Index>,
    next_oid: u32,
    snapshot: Option<Vec<Index>>,
    statements: Vec<String>,
    analyzed: Vec<String>,
    connections: usize,
    failures: Vec<InjectedFailure>,
    invalid_builds: bool,
    interrupt_native: bool,
}

/// A database whose catalog lives in memory.
///
/// Understands the statements the strategies issue: concurrent builds,
/// renames, drops, native reindexes, `ANALYZE`, timeouts and transactions.
/// A rolled back transaction restores the catalog as of `BEGIN`.
#[derive(Debug, Clone)]
pub struct FakeCatalog {
    state: Arc<Mutex<CatalogState>>,
}

impl Default for FakeCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCatalog {
    /// An empty catalog. New indexes get oids from 20000.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(CatalogState {
                next_oid: 20000,
                ..Default::default()
            })),
        }
    }

    /// A catalog holding `indexes`.
    pub fn with_indexes(indexes: Vec<Index>) -> Arc<Self> {
        let catalog = Self::new();
        catalog.state.lock().indexes = indexes;
        Arc::new(catalog)
    }

    /// Adds an index.
    pub fn add(&self, index: Index) {
        self.state.lock().indexes.push(index);
    }

    /// Looks up an index by name in `public`.
    pub fn get(&self, name: &str) -> Option<Index> {
        self.state
            .lock()
            .indexes
            .iter()
            .find(|i| i.schema == "public" && i.name == name)
            .cloned()
    }

    /// Index names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().indexes.iter().map(|i| i.name.clone()).collect();
        names.sort();
        names
    }

    /// Every executed statement, in order.
    pub fn statements(&self) -> Vec<String> {
        self.state.lock().statements.clone()
    }

    /// Number of executed statements equal to `sql`.
    pub fn count(&self, sql: &str) -> usize {
        self.state.lock().statements.iter().filter(|s| *s == sql).count()
    }

    /// Tables analyzed, as written in the statement.
    pub fn analyzed(&self) -> Vec<String> {
        self.state.lock().analyzed.clone()
    }

    /// Number of connections opened.
    pub fn connections(&self) -> usize {
        self.state.lock().connections
    }

    /// The next `times` statements containing `pattern` time out waiting for locks.
    pub fn fail_with_lock_timeout(&self, pattern: &str, times: usize) {
        self.inject(pattern, Some(LOCK_NOT_AVAILABLE), Some(times));
    }

    /// Every statement containing `pattern` fails with `code`.
    pub fn fail_always(&self, pattern: &str, code: Option<&str>) {
        self.inject(pattern, code, None);
    }

    /// Concurrent builds leave an invalid index behind.
    pub fn leave_invalid_builds(&self) {
        self.state.lock().invalid_builds = true;
    }

    /// `REINDEX INDEX CONCURRENTLY` is canceled after building its `_ccnew` index.
    pub fn interrupt_native_reindex(&self) {
        self.state.lock().interrupt_native = true;
    }

    fn inject(&self, pattern: &str, code: Option<&str>, remaining: Option<usize>) {
        self.state.lock().failures.push(InjectedFailure {
            pattern: pattern.to_string(),
            code: code.map(str::to_string),
            remaining,
        });
    }
}

#[async_trait]
impl ReindexDatabase for FakeCatalog {
    async fn connect(&self) -> ReindexResult<Box<dyn ReindexConnection>> {
        self.state.lock().connections += 1;
        Ok(Box::new(FakeConnection {
            state: self.state.clone(),
        }))
    }
}

struct FakeConnection {
    state: Arc<Mutex<CatalogState>>,
}

fn db_error(code: Option<&str>, message: impl Into<String>) -> ReindexError {
    ReindexError::Database {
        code: code.map(str::to_string),
        message: message.into(),
    }
}

/// Parses a possibly quoted identifier at the start of `s`.
fn parse_ident(s: &str) -> Option<(String, &str)> {
    if let Some(rest) = s.strip_prefix('"') {
        let mut name = String::new();
        let mut chars = rest.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            if c == '"' {
                if matches!(chars.peek(), Some((_, '"'))) {
                    chars.next();
                    name.push('"');
                } else {
                    return Some((name, &rest[i + 1..]));
                }
            } else {
                name.push(c);
            }
        }
        None
    } else {
        let end = s
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(s.len());
        (end > 0).then(|| (s[..end].to_string(), &s[end..]))
    }
}

/// Parses `schema.name` at the start of `s`.
fn parse_qualified(s: &str) -> Option<(String, String, &str)> {
    let (schema, rest) = parse_ident(s)?;
    let (name, rest) = parse_ident(rest.strip_prefix('.')?)?;
    Some((schema, name, rest))
}

impl CatalogState {
    fn position(&self, schema: &str, name: &str) -> Option<usize> {
        self.indexes
            .iter()
            .position(|i| i.schema == schema && i.name == name)
    }

    fn next_oid(&mut self) -> u32 {
        let oid = self.next_oid;
        self.next_oid += 1;
        oid
    }

    fn injected_failure(&mut self, sql: &str) -> Option<ReindexError> {
        let failure = self.failures.iter_mut().find(|f| {
            sql.contains(&f.pattern) && f.remaining.is_none_or(|remaining| remaining > 0)
        })?;
        if let Some(remaining) = failure.remaining.as_mut() {
            *remaining -= 1;
        }
        Some(db_error(
            failure.code.as_deref(),
            format!("injected failure for: {sql}"),
        ))
    }

    fn apply(&mut self, sql: &str) -> ReindexResult<()> {
        let malformed = || db_error(Some("42601"), format!("cannot parse: {sql}"));

        if sql == "BEGIN" {
            self.snapshot = Some(self.indexes.clone());
        } else if sql == "COMMIT" {
            self.snapshot = None;
        } else if sql == "ROLLBACK" {
            if let Some(snapshot) = self.snapshot.take() {
                self.indexes = snapshot;
            }
        } else if sql.starts_with("SET ") || sql.starts_with("RESET ") {
            // Settings are not modeled.
        } else if let Some(rest) = sql.strip_prefix("CREATE INDEX CONCURRENTLY ") {
            let (name, rest) = parse_ident(rest).ok_or_else(malformed)?;
            let rest = rest.strip_prefix(" ON ").ok_or_else(malformed)?;
            let (schema, table, _) = parse_qualified(rest).ok_or_else(malformed)?;
            if self.position(&schema, &name).is_some() {
                return Err(db_error(Some("42P07"), format!("relation {name} already exists")));
            }
            let oid = self.next_oid();
            self.indexes.push(Index {
                oid,
                schema,
                name,
                table,
                definition: sql.replacen("CONCURRENTLY ", "", 1),
                unique: false,
                valid: !self.invalid_builds,
                partitioned: false,
                exclusion: false,
                expression: false,
                ondisk_size_bytes: REPLACEMENT_SIZE,
                bloat_size_bytes: Some(0),
            });
        } else if let Some(rest) = sql.strip_prefix("ALTER INDEX ") {
            let (schema, from, rest) = parse_qualified(rest).ok_or_else(malformed)?;
            let rest = rest.strip_prefix(" RENAME TO ").ok_or_else(malformed)?;
            let (to, _) = parse_ident(rest).ok_or_else(malformed)?;
            if self.position(&schema, &to).is_some() {
                return Err(db_error(Some("42P07"), format!("relation {to} already exists")));
            }
            let pos = self
                .position(&schema, &from)
                .ok_or_else(|| db_error(Some("42704"), format!("index {from} does not exist")))?;
            self.indexes[pos].name = to;
        } else if let Some(rest) = sql.strip_prefix("DROP INDEX CONCURRENTLY IF EXISTS ") {
            let (schema, name, _) = parse_qualified(rest).ok_or_else(malformed)?;
            if let Some(pos) = self.position(&schema, &name) {
                self.indexes.remove(pos);
            }
        } else if let Some(rest) = sql.strip_prefix("REINDEX INDEX CONCURRENTLY ") {
            let (schema, name, _) = parse_qualified(rest).ok_or_else(malformed)?;
            let pos = self
                .position(&schema, &name)
                .ok_or_else(|| db_error(Some("42704"), format!("index {name} does not exist")))?;
            let oid = self.next_oid();
            if self.interrupt_native {
                let leftover = Index {
                    oid,
                    name: format!("{name}_ccnew"),
                    valid: false,
                    ..self.indexes[pos].clone()
                };
                self.indexes.push(leftover);
                return Err(db_error(
                    Some(QUERY_CANCELED),
                    "canceling statement due to statement timeout",
                ));
            }
            let index = &mut self.indexes[pos];
            index.oid = oid;
            index.ondisk_size_bytes = REPLACEMENT_SIZE;
            index.bloat_size_bytes = Some(0);
        } else if let Some(rest) = sql.strip_prefix("ANALYZE ") {
            self.analyzed.push(rest.to_string());
        } else {
            return Err(malformed());
        }
        Ok(())
    }
}

#[async_trait]
impl ReindexConnection for FakeConnection {
    async fn execute(&mut self, sql: &str) -> ReindexResult<()> {
        let mut state = self.state.lock();
        state.statements.push(sql.to_string());
        if let Some(err) = state.injected_failure(sql) {
            return Err(err);
        }
        state.apply(sql)
    }

    async fn find_index(&mut self, schema: &str, name: &str) -> ReindexResult<Option<Index>> {
        let state = self.state.lock();
        Ok(state.position(schema, name).map(|pos| state.indexes[pos].clone()))
    }

    async fn indexes_with_prefix(
        &mut self,
        schema: &str,
        prefix: &str,
    ) -> ReindexResult<Vec<Index>> {
        Ok(self
            .state
            .lock()
            .indexes
            .iter()
            .filter(|i| i.schema == schema && i.name.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn list_indexes(&mut self) -> ReindexResult<Vec<Index>> {
        Ok(self.state.lock().indexes.clone())
    }
}

/// A notification received by [`RecordingNotifier`].
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub event: &'static str,
    pub index: String,
    pub state: ActionState,
}

/// Records start and end notifications.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    received: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn received(&self) -> Vec<Notification> {
        self.received.lock().clone()
    }

    fn push(&self, event: &'static str, index: &Index, action: &ReindexAction) {
        self.received.lock().push(Notification {
            event,
            index: index.identifier(),
            state: action.state,
        });
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_start(&self, index: &Index, action: &ReindexAction) {
        self.push("start", index, action);
    }

    async fn notify_end(&self, index: &Index, action: &ReindexAction) {
        self.push("end", index, action);
    }
}

/// A history whose store is unreachable.
#[derive(Debug, Default)]
pub struct FailingHistory;

#[async_trait]
impl ReindexHistory for FailingHistory {
    async fn record(&self, _action: &ReindexAction) -> ReindexResult<()> {
        Err(ReindexError::History {
            message: "history store unavailable".to_string(),
        })
    }

    async fn actions_between(
        &self,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> ReindexResult<Vec<ReindexAction>> {
        Err(ReindexError::History {
            message: "history store unavailable".to_string(),
        })
    }
}
