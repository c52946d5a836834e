//! Query classification.
//!
//! Every statement routed by the [`ConnectionProxy`](crate::proxy::ConnectionProxy)
//! falls into one of a closed set of [`QueryKind`]s. Anything the classifier
//! does not recognise is a [`QueryKind::Write`], which runs on the primary
//! without pinning the session.

/// How a statement is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    /// A plain read that may run on a replica.
    Read,
    /// A read that takes row locks (`FOR UPDATE`, `FOR SHARE`, ...).
    LockingRead,
    /// An unrecognised statement. Runs on the primary.
    Write,
    /// A data-modifying statement. Runs on the primary and pins the session.
    StickyWrite,
    /// Transaction control (`BEGIN`, `COMMIT`, `SAVEPOINT`, ...).
    Transaction,
}

impl QueryKind {
    /// Returns true if the statement must run on the primary and pin the session.
    pub fn is_sticky(self) -> bool {
        matches!(self, QueryKind::LockingRead | QueryKind::StickyWrite)
    }

    /// Returns true if the statement may modify data.
    pub fn is_write(self) -> bool {
        matches!(self, QueryKind::Write | QueryKind::StickyWrite)
    }
}

/// A statement together with its routing kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    sql: String,
    kind: QueryKind,
    track_location: bool,
}

impl Query {
    /// Classifies `sql`.
    pub fn new(sql: impl Into<String>) -> Self {
        let sql = sql.into();
        let kind = classify(&sql);
        let track_location = !only_changes_session(&sql);
        Self {
            sql,
            kind,
            track_location,
        }
    }

    /// Creates a query with an explicit kind.
    pub fn with_kind(sql: impl Into<String>, kind: QueryKind) -> Self {
        Self {
            sql: sql.into(),
            kind,
            track_location: true,
        }
    }

    /// A query that is always treated as a plain read.
    pub fn read(sql: impl Into<String>) -> Self {
        Self::with_kind(sql, QueryKind::Read)
    }

    /// A query that is always treated as a sticky write.
    pub fn write(sql: impl Into<String>) -> Self {
        Self::with_kind(sql, QueryKind::StickyWrite)
    }

    /// Skips recording the primary write location after this statement.
    pub fn non_sticky(mut self) -> Self {
        self.track_location = false;
        self
    }

    /// The statement text.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// The routing kind.
    pub fn kind(&self) -> QueryKind {
        self.kind
    }

    /// Returns true if the primary write location is recorded after this statement.
    pub fn tracks_location(&self) -> bool {
        self.track_location && self.kind.is_write()
    }
}

/// Classifies a SQL statement by its leading keyword.
pub fn classify(sql: &str) -> QueryKind {
    let words = Words::scan(sql);
    let Some(first) = words.top.first() else {
        return QueryKind::Write;
    };

    match first.as_str() {
        "SELECT" | "TABLE" | "VALUES" => read_kind(&words),
        "WITH" => {
            if words.all.iter().any(|w| is_dml(w)) {
                QueryKind::StickyWrite
            } else {
                read_kind(&words)
            }
        }
        "SHOW" => QueryKind::Read,
        "EXPLAIN" => {
            if words.top.iter().any(|w| w == "ANALYZE" || w == "ANALYSE") {
                QueryKind::Write
            } else {
                QueryKind::Read
            }
        }
        "INSERT" | "UPDATE" | "DELETE" | "MERGE" | "TRUNCATE" => QueryKind::StickyWrite,
        "COPY" => {
            if words.top.iter().any(|w| w == "TO") {
                QueryKind::Read
            } else {
                QueryKind::StickyWrite
            }
        }
        "BEGIN" | "START" | "COMMIT" | "END" | "ROLLBACK" | "ABORT" | "SAVEPOINT" | "RELEASE" => {
            QueryKind::Transaction
        }
        _ => QueryKind::Write,
    }
}

fn read_kind(words: &Words) -> QueryKind {
    // `SELECT ... INTO new_table` creates a table.
    if words.top.iter().any(|w| w == "INTO") {
        return QueryKind::StickyWrite;
    }

    let locking = words.all.windows(2).any(|pair| {
        pair[0] == "FOR" && matches!(pair[1].as_str(), "UPDATE" | "SHARE" | "NO" | "KEY")
    });
    if locking {
        QueryKind::LockingRead
    } else {
        QueryKind::Read
    }
}

/// Statements that leave no data for a later read to wait for.
fn only_changes_session(sql: &str) -> bool {
    Words::scan(sql).top.first().is_some_and(|first| {
        matches!(
            first.as_str(),
            "SET" | "RESET" | "DISCARD" | "LISTEN" | "UNLISTEN" | "DEALLOCATE" | "LOAD"
                | "VACUUM" | "ANALYZE" | "ANALYSE" | "CHECKPOINT"
        )
    })
}

fn is_dml(word: &str) -> bool {
    matches!(word, "INSERT" | "UPDATE" | "DELETE" | "MERGE")
}

/// Upper-cased keywords of a statement, skipping literals and comments.
struct Words {
    /// Every word.
    all: Vec<String>,
    /// Words outside parentheses.
    top: Vec<String>,
}

impl Words {
    fn scan(sql: &str) -> Self {
        let mut all = Vec::new();
        let mut top = Vec::new();
        let mut depth = 0usize;
        let mut chars = sql.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '\'' | '"' => {
                    for next in chars.by_ref() {
                        if next == c {
                            break;
                        }
                    }
                }
                '-' if chars.peek() == Some(&'-') => {
                    for next in chars.by_ref() {
                        if next == '\n' {
                            break;
                        }
                    }
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    let mut prev = '\0';
                    for next in chars.by_ref() {
                        if prev == '*' && next == '/' {
                            break;
                        }
                        prev = next;
                    }
                }
                '(' => depth += 1,
                ')' => depth = depth.saturating_sub(1),
                c if c.is_ascii_alphabetic() || c == '_' => {
                    let mut word = c.to_ascii_uppercase().to_string();
                    while let Some(&next) = chars.peek() {
                        if next.is_ascii_alphanumeric() || next == '_' {
                            word.push(next.to_ascii_uppercase());
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    if depth == 0 {
                        top.push(word.clone());
                    }
                    all.push(word);
                }
                _ => {}
            }
        }

        Self { all, top }
    }
}
