//! Bounded retries for statements that need strong locks.
//!
//! DDL such as `ALTER INDEX ... RENAME` waits for an `ACCESS EXCLUSIVE` lock and,
//! while waiting, blocks every query queued behind it. Each attempt therefore
//! runs with a short `lock_timeout`; on timeout the statements are retried after
//! a pause. Timeouts and pauses follow a timing table that alternates short
//! attempts with longer ones for busy tables.

use std::time::Duration;

use tracing::{debug, warn};

use crate::database::ReindexConnection;
use crate::error::{ReindexError, ReindexResult};
use crate::timeouts::{timeout_value, with_lock_timeout};

/// One attempt: how long to wait for locks, and how long to pause after a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRetryStep {
    /// `lock_timeout` for the attempt.
    pub lock_timeout: Duration,
    /// Pause before the next attempt.
    pub sleep: Duration,
}

const fn step(lock_timeout_ms: u64, sleep_ms: u64) -> LockRetryStep {
    LockRetryStep {
        lock_timeout: Duration::from_millis(lock_timeout_ms),
        sleep: Duration::from_millis(sleep_ms),
    }
}

/// Timing for statements run inside a transaction.
pub const DEFAULT_TIMING: [LockRetryStep; 41] = [
    step(100, 50),
    step(100, 50),
    step(200, 50),
    step(300, 100),
    step(400, 150),
    step(500, 2_000),
    step(500, 2_000),
    step(500, 2_000),
    step(500, 2_000),
    step(1_000, 5_000),
    step(1_000, 60_000),
    step(100, 50),
    step(100, 50),
    step(200, 50),
    step(300, 100),
    step(400, 150),
    step(500, 2_000),
    step(500, 2_000),
    step(500, 2_000),
    step(3_000, 180_000),
    step(100, 50),
    step(100, 50),
    step(500, 2_000),
    step(500, 2_000),
    step(5_000, 120_000),
    step(500, 500),
    step(500, 500),
    step(7_000, 300_000),
    step(500, 500),
    step(500, 500),
    step(7_000, 300_000),
    step(500, 500),
    step(500, 500),
    step(7_000, 300_000),
    step(100, 50),
    step(100, 50),
    step(500, 2_000),
    step(10_000, 600_000),
    step(100, 50),
    step(500, 2_000),
    step(10_000, 600_000),
];

/// Timing for concurrent index removal, which cannot run in a transaction.
pub fn index_removal_timing() -> Vec<LockRetryStep> {
    vec![step(60_000, 540_000); 30]
}

/// Runs statements with a lock timeout, retrying on lock timeouts.
#[derive(Debug, Clone)]
pub struct LockRetries {
    timing: Vec<LockRetryStep>,
    in_transaction: bool,
    raise_on_exhaustion: bool,
}

impl Default for LockRetries {
    fn default() -> Self {
        Self::new()
    }
}

impl LockRetries {
    /// Retries inside a transaction using [`DEFAULT_TIMING`].
    pub fn new() -> Self {
        Self {
            timing: DEFAULT_TIMING.to_vec(),
            in_transaction: true,
            raise_on_exhaustion: true,
        }
    }

    /// Retries outside a transaction using [`index_removal_timing`].
    ///
    /// After the last timeout, a final attempt runs without a lock timeout.
    pub fn for_index_removal() -> Self {
        Self {
            timing: index_removal_timing(),
            in_transaction: false,
            raise_on_exhaustion: false,
        }
    }

    /// Uses `timing` instead of the default table.
    pub fn with_timing(mut self, timing: Vec<LockRetryStep>) -> Self {
        self.timing = timing;
        self
    }

    /// Fails with [`ReindexError::LockRetriesExhausted`] once every attempt
    /// timed out, instead of making a final attempt without a lock timeout.
    pub fn raise_on_exhaustion(mut self, raise: bool) -> Self {
        self.raise_on_exhaustion = raise;
        self
    }

    /// The timing table.
    pub fn timing(&self) -> &[LockRetryStep] {
        &self.timing
    }

    /// Runs `statements` until they succeed, fail with an error other than a
    /// lock timeout, or the timing table is used up.
    pub async fn run(
        &self,
        conn: &mut dyn ReindexConnection,
        statements: &[String],
    ) -> ReindexResult<()> {
        let attempts = self.timing.len();

        for (i, step) in self.timing.iter().enumerate() {
            let attempt = i + 1;
            match self.attempt(conn, statements, step.lock_timeout).await {
                Ok(()) => {
                    debug!(attempt, "Lock retry attempt succeeded");
                    return Ok(());
                }
                Err(e) if e.is_lock_timeout() => {
                    warn!(
                        attempt,
                        attempts,
                        lock_timeout = ?step.lock_timeout,
                        sleep = ?step.sleep,
                        "Lock timeout, retrying"
                    );
                    if attempt < attempts {
                        tokio::time::sleep(step.sleep).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        if self.raise_on_exhaustion {
            return Err(ReindexError::LockRetriesExhausted { attempts });
        }

        warn!(attempts, "Lock retries exhausted, running without lock timeout");
        self.attempt(conn, statements, Duration::ZERO).await
    }

    async fn attempt(
        &self,
        conn: &mut dyn ReindexConnection,
        statements: &[String],
        lock_timeout: Duration,
    ) -> ReindexResult<()> {
        if !self.in_transaction {
            return with_lock_timeout(conn, lock_timeout, statements).await;
        }

        conn.execute("BEGIN").await?;
        let mut result = conn
            .execute(&format!("SET LOCAL lock_timeout TO {}", timeout_value(lock_timeout)))
            .await;
        if result.is_ok() {
            for sql in statements {
                result = conn.execute(sql).await;
                if result.is_err() {
                    break;
                }
            }
        }

        match result {
            Ok(()) => conn.execute("COMMIT").await,
            Err(e) => {
                if let Err(rollback_err) = conn.execute("ROLLBACK").await {
                    warn!(error = %rollback_err, "Rollback after failed attempt failed");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timing_shape() {
        assert_eq!(DEFAULT_TIMING.len(), 41);
        assert_eq!(DEFAULT_TIMING[0], step(100, 50));
        assert_eq!(DEFAULT_TIMING[10], step(1_000, 60_000));
        assert_eq!(DEFAULT_TIMING[40], step(10_000, 600_000));

        let longest = DEFAULT_TIMING.iter().map(|s| s.lock_timeout).max();
        assert_eq!(longest, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_removal_timing() {
        let timing = index_removal_timing();
        assert_eq!(timing.len(), 30);
        assert!(timing.iter().all(|s| *s == step(60_000, 540_000)));
    }

    #[test]
    fn test_builders() {
        let retries = LockRetries::for_index_removal().raise_on_exhaustion(true);
        assert!(retries.raise_on_exhaustion);
        assert!(!retries.in_transaction);

        let retries = LockRetries::new().with_timing(vec![step(10, 0)]);
        assert_eq!(retries.timing().len(), 1);
    }
}
