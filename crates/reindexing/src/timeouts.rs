//! Session timeouts scoped to a group of statements.
//!
//! The timeout is set, the statements run, and the setting is reset even when
//! a statement fails, so a long timeout never outlives the operation it was
//! set for.

use std::time::Duration;

use tracing::warn;

use crate::database::ReindexConnection;
use crate::error::ReindexResult;

/// Runs `statements` with `statement_timeout` set to `timeout`.
pub async fn with_statement_timeout(
    conn: &mut dyn ReindexConnection,
    timeout: Duration,
    statements: &[String],
) -> ReindexResult<()> {
    with_setting(conn, "statement_timeout", timeout, statements).await
}

/// Runs `statements` with `lock_timeout` set to `timeout`.
pub async fn with_lock_timeout(
    conn: &mut dyn ReindexConnection,
    timeout: Duration,
    statements: &[String],
) -> ReindexResult<()> {
    with_setting(conn, "lock_timeout", timeout, statements).await
}

/// Formats a duration as a PostgreSQL setting value. Zero disables the timeout.
pub fn timeout_value(timeout: Duration) -> String {
    format!("'{}ms'", timeout.as_millis())
}

async fn with_setting(
    conn: &mut dyn ReindexConnection,
    setting: &str,
    timeout: Duration,
    statements: &[String],
) -> ReindexResult<()> {
    conn.execute(&format!("SET {setting} TO {}", timeout_value(timeout)))
        .await?;

    let mut result = Ok(());
    for sql in statements {
        if let Err(e) = conn.execute(sql).await {
            result = Err(e);
            break;
        }
    }

    let reset = conn.execute(&format!("RESET {setting}")).await;
    match (result, reset) {
        (Err(e), Err(reset_err)) => {
            warn!(setting, error = %reset_err, "Failed to reset setting after error");
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
        (Ok(()), reset) => reset,
    }
}
