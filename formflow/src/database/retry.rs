//! Retry helper for write contention.
//!
//! SQLite allows a single writer; under WAL a losing writer surfaces
//! SQLITE_BUSY. Claim and transition statements are wrapped here so a lost
//! lock race is retried with capped exponential backoff instead of bubbling
//! up as a spurious failure.

use rand::random;
use std::borrow::Cow;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

const BUSY_MAX_RETRIES: usize = 10;
const BUSY_BASE_DELAY_MS: u64 = 20;
const BUSY_MAX_DELAY_MS: u64 = 1500;

use crate::{Error, Result};

fn is_busy(err: &Error) -> bool {
    let Error::DatabaseSqlx(sqlx_err) = err else {
        return false;
    };

    let sqlx::Error::Database(db_err) = sqlx_err else {
        let msg = sqlx_err.to_string().to_ascii_lowercase();
        return msg.contains("database is locked") || msg.contains("database is busy");
    };

    // 5 = SQLITE_BUSY, 6 = SQLITE_LOCKED
    let code = db_err.code().map(Cow::into_owned);
    if matches!(code.as_deref(), Some("5") | Some("6")) {
        return true;
    }

    let msg = db_err.message().to_ascii_lowercase();
    msg.contains("database is locked") || msg.contains("database is busy")
}

/// Run `operation`, retrying while it fails with SQLITE_BUSY/SQLITE_LOCKED.
pub async fn retry_on_busy<T, F, Fut>(op_name: &'static str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0usize;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if is_busy(&err) && attempt < BUSY_MAX_RETRIES => {
                let backoff_ms = BUSY_BASE_DELAY_MS
                    .saturating_mul(1u64 << attempt)
                    .min(BUSY_MAX_DELAY_MS);
                let jitter_ms = random::<u64>() % (backoff_ms / 4 + 1);
                let delay = Duration::from_millis((backoff_ms + jitter_ms).min(BUSY_MAX_DELAY_MS));

                debug!(
                    "SQLite busy during {}, retrying in {:?} (attempt {}/{})",
                    op_name,
                    delay,
                    attempt + 1,
                    BUSY_MAX_RETRIES
                );

                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_non_busy_error_not_retried() {
        let mut calls = 0u32;
        let result: Result<()> = retry_on_busy("test", || {
            calls += 1;
            async { Err(Error::Validation("nope".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let result = retry_on_busy("test", || async { Ok(42) }).await.unwrap();
        assert_eq!(result, 42);
    }
}
