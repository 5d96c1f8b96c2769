//! Locked-write executor
//!
//! SQLite enforces a single writer per database file. When a scheduled run
//! overlaps a manually triggered one, a write can fail with a transient lock
//! conflict; this module retries such writes with exponential backoff.
//! Reads never go through here - they use the read-only pool.

use std::thread;
use std::time::Duration;

use crate::db::DbError;

/// Bounded retry with exponential backoff for write-lock conflicts
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt; doubled after each failure
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
        }
    }
}

/// True if the error is a transient SQLite lock conflict worth retrying
pub fn is_lock_error(err: &diesel::result::Error) -> bool {
    match err {
        diesel::result::Error::DatabaseError(_, info) => {
            let msg = info.message();
            msg.contains("database is locked") || msg.contains("database table is locked")
        }
        _ => false,
    }
}

/// Run a mutating database call, retrying on transient lock conflicts.
///
/// Any non-lock error, or running out of attempts, propagates immediately.
pub fn with_write_retry<T, F>(policy: &RetryPolicy, mut op: F) -> Result<T, DbError>
where
    F: FnMut() -> Result<T, DbError>,
{
    let mut delay = policy.base_delay;
    let mut attempt = 1;

    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(DbError::Query(ref e)) if is_lock_error(e) && attempt < policy.max_attempts => {
                eprintln!(
                    "Write-lock conflict (attempt {}/{}), retrying in {:?}...",
                    attempt, policy.max_attempts, delay
                );
                thread::sleep(delay);
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
