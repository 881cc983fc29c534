//! Connection-class error classification and retry-with-backoff for
//! database calls.
//!
//! Only failures that look like a dropped or saturated connection are
//! retried; everything else (constraint violations, bad SQL, application
//! logic errors surfaced as DB errors) propagates on first occurrence.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

const DEFAULT_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_DELAY_MS: u64 = 250;
const MAX_DELAY_MS: u64 = 5000;

/// Connection-termination phrases seen in driver error messages that don't
/// carry a structured SQLSTATE (e.g. raw OS-level socket errors surfaced as
/// text by some connection poolers).
const CONNECTION_PHRASES: &[&str] = &[
    "connection reset",
    "connection refused",
    "connection closed",
    "connection terminated",
    "broken pipe",
    "timed out",
    "server closed the connection unexpectedly",
];

/// Returns true if `err` looks like a connection-class failure eligible for
/// retry: SQLSTATE class `08` (connection exception), administrative /
/// crash shutdown or too-many-connections (`57P01`, `57P02`, `57P03`,
/// `53300`), a recognized OS errno substring, or a known connection-
/// termination phrase.
pub fn is_connection_error(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Io(io_err) = err {
        use std::io::ErrorKind;
        return matches!(
            io_err.kind(),
            ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::ConnectionRefused
                | ErrorKind::TimedOut
                | ErrorKind::BrokenPipe
                | ErrorKind::UnexpectedEof
        );
    }
    if let Some(db_err) = err.as_database_error() {
        if let Some(code) = db_err.code() {
            if code.starts_with("08") || matches!(code.as_ref(), "57P01" | "57P02" | "57P03" | "53300") {
                return true;
            }
        }
    }
    let message = err.to_string().to_lowercase();
    CONNECTION_PHRASES.iter().any(|phrase| message.contains(phrase))
}

/// Runs `operation`, retrying up to `DEFAULT_ATTEMPTS` total attempts when
/// the error classifies as connection-class. `context` is attached to log
/// lines to identify the call site.
pub async fn with_retry<F, Fut, T>(context: &str, operation: F) -> Result<T, sqlx::Error>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut attempt: u32 = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(context, attempt, "database operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                if !is_connection_error(&err) || attempt + 1 >= DEFAULT_ATTEMPTS {
                    if attempt > 0 {
                        warn!(context, attempt, error = %err, "database operation failed, giving up");
                    }
                    return Err(err);
                }
                attempt += 1;
                let delay = backoff_delay(attempt, DEFAULT_BASE_DELAY_MS);
                warn!(context, attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying database operation");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// `min(5000ms, base * attempt^2 + jitter)`, jitter uniform in
/// `[0, min(1000, base)]`.
fn backoff_delay(attempt: u32, base_ms: u64) -> Duration {
    let quadratic = base_ms.saturating_mul((attempt as u64).saturating_pow(2));
    let jitter_ceiling = base_ms.min(1000);
    let jitter = if jitter_ceiling == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_ceiling)
    };
    Duration::from_millis(quadratic.saturating_add(jitter).min(MAX_DELAY_MS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn backoff_never_exceeds_ceiling() {
        for attempt in 1..=10 {
            let d = backoff_delay(attempt, 250);
            assert!(d.as_millis() as u64 <= MAX_DELAY_MS);
        }
    }

    #[test]
    fn backoff_grows_quadratically_before_ceiling() {
        let d1 = backoff_delay(1, 100).as_millis() as u64;
        let d2 = backoff_delay(2, 100).as_millis() as u64;
        // attempt=1 -> ~100 + jitter(<=100); attempt=2 -> ~400 + jitter(<=100)
        assert!(d2 >= d1);
    }

    #[tokio::test]
    async fn succeeds_without_retry_on_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Result<u32, sqlx::Error> = with_retry("test", || {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn classifies_connection_refused_io_error() {
        let io = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        let err = sqlx::Error::Io(io);
        assert!(is_connection_error(&err));
    }

    #[test]
    fn does_not_classify_row_not_found() {
        assert!(!is_connection_error(&sqlx::Error::RowNotFound));
    }
}
