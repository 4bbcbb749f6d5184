use crate::core::price::SnapshotError;
use reqwest::StatusCode;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Retries an async lookup while it fails with a transient error.
///
/// # Parameters
/// - `operation`: Closure returning a future
/// - `retries`: Number of retry attempts (total runs = 1 initial + retries)
/// - `delay_ms`: Base delay; doubled after each failed attempt
pub async fn with_retry<F, Fut, T>(
    mut operation: F,
    retries: usize,
    delay_ms: u64,
) -> Result<T, SnapshotError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SnapshotError>>,
{
    let mut attempt = 1;
    let mut delay = delay_ms;
    loop {
        match operation().await {
            Ok(val) => return Ok(val),
            Err(err) => {
                if attempt > retries || !err.is_transient() {
                    return Err(err);
                }
                debug!(
                    "Attempt {}/{} failed: {:?}. Retrying in {}ms...",
                    attempt, retries, err, delay
                );
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(delay)).await;
                delay = delay.saturating_mul(2);
            }
        }
    }
}

/// Maps a non-success HTTP status to the snapshot failure it stands for.
pub fn status_error(status: StatusCode, symbol: &str) -> SnapshotError {
    match status {
        StatusCode::NOT_FOUND => SnapshotError::NotFound(symbol.to_string()),
        StatusCode::TOO_MANY_REQUESTS => SnapshotError::RateLimited,
        other => SnapshotError::Unavailable(format!("HTTP {other} for {symbol}")),
    }
}

/// Maps a transport failure, keeping timeouts distinguishable.
pub fn transport_error(err: reqwest::Error, timeout: Duration) -> SnapshotError {
    if err.is_timeout() {
        SnapshotError::Timeout(timeout)
    } else {
        SnapshotError::Unavailable(err.to_string())
    }
}

/// Percent change from `previous` to `current`, if `previous` is usable.
pub fn percent_change(current: f64, previous: Option<f64>) -> Option<f64> {
    previous
        .filter(|p| p.is_finite() && *p > 0.0)
        .map(|p| (current - p) / p * 100.0)
}
