//! Price snapshot abstractions and the concurrent fetch fan-out

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// A price + 24h change reading for one symbol at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub price: f64,
    pub change_24h_percent: Option<f64>,
    pub as_of: DateTime<Utc>,
}

impl PriceSnapshot {
    pub fn new(price: f64, change_24h_percent: Option<f64>, as_of: DateTime<Utc>) -> Self {
        Self {
            price,
            change_24h_percent,
            as_of,
        }
    }

    /// A snapshot is usable only when the price is a finite, non-negative number.
    pub fn is_usable(&self) -> bool {
        self.price.is_finite() && self.price >= 0.0
    }

    pub fn age(&self, now: DateTime<Utc>) -> ChronoDuration {
        now - self.as_of
    }

    pub fn is_stale(&self, now: DateTime<Utc>, threshold: ChronoDuration) -> bool {
        self.age(now) > threshold
    }
}

/// Why a snapshot could not be produced. Detail strings stay in logs; the
/// `Display` output is safe to show to a user.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SnapshotError {
    #[error("price provider rate limited the request")]
    RateLimited,
    #[error("no price found for {0}")]
    NotFound(String),
    #[error("price lookup timed out after {0:?}")]
    Timeout(Duration),
    #[error("price provider unavailable")]
    Unavailable(String),
}

impl SnapshotError {
    /// Whether a retry has a chance of producing a different answer.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SnapshotError::RateLimited | SnapshotError::Timeout(_) | SnapshotError::Unavailable(_)
        )
    }
}

pub type SnapshotResult = Result<PriceSnapshot, SnapshotError>;

#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn get_snapshot(&self, symbol: &str) -> SnapshotResult;

    fn name(&self) -> &str;
}

/// Bounds for the per-request price fan-out.
#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    pub concurrency: usize,
    pub timeout: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            concurrency: 8,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Fetches snapshots for every distinct symbol, at most `options.concurrency`
/// at a time, each under its own timeout. Always returns one entry per distinct
/// symbol; a slow or failing lookup only affects its own entry.
pub async fn fetch_snapshots(
    provider: &dyn SnapshotProvider,
    symbols: &[String],
    options: FetchOptions,
    on_progress: &(dyn Fn() + Send + Sync),
) -> HashMap<String, SnapshotResult> {
    let mut seen = HashSet::new();
    let unique: Vec<&String> = symbols.iter().filter(|s| seen.insert(*s)).collect();
    debug!(
        symbols = unique.len(),
        concurrency = options.concurrency,
        "Fetching price snapshots"
    );

    stream::iter(unique)
        .map(|symbol| async move {
            let result = match tokio::time::timeout(options.timeout, provider.get_snapshot(symbol))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(SnapshotError::Timeout(options.timeout)),
            };
            if let Err(e) = &result {
                warn!(symbol = %symbol, provider = provider.name(), error = ?e, "Price lookup failed");
            }
            on_progress();
            (symbol.clone(), result)
        })
        .buffer_unordered(options.concurrency.max(1))
        .collect()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedProvider {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new() -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SnapshotProvider for ScriptedProvider {
        async fn get_snapshot(&self, symbol: &str) -> SnapshotResult {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let result = match symbol {
                "SLOW" => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(PriceSnapshot::new(1.0, None, Utc::now()))
                }
                "MISSING" => Err(SnapshotError::NotFound(symbol.to_string())),
                _ => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(PriceSnapshot::new(100.0, Some(1.5), Utc::now()))
                }
            };
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    #[tokio::test]
    async fn test_fetch_isolates_slow_and_failing_symbols() {
        let provider = ScriptedProvider::new();
        let symbols: Vec<String> = ["AAPL", "SLOW", "MISSING", "MSFT", "AAPL"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let progress = AtomicUsize::new(0);
        let options = FetchOptions {
            concurrency: 4,
            timeout: Duration::from_millis(100),
        };

        let results = fetch_snapshots(&provider, &symbols, options, &|| {
            progress.fetch_add(1, Ordering::SeqCst);
        })
        .await;

        assert_eq!(results.len(), 4);
        assert_eq!(progress.load(Ordering::SeqCst), 4);
        assert_eq!(results["AAPL"].as_ref().unwrap().price, 100.0);
        assert_eq!(results["MSFT"].as_ref().unwrap().price, 100.0);
        assert_eq!(
            results["SLOW"],
            Err(SnapshotError::Timeout(Duration::from_millis(100)))
        );
        assert_eq!(
            results["MISSING"],
            Err(SnapshotError::NotFound("MISSING".to_string()))
        );
    }

    #[tokio::test]
    async fn test_fetch_respects_concurrency_bound() {
        let provider = ScriptedProvider::new();
        let symbols: Vec<String> = (0..10).map(|i| format!("SYM{i}")).collect();
        let options = FetchOptions {
            concurrency: 3,
            timeout: Duration::from_secs(1),
        };

        let results = fetch_snapshots(&provider, &symbols, options, &|| ()).await;

        assert_eq!(results.len(), 10);
        assert!(provider.max_in_flight.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn test_snapshot_staleness() {
        let now = Utc::now();
        let snapshot = PriceSnapshot::new(10.0, None, now - ChronoDuration::minutes(30));
        assert!(snapshot.is_stale(now, ChronoDuration::minutes(15)));
        assert!(!snapshot.is_stale(now, ChronoDuration::hours(1)));
        assert!(snapshot.is_usable());
        assert!(!PriceSnapshot::new(f64::NAN, None, now).is_usable());
    }
}
