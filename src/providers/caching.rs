use crate::core::cache::Cache;
use crate::core::price::{PriceSnapshot, SnapshotProvider, SnapshotResult};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Keeps successful snapshots for `ttl`. Failures are never cached, so the
/// next request for the symbol goes back to the inner provider.
#[derive(Clone)]
pub struct CachingSnapshotProvider<T: SnapshotProvider> {
    inner: T,
    cache: Cache<String, PriceSnapshot>,
    ttl: Duration,
}

impl<T: SnapshotProvider> CachingSnapshotProvider<T> {
    pub fn new(inner: T, ttl: Duration) -> Self {
        Self {
            inner,
            cache: Cache::new(),
            ttl,
        }
    }
}

#[async_trait]
impl<T: SnapshotProvider> SnapshotProvider for CachingSnapshotProvider<T> {
    async fn get_snapshot(&self, symbol: &str) -> SnapshotResult {
        let key = symbol.to_uppercase();
        if let Some(snapshot) = self.cache.get(&key).await {
            return Ok(snapshot);
        }
        let result = self.inner.get_snapshot(symbol).await;
        match &result {
            Ok(snapshot) => self.cache.put(key, snapshot.clone(), Some(self.ttl)).await,
            Err(e) => debug!("Not caching failed snapshot for {}: {}", symbol, e),
        }
        result
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
