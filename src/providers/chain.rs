use crate::core::price::{SnapshotError, SnapshotProvider, SnapshotResult};
use async_trait::async_trait;
use tracing::debug;

/// Asks each provider in turn until one produces a snapshot.
///
/// When every provider fails, the last error is returned, except that
/// `NotFound` from one provider never hides a transient failure from another.
pub struct ChainProvider {
    providers: Vec<Box<dyn SnapshotProvider>>,
}

impl ChainProvider {
    pub fn new(providers: Vec<Box<dyn SnapshotProvider>>) -> Self {
        Self { providers }
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[async_trait]
impl SnapshotProvider for ChainProvider {
    async fn get_snapshot(&self, symbol: &str) -> SnapshotResult {
        let mut last_error: Option<SnapshotError> = None;
        for provider in &self.providers {
            match provider.get_snapshot(symbol).await {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) => {
                    debug!("{} could not price {}: {:?}", provider.name(), symbol, e);
                    let keep_previous = matches!(e, SnapshotError::NotFound(_))
                        && last_error.as_ref().is_some_and(SnapshotError::is_transient);
                    if !keep_previous {
                        last_error = Some(e);
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| SnapshotError::NotFound(symbol.to_string())))
    }

    fn name(&self) -> &str {
        "chain"
    }
}
