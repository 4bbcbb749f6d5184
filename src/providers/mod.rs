pub mod caching;
pub mod chain;
pub mod coingecko;
pub mod util;
pub mod yahoo_finance;

use crate::core::config::{FetchConfig, ProvidersConfig};
use crate::core::price::SnapshotProvider;
use caching::CachingSnapshotProvider;
use chain::ChainProvider;
use coingecko::CoinGeckoProvider;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use yahoo_finance::YahooFinanceProvider;

/// Builds the configured providers into one cached chain. CoinGecko goes
/// first since it answers unknown coins with an empty body, cheaply, before
/// stock symbols fall through to Yahoo.
pub fn build_provider(providers: &ProvidersConfig, fetch: &FetchConfig) -> Arc<dyn SnapshotProvider> {
    let request_timeout = Duration::from_millis(fetch.timeout_ms);
    let mut chain: Vec<Box<dyn SnapshotProvider>> = Vec::new();

    if let Some(coingecko) = &providers.coingecko {
        chain.push(Box::new(
            CoinGeckoProvider::new(&coingecko.base_url)
                .with_vs_currency(coingecko.vs_currency.as_str())
                .with_mappings(coingecko.mappings.clone())
                .with_retries(fetch.retries)
                .with_request_timeout(request_timeout),
        ));
    }
    if let Some(yahoo) = &providers.yahoo {
        chain.push(Box::new(
            YahooFinanceProvider::new(&yahoo.base_url)
                .with_retries(fetch.retries)
                .with_request_timeout(request_timeout),
        ));
    }
    let chain = ChainProvider::new(chain);
    if chain.is_empty() {
        warn!("No price providers configured, every lookup will fall back");
    }
    debug!(providers = chain.len(), "Built price provider chain");

    Arc::new(CachingSnapshotProvider::new(
        chain,
        Duration::from_secs(fetch.cache_ttl_secs),
    ))
}
