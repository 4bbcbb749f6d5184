//! CoinGecko spot prices for crypto assets.
//!
//! Uses the `/simple/price` endpoint, which returns the current price, the
//! 24h change and the last update time for one or more coin ids.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument};

use super::util::{status_error, transport_error, with_retry};
use crate::core::price::{PriceSnapshot, SnapshotError, SnapshotProvider, SnapshotResult};

pub const DEFAULT_BASE_URL: &str = "https://api.coingecko.com/api/v3";

#[derive(Debug, Deserialize)]
struct CoinQuote(HashMap<String, f64>);

/// CoinGecko price source.
///
/// Symbols are mapped to CoinGecko coin ids; unknown symbols are passed
/// through lowercased so callers can use ids directly.
pub struct CoinGeckoProvider {
    base_url: String,
    client: reqwest::Client,
    /// Quote currency for prices (e.g., "usd", "eur")
    vs_currency: String,
    mappings: HashMap<String, String>,
    request_timeout: Duration,
    retries: usize,
}

impl CoinGeckoProvider {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            vs_currency: "usd".to_string(),
            mappings: HashMap::new(),
            request_timeout: Duration::from_secs(5),
            retries: 0,
        }
    }

    pub fn with_vs_currency(mut self, currency: impl Into<String>) -> Self {
        self.vs_currency = currency.into().to_lowercase();
        self
    }

    /// Adds custom symbol to CoinGecko ID mappings; these win over the built-in ones.
    pub fn with_mappings(mut self, mappings: HashMap<String, String>) -> Self {
        self.mappings = mappings
            .into_iter()
            .map(|(symbol, id)| (symbol.to_uppercase(), id))
            .collect();
        self
    }

    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn coin_id(&self, symbol: &str) -> String {
        let symbol_upper = symbol.to_uppercase();
        if let Some(id) = self.mappings.get(&symbol_upper) {
            return id.clone();
        }
        let id = match symbol_upper.as_str() {
            "BTC" => "bitcoin",
            "ETH" => "ethereum",
            "USDT" => "tether",
            "USDC" => "usd-coin",
            "BNB" => "binancecoin",
            "XRP" => "ripple",
            "ADA" => "cardano",
            "DOGE" => "dogecoin",
            "SOL" => "solana",
            "DOT" => "polkadot",
            "LTC" => "litecoin",
            "AVAX" => "avalanche-2",
            "LINK" => "chainlink",
            "MATIC" | "POL" => "matic-network",
            _ => return symbol.to_lowercase(),
        };
        id.to_string()
    }

    async fn fetch_once(&self, symbol: &str) -> SnapshotResult {
        let id = self.coin_id(symbol);
        let url = reqwest::Url::parse_with_params(
            &format!("{}/simple/price", self.base_url),
            &[
                ("ids", id.as_str()),
                ("vs_currencies", self.vs_currency.as_str()),
                ("include_24hr_change", "true"),
                ("include_last_updated_at", "true"),
            ],
        )
        .map_err(|e| SnapshotError::Unavailable(format!("Invalid CoinGecko URL: {e}")))?;
        debug!("Requesting {} from {}", id, url);

        let response = self
            .client
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| transport_error(e, self.request_timeout))?;

        if !response.status().is_success() {
            return Err(status_error(response.status(), symbol));
        }

        let mut body: HashMap<String, CoinQuote> = response
            .json()
            .await
            .map_err(|e| SnapshotError::Unavailable(format!("Malformed response for {id}: {e}")))?;
        let quote = body
            .remove(&id)
            .ok_or_else(|| SnapshotError::NotFound(symbol.to_string()))?
            .0;

        let price = quote
            .get(&self.vs_currency)
            .copied()
            .ok_or_else(|| SnapshotError::NotFound(symbol.to_string()))?;
        let change = quote
            .get(&format!("{}_24h_change", self.vs_currency))
            .copied();
        let as_of = quote
            .get("last_updated_at")
            .and_then(|ts| Utc.timestamp_opt(*ts as i64, 0).single())
            .unwrap_or_else(Utc::now);

        Ok(PriceSnapshot::new(price, change, as_of))
    }
}

#[async_trait]
impl SnapshotProvider for CoinGeckoProvider {
    #[instrument(name = "CoinGeckoSnapshotFetch", skip(self), fields(symbol = %symbol))]
    async fn get_snapshot(&self, symbol: &str) -> SnapshotResult {
        with_retry(|| self.fetch_once(symbol), self.retries, 500).await
    }

    fn name(&self) -> &str {
        "coingecko"
    }
}
