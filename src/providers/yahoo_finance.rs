use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::header::USER_AGENT;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument};

use super::util::{percent_change, status_error, transport_error, with_retry};
use crate::core::price::{PriceSnapshot, SnapshotError, SnapshotProvider, SnapshotResult};

pub const DEFAULT_BASE_URL: &str = "https://query1.finance.yahoo.com";

#[derive(Deserialize, Debug)]
struct YahooPriceResponse {
    chart: PriceChartResult,
}

#[derive(Deserialize, Debug)]
struct PriceChartResult {
    result: Option<Vec<PriceChartItem>>,
}

#[derive(Deserialize, Debug)]
struct PriceChartItem {
    meta: PriceChartMeta,
}

#[derive(Deserialize, Debug)]
struct PriceChartMeta {
    #[serde(alias = "regularMarketPrice")]
    regular_market_price: f64,
    #[serde(alias = "chartPreviousClose")]
    chart_previous_close: Option<f64>,
    #[serde(alias = "previousClose")]
    previous_close: Option<f64>,
    #[serde(alias = "regularMarketTime")]
    regular_market_time: Option<i64>,
}

pub struct YahooFinanceProvider {
    base_url: String,
    client: reqwest::Client,
    request_timeout: Duration,
    retries: usize,
}

impl YahooFinanceProvider {
    pub fn new(base_url: &str) -> Self {
        YahooFinanceProvider {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            request_timeout: Duration::from_secs(5),
            retries: 0,
        }
    }

    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    async fn fetch_once(&self, symbol: &str) -> SnapshotResult {
        let url = format!(
            "{}/v8/finance/chart/{}?interval=1d&range=1d",
            self.base_url, symbol
        );
        debug!("Requesting price data from {}", url);

        let response = self
            .client
            .get(&url)
            .header(USER_AGENT, "creditfolio/0.1")
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| transport_error(e, self.request_timeout))?;

        if !response.status().is_success() {
            return Err(status_error(response.status(), symbol));
        }

        let data = response
            .json::<YahooPriceResponse>()
            .await
            .map_err(|e| SnapshotError::Unavailable(format!("Malformed response for {symbol}: {e}")))?;
        let meta = data
            .chart
            .result
            .and_then(|items| items.into_iter().next())
            .map(|item| item.meta)
            .ok_or_else(|| SnapshotError::NotFound(symbol.to_string()))?;

        let price = meta.regular_market_price;
        let previous = meta.chart_previous_close.or(meta.previous_close);
        let as_of = meta
            .regular_market_time
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
            .unwrap_or_else(Utc::now);

        Ok(PriceSnapshot::new(price, percent_change(price, previous), as_of))
    }
}

#[async_trait]
impl SnapshotProvider for YahooFinanceProvider {
    #[instrument(name = "YahooSnapshotFetch", skip(self), fields(symbol = %symbol))]
    async fn get_snapshot(&self, symbol: &str) -> SnapshotResult {
        with_retry(|| self.fetch_once(symbol), self.retries, 200).await
    }

    fn name(&self) -> &str {
        "yahoo"
    }
}
