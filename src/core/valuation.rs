//! Profit/loss, allocation and ranking metrics for a portfolio.
//!
//! Everything here is a pure calculation over holdings and already-fetched
//! snapshots. A holding whose price could not be fetched is valued at its
//! last stored price, or at its purchase price when nothing better exists,
//! so one failed lookup never fails the portfolio.

use crate::core::price::{PriceSnapshot, SnapshotResult};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub symbol: String,
    pub amount: f64,
    pub purchase_price: f64,
    pub purchase_date: NaiveDate,
    /// Last known price; may be stale.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_price: Option<f64>,
}

/// Where the price used for a holding came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceSource {
    Live,
    Stored,
    Purchase,
}

impl Display for PriceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                PriceSource::Live => "live",
                PriceSource::Stored => "stored",
                PriceSource::Purchase => "purchase",
            }
        )
    }
}

/// Decides when a live snapshot is too old to be trusted.
#[derive(Debug, Clone, Copy)]
pub struct Freshness {
    pub now: DateTime<Utc>,
    pub max_age: ChronoDuration,
}

impl Freshness {
    pub fn new(now: DateTime<Utc>, max_age: ChronoDuration) -> Self {
        Self { now, max_age }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HoldingMetrics {
    pub symbol: String,
    pub amount: f64,
    pub purchase_price: f64,
    pub current_price: f64,
    pub price_source: PriceSource,
    pub current_value: f64,
    pub invested: f64,
    pub pnl: f64,
    pub pnl_percentage: f64,
    pub change_24h_percent: Option<f64>,
    /// Value moved over the last 24h, from the live snapshot's change.
    pub day_change_value: f64,
    pub allocation_percentage: f64,
    pub stale: bool,
    /// User-facing reason the live price was not used.
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortfolioMetrics {
    pub holdings: Vec<HoldingMetrics>,
    pub total_value: f64,
    pub total_invested: f64,
    pub total_pnl: f64,
    pub total_pnl_percentage: f64,
    pub best_performer: Option<String>,
    pub worst_performer: Option<String>,
    pub day_change_value: f64,
    pub degraded_holdings: usize,
}

impl PortfolioMetrics {
    /// Holdings by `pnl_percentage`, highest first. Equal holdings keep
    /// their portfolio order.
    pub fn ranked(&self) -> Vec<&HoldingMetrics> {
        let mut ranked: Vec<&HoldingMetrics> = self.holdings.iter().collect();
        ranked.sort_by(|a, b| b.pnl_percentage.total_cmp(&a.pnl_percentage));
        ranked
    }

    /// Prices that came from a live snapshot, for writing back to storage.
    pub fn live_prices(&self) -> Vec<(String, f64)> {
        self.holdings
            .iter()
            .filter(|h| h.price_source == PriceSource::Live)
            .map(|h| (h.symbol.clone(), h.current_price))
            .collect()
    }
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() { value } else { 0.0 }
}

/// Negative and non-finite inputs count as zero.
fn non_negative(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

fn percentage(part: f64, whole: f64) -> f64 {
    if whole > 0.0 {
        finite_or_zero(part / whole * 100.0)
    } else {
        0.0
    }
}

fn usable_live(snapshot: Option<&SnapshotResult>) -> Result<Option<&PriceSnapshot>, String> {
    match snapshot {
        None => Ok(None),
        Some(Ok(s)) if s.is_usable() => Ok(Some(s)),
        Some(Ok(s)) => Err(format!("provider returned an unusable price ({})", s.price)),
        Some(Err(e)) => Err(e.to_string()),
    }
}

pub fn compute_holding_metrics(
    holding: &Holding,
    snapshot: Option<&SnapshotResult>,
    freshness: Freshness,
) -> HoldingMetrics {
    let amount = non_negative(holding.amount);
    let purchase_price = non_negative(holding.purchase_price);

    let (live, error) = match usable_live(snapshot) {
        Ok(live) => (live, None),
        Err(e) => (None, Some(e)),
    };
    let stored = holding
        .current_price
        .filter(|p| p.is_finite() && *p >= 0.0);

    let (current_price, price_source, change, stale) = match (live, stored) {
        (Some(s), _) => (
            s.price,
            PriceSource::Live,
            s.change_24h_percent.filter(|c| c.is_finite()),
            s.is_stale(freshness.now, freshness.max_age),
        ),
        (None, Some(price)) => (price, PriceSource::Stored, None, true),
        (None, None) => (purchase_price, PriceSource::Purchase, None, true),
    };

    let current_value = finite_or_zero(amount * current_price);
    let invested = finite_or_zero(amount * purchase_price);
    let pnl = current_value - invested;
    let day_change_value = change
        .map(|c| {
            let factor = 1.0 + c / 100.0;
            if factor > 0.0 {
                finite_or_zero(current_value - current_value / factor)
            } else {
                0.0
            }
        })
        .unwrap_or(0.0);

    HoldingMetrics {
        symbol: holding.symbol.clone(),
        amount,
        purchase_price,
        current_price,
        price_source,
        current_value,
        invested,
        pnl,
        pnl_percentage: percentage(pnl, invested),
        change_24h_percent: change,
        day_change_value,
        allocation_percentage: 0.0,
        stale,
        error,
    }
}

pub fn compute_portfolio_metrics(
    holdings: &[Holding],
    snapshots: &HashMap<String, SnapshotResult>,
    freshness: Freshness,
) -> PortfolioMetrics {
    let mut metrics: Vec<HoldingMetrics> = holdings
        .iter()
        .map(|h| compute_holding_metrics(h, snapshots.get(&h.symbol), freshness))
        .collect();

    let total_value: f64 = metrics.iter().map(|m| m.current_value).sum();
    let total_invested: f64 = metrics.iter().map(|m| m.invested).sum();
    let total_pnl = total_value - total_invested;

    for m in &mut metrics {
        m.allocation_percentage = percentage(m.current_value, total_value);
    }

    let mut best: Option<&HoldingMetrics> = None;
    let mut worst: Option<&HoldingMetrics> = None;
    for m in &metrics {
        if best.is_none_or(|b| m.pnl_percentage > b.pnl_percentage) {
            best = Some(m);
        }
        if worst.is_none_or(|w| m.pnl_percentage < w.pnl_percentage) {
            worst = Some(m);
        }
    }
    let best_performer = best.map(|m| m.symbol.clone());
    let worst_performer = worst.map(|m| m.symbol.clone());

    PortfolioMetrics {
        total_value,
        total_invested,
        total_pnl,
        total_pnl_percentage: percentage(total_pnl, total_invested),
        best_performer,
        worst_performer,
        day_change_value: metrics.iter().map(|m| m.day_change_value).sum(),
        degraded_holdings: metrics
            .iter()
            .filter(|m| m.price_source != PriceSource::Live)
            .count(),
        holdings: metrics,
    }
}
