//! Tier ordering and the feature cost table

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use thiserror::Error;

/// Feature charged for a portfolio valuation.
pub const PORTFOLIO_METRICS_FEATURE: &str = "portfolio_metrics";
/// Feature charged for an alert sweep.
pub const ALERT_SWEEP_FEATURE: &str = "price_alert_sweep";

/// Rows every feature table must carry; the service bills these itself.
pub const REQUIRED_FEATURES: [&str; 2] = [PORTFOLIO_METRICS_FEATURE, ALERT_SWEEP_FEATURE];

/// Subscription level. Declaration order is the access order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Pro,
    Elite,
}

impl Tier {
    /// Maximum number of alerts an account on this tier may keep.
    pub fn max_alerts(&self) -> Option<usize> {
        match self {
            Tier::Free => Some(3),
            Tier::Pro => Some(25),
            Tier::Elite => None,
        }
    }
}

impl Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Tier::Free => "Free",
                Tier::Pro => "Pro",
                Tier::Elite => "Elite",
            }
        )
    }
}

impl FromStr for Tier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "pro" => Ok(Tier::Pro),
            "elite" => Ok(Tier::Elite),
            _ => Err(anyhow::anyhow!("Invalid tier: {}", s)),
        }
    }
}

/// One row of the cost table.
///
/// `included_from` marks the tier from which a regular invocation costs
/// nothing. `extra_cost` is what an explicit extra unit costs, even for tiers
/// that have the feature included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCost {
    pub feature_id: String,
    pub required_tier: Tier,
    pub credit_cost: u64,
    #[serde(default)]
    pub included_from: Option<Tier>,
    #[serde(default)]
    pub extra_cost: Option<u64>,
}

impl FeatureCost {
    fn cost_for(&self, tier: Tier, is_extra: bool) -> u64 {
        if is_extra {
            return self.extra_cost.unwrap_or(self.credit_cost);
        }
        match self.included_from {
            Some(included) if tier >= included => 0,
            _ => self.credit_cost,
        }
    }
}

/// Why a feature invocation was refused before touching the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Denial {
    #[error("requires {required} tier")]
    TierTooLow { feature_id: String, required: Tier },
    #[error("unknown feature: {0}")]
    UnknownFeature(String),
}

impl Denial {
    /// HTTP status a route layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            Denial::TierTooLow { .. } => 403,
            Denial::UnknownFeature(_) => 400,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub allowed: bool,
    pub credit_cost: u64,
    pub reason: Option<Denial>,
}

impl Resolution {
    fn allow(credit_cost: u64) -> Self {
        Self {
            allowed: true,
            credit_cost,
            reason: None,
        }
    }

    fn deny(reason: Denial) -> Self {
        Self {
            allowed: false,
            credit_cost: 0,
            reason: Some(reason),
        }
    }

    pub fn into_result(self) -> Result<u64, Denial> {
        match self.reason {
            Some(denial) => Err(denial),
            None => Ok(self.credit_cost),
        }
    }
}

/// Immutable lookup from feature id to its cost row.
#[derive(Debug, Clone)]
pub struct FeatureTable {
    rows: HashMap<String, FeatureCost>,
}

impl FeatureTable {
    pub fn new(rows: Vec<FeatureCost>) -> Self {
        Self {
            rows: rows
                .into_iter()
                .map(|row| (row.feature_id.clone(), row))
                .collect(),
        }
    }

    pub fn builtin() -> Self {
        let row = |id: &str, required: Tier, cost: u64, included: Option<Tier>, extra: Option<u64>| {
            FeatureCost {
                feature_id: id.to_string(),
                required_tier: required,
                credit_cost: cost,
                included_from: included,
                extra_cost: extra,
            }
        };
        Self::new(vec![
            row(PORTFOLIO_METRICS_FEATURE, Tier::Free, 1, Some(Tier::Pro), None),
            row(ALERT_SWEEP_FEATURE, Tier::Free, 1, Some(Tier::Pro), None),
            row("ai_insight", Tier::Pro, 4, None, None),
            row("weekly_report", Tier::Pro, 5, Some(Tier::Pro), Some(5)),
            row("risk_analysis", Tier::Pro, 8, Some(Tier::Elite), Some(8)),
            row("tax_report", Tier::Elite, 10, Some(Tier::Elite), Some(10)),
            row("whale_tracker", Tier::Elite, 2, None, None),
        ])
    }

    pub fn get(&self, feature_id: &str) -> Option<&FeatureCost> {
        self.rows.get(feature_id)
    }

    /// Required rows this table does not define.
    pub fn missing_required(&self) -> Vec<&'static str> {
        REQUIRED_FEATURES
            .into_iter()
            .filter(|id| !self.rows.contains_key(*id))
            .collect()
    }

    /// Decides whether `tier` may invoke `feature_id` and what it costs.
    pub fn resolve(&self, tier: Tier, feature_id: &str, is_extra: bool) -> Resolution {
        let Some(row) = self.get(feature_id) else {
            return Resolution::deny(Denial::UnknownFeature(feature_id.to_string()));
        };
        if tier < row.required_tier {
            return Resolution::deny(Denial::TierTooLow {
                feature_id: feature_id.to_string(),
                required: row.required_tier,
            });
        }
        Resolution::allow(row.cost_for(tier, is_extra))
    }
}

impl Default for FeatureTable {
    fn default() -> Self {
        Self::builtin()
    }
}
