//! Edge-triggered price alerts.
//!
//! Evaluation is pure: given an alert, a snapshot and the current time it
//! returns the decision and the alert's next state. Persisting that state and
//! handing triggers to a dispatcher is the caller's business.

use crate::core::price::PriceSnapshot;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

/// Largest accepted magnitude for a percentage-change alert.
pub const MAX_PERCENT_TARGET: f64 = 1000.0;

/// A percentage-change alert fires at most once per window.
pub const PERCENT_CHANGE_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AlertType {
    PriceAbove,
    PriceBelow,
    PercentageChange,
}

impl Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                AlertType::PriceAbove => "price-above",
                AlertType::PriceBelow => "price-below",
                AlertType::PercentageChange => "percentage-change",
            }
        )
    }
}

impl FromStr for AlertType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "price-above" | "priceabove" | "above" => Ok(AlertType::PriceAbove),
            "price-below" | "pricebelow" | "below" => Ok(AlertType::PriceBelow),
            "percentage-change" | "percentagechange" | "percent" => {
                Ok(AlertType::PercentageChange)
            }
            _ => Err(anyhow::anyhow!("Invalid alert type: {}", s)),
        }
    }
}

/// What a condition needs to decide whether to fire.
struct ConditionInput<'a> {
    alert: &'a Alert,
    snapshot: &'a PriceSnapshot,
    now: DateTime<Utc>,
}

struct Condition {
    /// Whether the condition holds right now.
    holds: fn(&ConditionInput) -> bool,
    /// Whether a firing is allowed given the alert's history.
    armed: fn(&ConditionInput) -> bool,
    message: fn(&ConditionInput) -> String,
}

static PRICE_ABOVE: Condition = Condition {
    holds: |i| i.snapshot.price > i.alert.target_value,
    armed: |i| {
        i.alert
            .last_observed_price
            .is_none_or(|prev| prev <= i.alert.target_value)
    },
    message: |i| format!("{} crossed above {}", i.alert.symbol, i.alert.target_value),
};

static PRICE_BELOW: Condition = Condition {
    holds: |i| i.snapshot.price < i.alert.target_value,
    armed: |i| {
        i.alert
            .last_observed_price
            .is_none_or(|prev| prev >= i.alert.target_value)
    },
    message: |i| format!("{} crossed below {}", i.alert.symbol, i.alert.target_value),
};

static PERCENTAGE_CHANGE: Condition = Condition {
    holds: |i| {
        i.snapshot
            .change_24h_percent
            .is_some_and(|change| change.is_finite() && change.abs() >= i.alert.target_value)
    },
    armed: |i| {
        i.alert.last_triggered_at.is_none_or(|last| {
            i.now - last >= Duration::hours(PERCENT_CHANGE_WINDOW_HOURS)
        })
    },
    message: |i| {
        format!(
            "{} moved {:+.2}% in 24h (threshold {}%)",
            i.alert.symbol,
            i.snapshot.change_24h_percent.unwrap_or_default(),
            i.alert.target_value
        )
    },
};

impl AlertType {
    fn condition(&self) -> &'static Condition {
        match self {
            AlertType::PriceAbove => &PRICE_ABOVE,
            AlertType::PriceBelow => &PRICE_BELOW,
            AlertType::PercentageChange => &PERCENTAGE_CHANGE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub account_id: String,
    pub symbol: String,
    pub alert_type: AlertType,
    pub target_value: f64,
    pub is_active: bool,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub trigger_count: u64,
    pub last_observed_price: Option<f64>,
    pub revision: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewAlert {
    pub account_id: String,
    pub symbol: String,
    pub alert_type: AlertType,
    pub target_value: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid alert: {0}")]
pub struct AlertConditionInvalid(pub String);

impl NewAlert {
    pub fn validate(&self) -> Result<(), AlertConditionInvalid> {
        if self.symbol.trim().is_empty() {
            return Err(AlertConditionInvalid("symbol must not be empty".into()));
        }
        if !self.target_value.is_finite() || self.target_value <= 0.0 {
            return Err(AlertConditionInvalid(format!(
                "target value must be a positive number, got {}",
                self.target_value
            )));
        }
        if self.alert_type == AlertType::PercentageChange && self.target_value > MAX_PERCENT_TARGET
        {
            return Err(AlertConditionInvalid(format!(
                "percentage target must be at most {MAX_PERCENT_TARGET}"
            )));
        }
        Ok(())
    }

    /// Validates and builds the stored alert.
    pub fn into_alert(self, now: DateTime<Utc>) -> Result<Alert, AlertConditionInvalid> {
        self.validate()?;
        Ok(Alert {
            id: Uuid::new_v4(),
            account_id: self.account_id,
            symbol: self.symbol.trim().to_string(),
            alert_type: self.alert_type,
            target_value: self.target_value,
            is_active: true,
            last_triggered_at: None,
            trigger_count: 0,
            last_observed_price: None,
            revision: 0,
            created_at: now,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerDecision {
    pub alert_id: Uuid,
    pub symbol: String,
    pub fired: bool,
    pub message: String,
}

/// Record of one firing, handed to the notification dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertTrigger {
    pub alert_id: Uuid,
    pub account_id: String,
    pub symbol: String,
    pub alert_type: AlertType,
    pub target_value: f64,
    pub observed_price: f64,
    pub change_24h_percent: Option<f64>,
    pub message: String,
    pub triggered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub decision: TriggerDecision,
    /// `None` when the alert is inactive and nothing changes.
    pub next: Option<Alert>,
    pub trigger: Option<AlertTrigger>,
}

pub fn evaluate(alert: &Alert, snapshot: &PriceSnapshot, now: DateTime<Utc>) -> Evaluation {
    if !alert.is_active {
        return Evaluation {
            decision: TriggerDecision {
                alert_id: alert.id,
                symbol: alert.symbol.clone(),
                fired: false,
                message: format!("{} alert is inactive", alert.symbol),
            },
            next: None,
            trigger: None,
        };
    }

    let input = ConditionInput {
        alert,
        snapshot,
        now,
    };
    let condition = alert.alert_type.condition();
    let fired = (condition.holds)(&input) && (condition.armed)(&input);

    let mut next = alert.clone();
    next.last_observed_price = Some(snapshot.price);

    let (message, trigger) = if fired {
        let message = (condition.message)(&input);
        next.trigger_count += 1;
        next.last_triggered_at = Some(now);
        let trigger = AlertTrigger {
            alert_id: alert.id,
            account_id: alert.account_id.clone(),
            symbol: alert.symbol.clone(),
            alert_type: alert.alert_type,
            target_value: alert.target_value,
            observed_price: snapshot.price,
            change_24h_percent: snapshot.change_24h_percent,
            message: message.clone(),
            triggered_at: now,
        };
        (message, Some(trigger))
    } else {
        (
            format!("{} at {} did not trigger", alert.symbol, snapshot.price),
            None,
        )
    };

    Evaluation {
        decision: TriggerDecision {
            alert_id: alert.id,
            symbol: alert.symbol.clone(),
            fired,
            message,
        },
        next: Some(next),
        trigger,
    }
}

/// Receives alert firings. Delivery and its retries belong to the implementor.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn dispatch(&self, trigger: &AlertTrigger);
}

/// Dispatcher that only writes triggers to the log.
#[derive(Debug, Default, Clone)]
pub struct LogDispatcher;

#[async_trait]
impl NotificationDispatcher for LogDispatcher {
    async fn dispatch(&self, trigger: &AlertTrigger) {
        info!(
            alert = %trigger.alert_id,
            account = %trigger.account_id,
            symbol = %trigger.symbol,
            "{}",
            trigger.message
        );
    }
}
