//! Domain logic: entitlements, credits, valuation and alerts

pub mod alert;
pub mod cache;
pub mod clock;
pub mod config;
pub mod entitlement;
pub mod error;
pub mod ledger;
pub mod log;
pub mod price;
pub mod valuation;

pub use error::CoreError;
pub use price::{PriceSnapshot, SnapshotError, SnapshotProvider, SnapshotResult};
