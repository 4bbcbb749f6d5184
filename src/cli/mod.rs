pub mod alerts;
pub mod check;
pub mod ledger;
pub mod portfolio;
pub mod setup;
pub mod ui;
