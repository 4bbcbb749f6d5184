pub mod cli;
pub mod core;
pub mod providers;
pub mod service;
pub mod store;

use crate::core::alert::AlertType;
use crate::core::clock::SystemClock;
use crate::core::config::AppConfig;
use crate::service::CreditfolioService;
use crate::store::StoreHandles;
use crate::store::disk::DiskStore;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum AppCommand {
    Check {
        account: String,
        feature: String,
        extra: bool,
        reference: Option<String>,
    },
    Portfolio {
        ids: Vec<String>,
    },
    Alerts(AlertCommand),
    Ledger(LedgerCommand),
}

#[derive(Debug, Clone)]
pub enum AlertCommand {
    Add {
        account: String,
        symbol: String,
        alert_type: AlertType,
        target: f64,
    },
    List {
        account: String,
    },
    Remove {
        id: Uuid,
    },
    Pause {
        id: Uuid,
    },
    Resume {
        id: Uuid,
    },
    Evaluate {
        account: String,
    },
    History {
        id: Uuid,
    },
}

#[derive(Debug, Clone)]
pub enum LedgerCommand {
    History {
        account: String,
    },
    Grant {
        account: String,
        amount: u64,
        reason: String,
        reference: Option<String>,
    },
    Allowance {
        account: String,
    },
    Audit {
        account: String,
    },
    Release {
        account: String,
        reference: Option<String>,
    },
}

/// Opens the store under the configured data path and syncs the configured
/// accounts into it.
pub async fn build_service(config: &AppConfig) -> Result<CreditfolioService> {
    let data_path = config.default_data_path()?;
    std::fs::create_dir_all(&data_path)
        .with_context(|| format!("Failed to create data directory: {}", data_path.display()))?;
    let store = DiskStore::open(&data_path.join("store"))
        .with_context(|| format!("Failed to open store in {}", data_path.display()))?;
    debug!("Opened store at {}", data_path.display());

    let provider = providers::build_provider(&config.providers, &config.fetch);
    let service = CreditfolioService::new(
        StoreHandles::new(Arc::new(store)),
        provider,
        Arc::new(SystemClock),
    )
    .with_features(config.feature_table())
    .with_portfolios(config.portfolios.clone())
    .with_fetch(config.fetch.options(), config.fetch.staleness())
    .with_hold_lease(config.ledger.hold_lease());

    service
        .open_accounts(&config.accounts)
        .await
        .context("Failed to open configured accounts")?;
    Ok(service)
}

pub async fn run_command(command: AppCommand, config_path: Option<&str>) -> Result<()> {
    info!("creditfolio starting...");

    let config = match config_path {
        Some(path) => AppConfig::load_from_path(path)?,
        None => AppConfig::load()?,
    };
    debug!("Loaded config: {config:#?}");

    let service = build_service(&config).await?;

    match command {
        AppCommand::Check {
            account,
            feature,
            extra,
            reference,
        } => cli::check::run(&service, &account, &feature, extra, reference.as_deref()).await,
        AppCommand::Portfolio { ids } => cli::portfolio::run(&service, &ids).await,
        AppCommand::Alerts(command) => cli::alerts::run(&service, command).await,
        AppCommand::Ledger(command) => cli::ledger::run(&service, command).await,
    }
}
