use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use creditfolio::core::alert::AlertType;
use creditfolio::core::log::init_logging;
use creditfolio::{AlertCommand, AppCommand, LedgerCommand};
use uuid::Uuid;

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to optional configuration file
    #[arg(short, long, global = true)]
    config_path: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create default configuration
    Setup,
    /// Check access to a feature and charge its credits
    Check {
        account: String,
        feature: String,
        /// Buy an extra unit even if the tier includes the feature
        #[arg(long)]
        extra: bool,
        /// Idempotency key; repeating it never charges twice
        #[arg(long)]
        reference: Option<String>,
    },
    /// Display portfolio valuation (all portfolios if none given)
    Portfolio { ids: Vec<String> },
    /// Manage price alerts
    #[command(subcommand)]
    Alerts(AlertCommands),
    /// Inspect and top up credit balances
    #[command(subcommand)]
    Ledger(LedgerCommands),
}

#[derive(Subcommand)]
enum AlertCommands {
    /// Create an alert
    Add {
        account: String,
        symbol: String,
        /// price-above, price-below or percentage-change
        #[arg(value_parser = parse_alert_type)]
        alert_type: AlertType,
        target: f64,
    },
    /// List an account's alerts
    List { account: String },
    /// Delete an alert
    Remove { id: Uuid },
    /// Stop evaluating an alert
    Pause { id: Uuid },
    /// Evaluate a paused alert again
    Resume { id: Uuid },
    /// Evaluate an account's active alerts against current prices
    Evaluate { account: String },
    /// Show when an alert fired
    History { id: Uuid },
}

#[derive(Subcommand)]
enum LedgerCommands {
    /// Show the transaction log
    History { account: String },
    /// Add credits
    Grant {
        account: String,
        amount: u64,
        #[arg(long, default_value = "manual_grant")]
        reason: String,
        #[arg(long)]
        reference: Option<String>,
    },
    /// Grant this month's allowance (once per month)
    Allowance { account: String },
    /// Reconcile balance against the log
    Audit { account: String },
    /// Give back held credits: one reference, or every hold past its lease
    Release {
        account: String,
        reference: Option<String>,
    },
}

fn parse_alert_type(s: &str) -> Result<AlertType, String> {
    s.parse().map_err(|e: anyhow::Error| e.to_string())
}

impl From<AlertCommands> for AlertCommand {
    fn from(cmd: AlertCommands) -> AlertCommand {
        match cmd {
            AlertCommands::Add {
                account,
                symbol,
                alert_type,
                target,
            } => AlertCommand::Add {
                account,
                symbol,
                alert_type,
                target,
            },
            AlertCommands::List { account } => AlertCommand::List { account },
            AlertCommands::Remove { id } => AlertCommand::Remove { id },
            AlertCommands::Pause { id } => AlertCommand::Pause { id },
            AlertCommands::Resume { id } => AlertCommand::Resume { id },
            AlertCommands::Evaluate { account } => AlertCommand::Evaluate { account },
            AlertCommands::History { id } => AlertCommand::History { id },
        }
    }
}

impl From<LedgerCommands> for LedgerCommand {
    fn from(cmd: LedgerCommands) -> LedgerCommand {
        match cmd {
            LedgerCommands::History { account } => LedgerCommand::History { account },
            LedgerCommands::Grant {
                account,
                amount,
                reason,
                reference,
            } => LedgerCommand::Grant {
                account,
                amount,
                reason,
                reference,
            },
            LedgerCommands::Allowance { account } => LedgerCommand::Allowance { account },
            LedgerCommands::Audit { account } => LedgerCommand::Audit { account },
            LedgerCommands::Release { account, reference } => {
                LedgerCommand::Release { account, reference }
            }
        }
    }
}

impl From<Commands> for AppCommand {
    fn from(cmd: Commands) -> AppCommand {
        match cmd {
            Commands::Check {
                account,
                feature,
                extra,
                reference,
            } => AppCommand::Check {
                account,
                feature,
                extra,
                reference,
            },
            Commands::Portfolio { ids } => AppCommand::Portfolio { ids },
            Commands::Alerts(cmd) => AppCommand::Alerts(cmd.into()),
            Commands::Ledger(cmd) => AppCommand::Ledger(cmd.into()),
            Commands::Setup => unreachable!("Setup command should be handled separately"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let result = match cli.command {
        Some(Commands::Setup) => match cli.config_path.as_deref() {
            Some(path) => creditfolio::cli::setup::setup_at_path(path),
            None => creditfolio::cli::setup::setup(),
        },
        Some(cmd) => creditfolio::run_command(cmd.into(), cli.config_path.as_deref()).await,
        None => {
            Cli::command().print_help()?;
            Ok(())
        }
    };

    if let Err(e) = &result {
        tracing::error!(error = %e, "Application failed");
    }
    result
}
