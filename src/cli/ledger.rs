use super::ui;
use crate::LedgerCommand;
use crate::core::ledger::{AuditReport, CreditTransaction};
use crate::service::CreditfolioService;
use anyhow::Result;
use chrono::Utc;
use comfy_table::Cell;

pub async fn run(service: &CreditfolioService, command: LedgerCommand) -> Result<()> {
    let ledger = service.ledger();
    match command {
        LedgerCommand::History { account } => {
            let current = ledger.account(&account).await?;
            let history = ledger.history(&account).await?;
            println!(
                "Account: {} ({} tier)\n",
                ui::style_text(&current.id, ui::StyleType::Title),
                current.tier
            );
            println!("{}", history_table(&history));
            println!(
                "\n{} {}",
                ui::style_text("Balance:", ui::StyleType::TotalLabel),
                ui::style_text(&current.credit_balance.to_string(), ui::StyleType::TotalValue)
            );
        }
        LedgerCommand::Grant {
            account,
            amount,
            reason,
            reference,
        } => {
            let tx = ledger
                .credit(&account, amount, &reason, reference.as_deref())
                .await?;
            println!(
                "Granted {} credit(s) to {}, balance {}",
                tx.amount, account, tx.balance_after
            );
        }
        LedgerCommand::Allowance { account } => {
            let tx = ledger.grant_monthly_allowance(&account, Utc::now()).await?;
            println!(
                "Monthly allowance for {} ({}): +{}, balance {}",
                account,
                tx.reference_id,
                tx.amount,
                tx.balance_after
            );
        }
        LedgerCommand::Release {
            account,
            reference: Some(reference),
        } => {
            let balance = ledger.release_hold(&account, &reference).await?;
            println!("Released {reference} for {account}, balance {balance}");
        }
        LedgerCommand::Release {
            account,
            reference: None,
        } => {
            let released = ledger.reclaim_stale_holds(&account).await?;
            let total: u64 = released.iter().map(|h| h.amount).sum();
            println!(
                "Released {} abandoned hold(s) for {}, {} credit(s) returned",
                released.len(),
                account,
                total
            );
        }
        LedgerCommand::Audit { account } => {
            let report = ledger.audit(&account).await?;
            println!("{}", audit_summary(&report));
            if !report.is_consistent() {
                anyhow::bail!("Ledger for {account} does not reconcile");
            }
        }
    }
    Ok(())
}

fn history_table(history: &[CreditTransaction]) -> String {
    let mut table = ui::new_styled_table();
    table.set_header(vec![
        ui::header_cell("#"),
        ui::header_cell("When"),
        ui::header_cell("Amount"),
        ui::header_cell("Reason"),
        ui::header_cell("Reference"),
        ui::header_cell("Balance"),
    ]);
    for tx in history {
        table.add_row(vec![
            ui::number_cell(tx.seq.to_string()),
            Cell::new(tx.created_at.format("%Y-%m-%d %H:%M:%S")),
            ui::signed_cell(tx.amount as f64, format!("{:+}", tx.amount)),
            Cell::new(&tx.reason),
            Cell::new(&tx.reference_id),
            ui::number_cell(tx.balance_after.to_string()),
        ]);
    }
    table.to_string()
}

fn audit_summary(report: &AuditReport) -> String {
    let status = if report.is_consistent() {
        ui::style_text("consistent", ui::StyleType::TotalValue)
    } else {
        ui::style_text("MISMATCH", ui::StyleType::Error)
    };
    format!(
        "Account {}: balance {}, log sum {}, on hold {}, {} transaction(s) - {}",
        report.account_id,
        report.balance,
        report.ledger_sum,
        report.held,
        report.transactions,
        status
    )
}
