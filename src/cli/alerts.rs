use super::ui;
use crate::AlertCommand;
use crate::core::alert::{Alert, AlertTrigger, NewAlert, TriggerDecision};
use crate::service::CreditfolioService;
use anyhow::Result;
use comfy_table::Cell;
use std::collections::HashSet;

pub async fn run(service: &CreditfolioService, command: AlertCommand) -> Result<()> {
    match command {
        AlertCommand::Add {
            account,
            symbol,
            alert_type,
            target,
        } => {
            let alert = service
                .create_alert(NewAlert {
                    account_id: account,
                    symbol,
                    alert_type,
                    target_value: target,
                })
                .await?;
            println!(
                "Created {} alert {} on {} at {}",
                alert.alert_type, alert.id, alert.symbol, alert.target_value
            );
        }
        AlertCommand::List { account } => {
            let alerts = service.list_alerts(&account).await?;
            if alerts.is_empty() {
                println!("No alerts for {account}");
            } else {
                println!("{}", alerts_table(&alerts));
            }
        }
        AlertCommand::Remove { id } => {
            service.delete_alert(&id).await?;
            println!("Removed alert {id}");
        }
        AlertCommand::Pause { id } => {
            let alert = service.set_alert_active(&id, false).await?;
            println!("Paused alert {} on {}", alert.id, alert.symbol);
        }
        AlertCommand::Resume { id } => {
            let alert = service.set_alert_active(&id, true).await?;
            println!("Resumed alert {} on {}", alert.id, alert.symbol);
        }
        AlertCommand::Evaluate { account } => {
            let symbols: HashSet<String> = service
                .list_alerts(&account)
                .await?
                .into_iter()
                .filter(|a| a.is_active)
                .map(|a| a.symbol)
                .collect();
            let pb = ui::new_progress_bar(symbols.len() as u64, true);
            pb.set_message("Checking alerts...");
            let pb_clone = pb.clone();
            let result = service
                .evaluate_alerts_with_progress(&account, &move || pb_clone.inc(1))
                .await;
            pb.finish_and_clear();
            let billed = result?;
            if billed.value.is_empty() {
                println!("No active alerts for {account}");
            } else {
                println!("{}", decisions_table(&billed.value));
            }
            println!(
                "{}",
                ui::style_text(
                    &format!(
                        "Charged {} credit(s), balance {}",
                        billed.charge.cost, billed.charge.new_balance
                    ),
                    ui::StyleType::Subtle
                )
            );
        }
        AlertCommand::History { id } => {
            let triggers = service.alert_triggers(&id).await?;
            if triggers.is_empty() {
                println!("Alert {id} has not fired yet");
            } else {
                println!("{}", triggers_table(&triggers));
            }
        }
    }
    Ok(())
}

fn alerts_table(alerts: &[Alert]) -> String {
    let mut table = ui::new_styled_table();
    table.set_header(vec![
        ui::header_cell("ID"),
        ui::header_cell("Symbol"),
        ui::header_cell("Type"),
        ui::header_cell("Target"),
        ui::header_cell("Active"),
        ui::header_cell("Fired"),
        ui::header_cell("Last Price"),
        ui::header_cell("Last Fired"),
    ]);
    for alert in alerts {
        table.add_row(vec![
            Cell::new(alert.id),
            Cell::new(&alert.symbol),
            Cell::new(alert.alert_type),
            ui::number_cell(format!("{}", alert.target_value)),
            ui::flag_cell(!alert.is_active, "paused", "yes"),
            ui::number_cell(alert.trigger_count.to_string()),
            ui::format_optional_cell(alert.last_observed_price, |p| format!("{p:.2}")),
            ui::format_optional_cell(alert.last_triggered_at, |t| {
                t.format("%Y-%m-%d %H:%M").to_string()
            }),
        ]);
    }
    table.to_string()
}

fn decisions_table(decisions: &[TriggerDecision]) -> String {
    let mut table = ui::new_styled_table();
    table.set_header(vec![
        ui::header_cell("Symbol"),
        ui::header_cell("Fired"),
        ui::header_cell("Message"),
    ]);
    for decision in decisions {
        table.add_row(vec![
            Cell::new(&decision.symbol),
            ui::flag_cell(decision.fired, "FIRED", "-"),
            Cell::new(&decision.message),
        ]);
    }
    table.to_string()
}

fn triggers_table(triggers: &[AlertTrigger]) -> String {
    let mut table = ui::new_styled_table();
    table.set_header(vec![
        ui::header_cell("When"),
        ui::header_cell("Price"),
        ui::header_cell("24h"),
        ui::header_cell("Message"),
    ]);
    for trigger in triggers {
        table.add_row(vec![
            Cell::new(trigger.triggered_at.format("%Y-%m-%d %H:%M:%S")),
            ui::number_cell(format!("{:.2}", trigger.observed_price)),
            ui::format_optional_cell(trigger.change_24h_percent, |c| format!("{c:+.2}%")),
            Cell::new(&trigger.message),
        ]);
    }
    table.to_string()
}
