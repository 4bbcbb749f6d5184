use super::ui;
use crate::core::valuation::{PortfolioMetrics, PriceSource};
use crate::service::CreditfolioService;
use anyhow::{Context, Result};
use comfy_table::Cell;

impl PortfolioMetrics {
    pub fn display_as_table(&self, title: &str) -> String {
        let mut table = ui::new_styled_table();
        table.set_header(vec![
            ui::header_cell("Symbol"),
            ui::header_cell("Amount"),
            ui::header_cell("Price"),
            ui::header_cell("Source"),
            ui::header_cell("Value"),
            ui::header_cell("P&L"),
            ui::header_cell("P&L (%)"),
            ui::header_cell("24h"),
            ui::header_cell("Weight (%)"),
        ]);

        for holding in self.ranked() {
            let source = match holding.price_source {
                PriceSource::Live if !holding.stale => Cell::new("live"),
                other => ui::flag_cell(true, &format!("{other} (stale)"), ""),
            };
            table.add_row(vec![
                Cell::new(&holding.symbol),
                ui::number_cell(format!("{:.4}", holding.amount)),
                ui::number_cell(format!("{:.2}", holding.current_price)),
                source,
                ui::number_cell(format!("{:.2}", holding.current_value)),
                ui::signed_cell(holding.pnl, format!("{:+.2}", holding.pnl)),
                ui::change_cell(holding.pnl_percentage),
                ui::format_optional_cell(holding.change_24h_percent, |c| format!("{c:+.2}%")),
                ui::number_cell(format!("{:.2}%", holding.allocation_percentage)),
            ]);
        }

        let mut output = format!("Portfolio: {}\n\n", ui::style_text(title, ui::StyleType::Title));
        output.push_str(&table.to_string());

        output.push_str(&format!(
            "\n\n{} {}   {} {:.2}",
            ui::style_text("Total Value:", ui::StyleType::TotalLabel),
            ui::style_text(&format!("{:.2}", self.total_value), ui::StyleType::TotalValue),
            ui::style_text("Invested:", ui::StyleType::TotalLabel),
            self.total_invested,
        ));
        let pnl_style = if self.total_pnl >= 0.0 {
            ui::StyleType::TotalValue
        } else {
            ui::StyleType::Error
        };
        output.push_str(&format!(
            "\n{} {}   {} {:+.2}",
            ui::style_text("P&L:", ui::StyleType::TotalLabel),
            ui::style_text(
                &format!("{:+.2} ({:+.2}%)", self.total_pnl, self.total_pnl_percentage),
                pnl_style
            ),
            ui::style_text("24h:", ui::StyleType::TotalLabel),
            self.day_change_value,
        ));
        if let (Some(best), Some(worst)) = (&self.best_performer, &self.worst_performer) {
            output.push_str(&format!(
                "\n{} {}   {} {}",
                ui::style_text("Best:", ui::StyleType::TotalLabel),
                best,
                ui::style_text("Worst:", ui::StyleType::TotalLabel),
                worst
            ));
        }
        if self.degraded_holdings > 0 {
            output.push_str(&format!(
                "\n{}",
                ui::style_text(
                    &format!(
                        "{} holding(s) priced from stored or purchase prices",
                        self.degraded_holdings
                    ),
                    ui::StyleType::Warning
                )
            ));
        }
        output
    }
}

/// Values the given portfolios, or every configured one when `ids` is empty.
pub async fn run(service: &CreditfolioService, ids: &[String]) -> Result<()> {
    let mut targets: Vec<(String, String, usize)> = service
        .portfolios()
        .filter(|p| ids.is_empty() || ids.contains(&p.id))
        .map(|p| (p.id.clone(), p.display_name().to_string(), p.holdings.len()))
        .collect();
    targets.sort();
    if let Some(missing) = ids.iter().find(|id| !targets.iter().any(|(t, _, _)| t == *id)) {
        anyhow::bail!("Unknown portfolio: {missing}");
    }

    let count = targets.len();
    for (i, (id, name, holdings)) in targets.into_iter().enumerate() {
        let pb = ui::new_progress_bar(holdings as u64, true);
        pb.set_message(format!("Fetching prices for {name}..."));
        let pb_clone = pb.clone();
        let result = service
            .get_portfolio_metrics_with_progress(&id, &move || pb_clone.inc(1))
            .await;
        pb.finish_and_clear();

        let billed = result.with_context(|| format!("Could not value portfolio {id}"))?;
        println!("{}", billed.value.display_as_table(&name));
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
        if i + 1 < count {
            ui::print_separator();
        }
    }
    Ok(())
}
