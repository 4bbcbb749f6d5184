use super::ui;
use crate::service::CreditfolioService;
use anyhow::Result;
use uuid::Uuid;

/// Checks entitlement for one feature invocation and charges it.
pub async fn run(
    service: &CreditfolioService,
    account: &str,
    feature: &str,
    extra: bool,
    reference: Option<&str>,
) -> Result<()> {
    let reference = reference
        .map(str::to_string)
        .unwrap_or_else(|| format!("{feature}:{}", Uuid::new_v4()));

    match service
        .check_and_debit(account, feature, extra, &reference)
        .await
    {
        Ok(outcome) => {
            let verdict = if outcome.replayed {
                "Already charged"
            } else {
                "Allowed"
            };
            println!(
                "{} {} for {}: cost {}, balance {}",
                ui::style_text(verdict, ui::StyleType::TotalValue),
                feature,
                account,
                outcome.cost,
                outcome.new_balance
            );
            println!(
                "{}",
                ui::style_text(&format!("reference {reference}"), ui::StyleType::Subtle)
            );
            Ok(())
        }
        Err(e) => {
            println!(
                "{} {} for {}: {} (status {})",
                ui::style_text("Denied", ui::StyleType::Error),
                feature,
                account,
                e,
                e.status_code()
            );
            Err(e.into())
        }
    }
}
