//! The request-facing surface: entitlement check, credit reservation, price
//! fan-out and the valuation/alert engines wired in that order.

use crate::core::alert::{
    self, Alert, AlertTrigger, LogDispatcher, NewAlert, NotificationDispatcher, TriggerDecision,
};
use crate::core::clock::Clock;
use crate::core::config::Portfolio;
use crate::core::entitlement::{ALERT_SWEEP_FEATURE, FeatureTable, PORTFOLIO_METRICS_FEATURE};
use crate::core::error::CoreError;
use crate::core::ledger::{Account, AccountSeed, CreditLedger, DebitReceipt, Reservation};
use crate::core::price::{FetchOptions, SnapshotProvider, SnapshotResult, fetch_snapshots};
use crate::core::valuation::{Freshness, Holding, PortfolioMetrics, compute_portfolio_metrics};
use crate::store::{AccountStore, AlertStore, PriceMemoStore, StoreHandles};
use chrono::Duration as ChronoDuration;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Attempts at a compare-and-swap alert update before giving up.
const ALERT_UPDATE_ATTEMPTS: usize = 5;

/// Result of an allowed feature invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub allowed: bool,
    pub cost: u64,
    pub new_balance: u64,
    /// The reference had been charged before; nothing new was debited.
    pub replayed: bool,
}

impl CheckOutcome {
    fn free(balance: u64) -> Self {
        Self {
            allowed: true,
            cost: 0,
            new_balance: balance,
            replayed: false,
        }
    }

    fn from_receipt(receipt: &DebitReceipt) -> Self {
        Self {
            allowed: true,
            cost: receipt.amount,
            new_balance: receipt.new_balance,
            replayed: receipt.replayed,
        }
    }
}

/// A computed value together with what it cost.
#[derive(Debug, Clone, PartialEq)]
pub struct Billed<T> {
    pub value: T,
    pub charge: CheckOutcome,
}

/// Reserved credits that go back to the account unless committed. If the
/// invocation is dropped mid-flight the release runs on the current runtime.
struct PendingCharge {
    ledger: Arc<CreditLedger>,
    reservation: Reservation,
    armed: bool,
}

impl PendingCharge {
    /// On failure the guard stays armed, so the hold is released on drop.
    async fn commit(mut self) -> Result<DebitReceipt, CoreError> {
        let receipt = self.ledger.commit(self.reservation.clone()).await?;
        self.armed = false;
        Ok(receipt)
    }

    async fn release(mut self) {
        self.armed = false;
        if let Err(e) = self.ledger.release(self.reservation.clone()).await {
            warn!(reference = self.reservation.reference_id(), error = %e, "Failed to release reservation");
        }
    }
}

impl Drop for PendingCharge {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let reservation = self.reservation.clone();
        let ledger = Arc::clone(&self.ledger);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(reference = reservation.reference_id(), "Invocation dropped, releasing credits");
                handle.spawn(async move {
                    if let Err(e) = ledger.release(reservation).await {
                        warn!(error = %e, "Failed to release dropped reservation");
                    }
                });
            }
            Err(_) => warn!(
                reference = reservation.reference_id(),
                "Reservation left on hold, no runtime to release it"
            ),
        }
    }
}

pub struct CreditfolioService {
    features: FeatureTable,
    accounts: Arc<dyn AccountStore>,
    ledger: Arc<CreditLedger>,
    alerts: Arc<dyn AlertStore>,
    prices: Arc<dyn PriceMemoStore>,
    provider: Arc<dyn SnapshotProvider>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    clock: Arc<dyn Clock>,
    portfolios: HashMap<String, Portfolio>,
    fetch: FetchOptions,
    staleness: ChronoDuration,
}

impl CreditfolioService {
    pub fn new(
        stores: StoreHandles,
        provider: Arc<dyn SnapshotProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            features: FeatureTable::builtin(),
            ledger: Arc::new(CreditLedger::new(
                Arc::clone(&stores.accounts),
                Arc::clone(&clock),
            )),
            accounts: stores.accounts,
            alerts: stores.alerts,
            prices: stores.prices,
            provider,
            dispatcher: Arc::new(LogDispatcher),
            clock,
            portfolios: HashMap::new(),
            fetch: FetchOptions::default(),
            staleness: ChronoDuration::minutes(15),
        }
    }

    pub fn with_features(mut self, features: FeatureTable) -> Self {
        self.features = features;
        self
    }

    pub fn with_hold_lease(mut self, lease: ChronoDuration) -> Self {
        self.ledger = Arc::new(
            CreditLedger::new(Arc::clone(&self.accounts), Arc::clone(&self.clock))
                .with_hold_lease(lease),
        );
        self
    }

    pub fn with_portfolios(mut self, portfolios: Vec<Portfolio>) -> Self {
        self.portfolios = portfolios.into_iter().map(|p| (p.id.clone(), p)).collect();
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn NotificationDispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_fetch(mut self, fetch: FetchOptions, staleness: ChronoDuration) -> Self {
        self.fetch = fetch;
        self.staleness = staleness;
        self
    }

    pub fn ledger(&self) -> &CreditLedger {
        &self.ledger
    }

    pub fn features(&self) -> &FeatureTable {
        &self.features
    }

    pub fn portfolios(&self) -> impl Iterator<Item = &Portfolio> {
        self.portfolios.values()
    }

    /// Creates missing accounts and syncs tier/allowance of existing ones.
    /// Holds left behind by an earlier process past their lease are released.
    pub async fn open_accounts(&self, seeds: &[AccountSeed]) -> Result<Vec<Account>, CoreError> {
        let mut accounts = Vec::with_capacity(seeds.len());
        for seed in seeds {
            self.ledger.open_account(seed).await?;
            let reclaimed = self.ledger.reclaim_stale_holds(&seed.id).await?;
            if !reclaimed.is_empty() {
                info!(account = %seed.id, holds = reclaimed.len(), "Released abandoned holds");
            }
            accounts.push(self.ledger.account(&seed.id).await?);
        }
        Ok(accounts)
    }

    /// Decides the cost for the account's tier. Denials never touch the ledger.
    async fn price_for(
        &self,
        account_id: &str,
        feature_id: &str,
        is_extra: bool,
    ) -> Result<(Account, u64), CoreError> {
        let account = self.ledger.account(account_id).await?;
        let cost = self
            .features
            .resolve(account.tier, feature_id, is_extra)
            .into_result()
            .inspect_err(|denial| {
                debug!(account = %account_id, feature = %feature_id, reason = %denial, "Feature denied")
            })?;
        Ok((account, cost))
    }

    /// Checks entitlement and charges the feature in one step.
    pub async fn check_and_debit(
        &self,
        account_id: &str,
        feature_id: &str,
        is_extra: bool,
        reference_id: &str,
    ) -> Result<CheckOutcome, CoreError> {
        let (account, cost) = self.price_for(account_id, feature_id, is_extra).await?;
        if cost == 0 {
            return Ok(CheckOutcome::free(account.credit_balance));
        }
        let receipt = self
            .ledger
            .debit(account_id, cost, feature_id, reference_id)
            .await?;
        Ok(CheckOutcome::from_receipt(&receipt))
    }

    /// Runs `work` under a credit reservation: the charge is committed only if
    /// `work` succeeds and released otherwise.
    pub async fn invoke_feature<T, F, Fut>(
        &self,
        account_id: &str,
        feature_id: &str,
        is_extra: bool,
        reference_id: &str,
        work: F,
    ) -> Result<Billed<T>, CoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let (account, cost) = self.price_for(account_id, feature_id, is_extra).await?;
        if cost == 0 {
            let value = work().await?;
            return Ok(Billed {
                value,
                charge: CheckOutcome::free(account.credit_balance),
            });
        }

        let reservation = self
            .ledger
            .reserve(account_id, cost, feature_id, reference_id)
            .await?;
        let pending = PendingCharge {
            ledger: Arc::clone(&self.ledger),
            reservation,
            armed: true,
        };

        match work().await {
            Ok(value) => {
                let receipt = pending.commit().await?;
                Ok(Billed {
                    value,
                    charge: CheckOutcome::from_receipt(&receipt),
                })
            }
            Err(e) => {
                info!(account = %account_id, feature = %feature_id, error = %e, "Feature failed, releasing credits");
                pending.release().await;
                Err(e)
            }
        }
    }

    pub async fn get_portfolio_metrics(
        &self,
        portfolio_id: &str,
    ) -> Result<Billed<PortfolioMetrics>, CoreError> {
        self.get_portfolio_metrics_with_progress(portfolio_id, &|| {})
            .await
    }

    pub async fn get_portfolio_metrics_with_progress(
        &self,
        portfolio_id: &str,
        on_progress: &(dyn Fn() + Send + Sync),
    ) -> Result<Billed<PortfolioMetrics>, CoreError> {
        let portfolio = self
            .portfolios
            .get(portfolio_id)
            .ok_or_else(|| CoreError::PortfolioNotFound(portfolio_id.to_string()))?;
        let reference = format!("{}:{}:{}", PORTFOLIO_METRICS_FEATURE, portfolio.id, Uuid::new_v4());

        self.invoke_feature(
            &portfolio.account,
            PORTFOLIO_METRICS_FEATURE,
            false,
            &reference,
            || self.value_portfolio(portfolio, on_progress),
        )
        .await
    }

    async fn value_portfolio(
        &self,
        portfolio: &Portfolio,
        on_progress: &(dyn Fn() + Send + Sync),
    ) -> Result<PortfolioMetrics, CoreError> {
        let symbols: Vec<String> = portfolio.holdings.iter().map(|h| h.symbol.clone()).collect();
        let snapshots = fetch_snapshots(self.provider.as_ref(), &symbols, self.fetch, on_progress).await;

        let remembered = self.prices.remembered_prices(&portfolio.id).await?;
        let holdings: Vec<Holding> = portfolio
            .holdings
            .iter()
            .map(|h| Holding {
                current_price: remembered.get(&h.symbol).copied().or(h.current_price),
                ..h.clone()
            })
            .collect();

        let metrics = compute_portfolio_metrics(
            &holdings,
            &snapshots,
            Freshness::new(self.clock.now(), self.staleness),
        );
        if metrics.degraded_holdings > 0 {
            warn!(
                portfolio = %portfolio.id,
                degraded = metrics.degraded_holdings,
                "Some holdings were valued with fallback prices"
            );
        }

        let live = metrics.live_prices();
        if !live.is_empty() {
            if let Err(e) = self.prices.remember_prices(&portfolio.id, &live).await {
                warn!(portfolio = %portfolio.id, error = %e, "Could not store refreshed prices");
            }
        }
        Ok(metrics)
    }

    pub async fn create_alert(&self, new_alert: NewAlert) -> Result<Alert, CoreError> {
        let account = self.ledger.account(&new_alert.account_id).await?;
        let alert = new_alert.into_alert(self.clock.now())?;
        let limit = account.tier.max_alerts();
        if !self.alerts.insert_alert(&alert, limit).await? {
            return Err(CoreError::AlertLimitReached {
                tier: account.tier,
                limit: limit.unwrap_or(usize::MAX),
            });
        }
        info!(account = %alert.account_id, alert = %alert.id, symbol = %alert.symbol, "Alert created");
        Ok(alert)
    }

    pub async fn list_alerts(&self, account_id: &str) -> Result<Vec<Alert>, CoreError> {
        Ok(self.alerts.alerts_for(account_id).await?)
    }

    pub async fn set_alert_active(&self, id: &Uuid, active: bool) -> Result<Alert, CoreError> {
        for _ in 0..ALERT_UPDATE_ATTEMPTS {
            let mut alert = self
                .alerts
                .get_alert(id)
                .await?
                .ok_or(CoreError::AlertNotFound(*id))?;
            if alert.is_active == active {
                return Ok(alert);
            }
            alert.is_active = active;
            if self.alerts.update_alert(&alert, None).await? {
                alert.revision += 1;
                return Ok(alert);
            }
        }
        Err(CoreError::AlertContention(*id))
    }

    pub async fn delete_alert(&self, id: &Uuid) -> Result<(), CoreError> {
        if self.alerts.delete_alert(id).await? {
            Ok(())
        } else {
            Err(CoreError::AlertNotFound(*id))
        }
    }

    pub async fn alert_triggers(&self, id: &Uuid) -> Result<Vec<AlertTrigger>, CoreError> {
        Ok(self.alerts.triggers_for(id).await?)
    }

    pub async fn evaluate_alerts(
        &self,
        account_id: &str,
    ) -> Result<Billed<Vec<TriggerDecision>>, CoreError> {
        self.evaluate_alerts_with_progress(account_id, &|| {}).await
    }

    /// Evaluates every active alert of the account against fresh prices.
    /// An account with nothing active is not charged.
    pub async fn evaluate_alerts_with_progress(
        &self,
        account_id: &str,
        on_progress: &(dyn Fn() + Send + Sync),
    ) -> Result<Billed<Vec<TriggerDecision>>, CoreError> {
        let active: Vec<Alert> = self
            .alerts
            .alerts_for(account_id)
            .await?
            .into_iter()
            .filter(|a| a.is_active)
            .collect();
        if active.is_empty() {
            let account = self.ledger.account(account_id).await?;
            return Ok(Billed {
                value: Vec::new(),
                charge: CheckOutcome::free(account.credit_balance),
            });
        }

        let reference = format!("{}:{}:{}", ALERT_SWEEP_FEATURE, account_id, Uuid::new_v4());
        self.invoke_feature(account_id, ALERT_SWEEP_FEATURE, false, &reference, || {
            self.sweep(active, on_progress)
        })
        .await
    }

    async fn sweep(
        &self,
        active: Vec<Alert>,
        on_progress: &(dyn Fn() + Send + Sync),
    ) -> Result<Vec<TriggerDecision>, CoreError> {
        let symbols: Vec<String> = active.iter().map(|a| a.symbol.clone()).collect();
        let snapshots = fetch_snapshots(self.provider.as_ref(), &symbols, self.fetch, on_progress).await;

        let results: Vec<Result<TriggerDecision, CoreError>> = stream::iter(active)
            .map(|alert| {
                let snapshot = snapshots.get(&alert.symbol);
                async move { self.settle_alert(alert, snapshot).await }
            })
            .buffered(self.fetch.concurrency.max(1))
            .collect()
            .await;
        results.into_iter().collect()
    }

    /// Evaluates one alert and stores its next state. A lost race re-reads
    /// the alert and evaluates again.
    async fn settle_alert(
        &self,
        mut alert: Alert,
        snapshot: Option<&SnapshotResult>,
    ) -> Result<TriggerDecision, CoreError> {
        let snapshot = match snapshot {
            Some(Ok(s)) if s.is_usable() => s,
            other => {
                let reason = match other {
                    Some(Err(e)) => e.to_string(),
                    _ => "no usable price".to_string(),
                };
                return Ok(TriggerDecision {
                    alert_id: alert.id,
                    symbol: alert.symbol.clone(),
                    fired: false,
                    message: format!("{}: {}", alert.symbol, reason),
                });
            }
        };

        for _ in 0..ALERT_UPDATE_ATTEMPTS {
            let evaluation = alert::evaluate(&alert, snapshot, self.clock.now());
            let Some(next) = evaluation.next else {
                return Ok(evaluation.decision);
            };
            if self
                .alerts
                .update_alert(&next, evaluation.trigger.as_ref())
                .await?
            {
                if let Some(trigger) = &evaluation.trigger {
                    self.dispatcher.dispatch(trigger).await;
                }
                return Ok(evaluation.decision);
            }
            debug!(alert = %alert.id, "Alert changed during evaluation, retrying");
            match self.alerts.get_alert(&alert.id).await? {
                Some(fresh) => alert = fresh,
                None => {
                    return Ok(TriggerDecision {
                        alert_id: alert.id,
                        symbol: alert.symbol.clone(),
                        fired: false,
                        message: format!("{} alert was removed", alert.symbol),
                    });
                }
            }
        }
        Err(CoreError::AlertContention(alert.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::alert::AlertType;
    use crate::core::clock::ManualClock;
    use crate::core::entitlement::{Denial, Tier};
    use crate::core::ledger::{CreditTransaction, Hold, LedgerError};
    use crate::core::price::{PriceSnapshot, SnapshotError};
    use crate::store::memory::MemoryStore;
    use crate::store::{CreditOutcome, ReserveOutcome, StoreError};
    use async_trait::async_trait;
    use chrono::{NaiveDate, Utc};
    use std::sync::Mutex;

    /// Prices come from a mutable map; missing symbols are not found.
    #[derive(Default)]
    struct MapProvider {
        prices: Mutex<HashMap<String, (f64, Option<f64>)>>,
    }

    impl MapProvider {
        fn set(&self, symbol: &str, price: f64, change: Option<f64>) {
            self.prices
                .lock()
                .unwrap()
                .insert(symbol.to_string(), (price, change));
        }
    }

    #[async_trait]
    impl SnapshotProvider for MapProvider {
        async fn get_snapshot(&self, symbol: &str) -> SnapshotResult {
            let entry = self.prices.lock().unwrap().get(symbol).copied();
            match entry {
                Some((price, change)) => Ok(PriceSnapshot::new(price, change, Utc::now())),
                None => Err(SnapshotError::NotFound(symbol.to_string())),
            }
        }

        fn name(&self) -> &str {
            "map"
        }
    }

    #[derive(Default)]
    struct RecordingDispatcher {
        seen: Mutex<Vec<AlertTrigger>>,
    }

    #[async_trait]
    impl NotificationDispatcher for RecordingDispatcher {
        async fn dispatch(&self, trigger: &AlertTrigger) {
            self.seen.lock().unwrap().push(trigger.clone());
        }
    }

    struct Fixture {
        service: CreditfolioService,
        provider: Arc<MapProvider>,
        dispatcher: Arc<RecordingDispatcher>,
        clock: Arc<ManualClock>,
    }

    async fn fixture(tier: Tier, balance: u64) -> Fixture {
        let provider = Arc::new(MapProvider::default());
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let portfolio = Portfolio {
            id: "main".to_string(),
            account: "alice".to_string(),
            name: None,
            holdings: vec![
                Holding {
                    symbol: "AAPL".to_string(),
                    amount: 2.0,
                    purchase_price: 100.0,
                    purchase_date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
                    current_price: None,
                },
                Holding {
                    symbol: "BTC".to_string(),
                    amount: 1.0,
                    purchase_price: 40000.0,
                    purchase_date: NaiveDate::from_ymd_opt(2023, 6, 1).unwrap(),
                    current_price: None,
                },
            ],
        };
        let service = CreditfolioService::new(
            StoreHandles::new(Arc::new(MemoryStore::new())),
            provider.clone(),
            clock.clone(),
        )
        .with_portfolios(vec![portfolio])
        .with_dispatcher(dispatcher.clone());
        service
            .open_accounts(&[AccountSeed {
                id: "alice".to_string(),
                tier,
                monthly_allowance: 0,
                opening_balance: balance,
            }])
            .await
            .unwrap();
        Fixture {
            service,
            provider,
            dispatcher,
            clock,
        }
    }

    async fn balance(service: &CreditfolioService) -> u64 {
        service.ledger().account("alice").await.unwrap().credit_balance
    }

    #[tokio::test]
    async fn test_tier_too_low_is_denied_without_charge() {
        let f = fixture(Tier::Free, 10).await;
        let err = f
            .service
            .check_and_debit("alice", "ai_insight", false, "req-1")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Denied(Denial::TierTooLow { required: Tier::Pro, .. })
        ));
        assert_eq!(err.to_string(), "requires Pro tier");
        assert_eq!(balance(&f.service).await, 10);
    }

    #[tokio::test]
    async fn test_check_and_debit_charges_once_per_reference() {
        let f = fixture(Tier::Pro, 10).await;
        let first = f
            .service
            .check_and_debit("alice", "ai_insight", false, "req-1")
            .await
            .unwrap();
        assert_eq!(first.cost, 4);
        assert_eq!(first.new_balance, 6);

        let again = f
            .service
            .check_and_debit("alice", "ai_insight", false, "req-1")
            .await
            .unwrap();
        assert!(again.replayed);
        assert_eq!(again.new_balance, 6);
        assert_eq!(balance(&f.service).await, 6);
    }

    #[tokio::test]
    async fn test_included_feature_is_free_but_extra_is_charged() {
        let f = fixture(Tier::Pro, 10).await;
        let included = f
            .service
            .check_and_debit("alice", "weekly_report", false, "r1")
            .await
            .unwrap();
        assert_eq!(included.cost, 0);
        let extra = f
            .service
            .check_and_debit("alice", "weekly_report", true, "r2")
            .await
            .unwrap();
        assert_eq!(extra.cost, 5);
        assert_eq!(balance(&f.service).await, 5);
    }

    #[tokio::test]
    async fn test_unknown_feature_and_account() {
        let f = fixture(Tier::Pro, 10).await;
        let err = f
            .service
            .check_and_debit("alice", "teleport", false, "r1")
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
        let err = f
            .service
            .check_and_debit("nobody", "ai_insight", false, "r1")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Ledger(LedgerError::AccountNotFound(_))));
    }

    #[tokio::test]
    async fn test_failed_work_releases_credits() {
        let f = fixture(Tier::Pro, 10).await;
        let result: Result<Billed<()>, CoreError> = f
            .service
            .invoke_feature("alice", "risk_analysis", false, "r1", || async {
                Err(CoreError::PortfolioNotFound("gone".to_string()))
            })
            .await;
        assert!(matches!(result, Err(CoreError::PortfolioNotFound(_))));
        assert_eq!(balance(&f.service).await, 10);
        assert!(f.service.ledger().audit("alice").await.unwrap().is_consistent());

        let billed = f
            .service
            .invoke_feature("alice", "risk_analysis", false, "r2", || async { Ok(42) })
            .await
            .unwrap();
        assert_eq!(billed.value, 42);
        assert_eq!(billed.charge.new_balance, 2);
    }

    /// Accounts that can reserve but never commit.
    struct CommitFailsStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl AccountStore for CommitFailsStore {
        async fn open_account(
            &self,
            seed: &AccountSeed,
            now: chrono::DateTime<Utc>,
        ) -> Result<Account, StoreError> {
            self.inner.open_account(seed, now).await
        }

        async fn get_account(&self, account_id: &str) -> Result<Option<Account>, StoreError> {
            self.inner.get_account(account_id).await
        }

        async fn reserve(
            &self,
            hold: &Hold,
            stale_before: chrono::DateTime<Utc>,
        ) -> Result<ReserveOutcome, StoreError> {
            self.inner.reserve(hold, stale_before).await
        }

        async fn commit_hold(
            &self,
            _account_id: &str,
            _reference_id: &str,
            _now: chrono::DateTime<Utc>,
        ) -> Result<Option<CreditTransaction>, StoreError> {
            Err(StoreError::Corrupt("log unavailable".to_string()))
        }

        async fn release_hold(
            &self,
            account_id: &str,
            reference_id: &str,
        ) -> Result<Option<u64>, StoreError> {
            self.inner.release_hold(account_id, reference_id).await
        }

        async fn release_stale_holds(
            &self,
            account_id: &str,
            stale_before: chrono::DateTime<Utc>,
        ) -> Result<Vec<Hold>, StoreError> {
            self.inner.release_stale_holds(account_id, stale_before).await
        }

        async fn apply_credit(
            &self,
            account_id: &str,
            amount: u64,
            reason: &str,
            reference_id: &str,
            now: chrono::DateTime<Utc>,
        ) -> Result<CreditOutcome, StoreError> {
            self.inner
                .apply_credit(account_id, amount, reason, reference_id, now)
                .await
        }

        async fn transactions(
            &self,
            account_id: &str,
        ) -> Result<Vec<CreditTransaction>, StoreError> {
            self.inner.transactions(account_id).await
        }

        async fn holds(&self, account_id: &str) -> Result<Vec<Hold>, StoreError> {
            self.inner.holds(account_id).await
        }
    }

    #[tokio::test]
    async fn test_failed_commit_releases_credits() {
        let other = Arc::new(MemoryStore::new());
        let stores = StoreHandles {
            accounts: Arc::new(CommitFailsStore {
                inner: MemoryStore::new(),
            }),
            alerts: other.clone(),
            prices: other,
        };
        let service = CreditfolioService::new(
            stores,
            Arc::new(MapProvider::default()),
            Arc::new(ManualClock::new(Utc::now())),
        );
        service
            .open_accounts(&[AccountSeed {
                id: "alice".to_string(),
                tier: Tier::Pro,
                monthly_allowance: 0,
                opening_balance: 10,
            }])
            .await
            .unwrap();

        let err = service
            .invoke_feature("alice", "risk_analysis", false, "r1", || async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Ledger(LedgerError::Store(_))));

        // The release runs on a spawned task.
        for _ in 0..100 {
            if balance(&service).await == 10 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(balance(&service).await, 10);
        assert!(service.ledger().audit("alice").await.unwrap().held == 0);
    }

    #[tokio::test]
    async fn test_reopening_accounts_reclaims_abandoned_holds() {
        let f = fixture(Tier::Pro, 10).await;
        let seed = AccountSeed {
            id: "alice".to_string(),
            tier: Tier::Pro,
            monthly_allowance: 0,
            opening_balance: 10,
        };
        f.service
            .ledger()
            .reserve("alice", 4, "ai_insight", "crashed-1")
            .await
            .unwrap();

        // Within the lease the hold is left alone.
        f.clock.advance(ChronoDuration::minutes(1));
        let accounts = f.service.open_accounts(std::slice::from_ref(&seed)).await.unwrap();
        assert_eq!(accounts[0].credit_balance, 6);

        f.clock.advance(ChronoDuration::minutes(10));
        let accounts = f.service.open_accounts(&[seed]).await.unwrap();
        assert_eq!(accounts[0].credit_balance, 10);
        let audit = f.service.ledger().audit("alice").await.unwrap();
        assert_eq!(audit.held, 0);
        assert!(audit.is_consistent());
    }

    #[tokio::test]
    async fn test_insufficient_credits_skips_work() {
        let f = fixture(Tier::Pro, 3).await;
        let ran = std::sync::atomic::AtomicBool::new(false);
        let err = f
            .service
            .invoke_feature("alice", "risk_analysis", false, "r1", || async {
                ran.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "insufficient credits: need 8, have 3");
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_portfolio_metrics_charges_and_remembers_prices() {
        let f = fixture(Tier::Free, 5).await;
        f.provider.set("AAPL", 150.0, Some(1.0));
        f.provider.set("BTC", 50000.0, None);

        let billed = f.service.get_portfolio_metrics("main").await.unwrap();
        assert_eq!(billed.charge.cost, 1);
        assert_eq!(billed.charge.new_balance, 4);
        assert_eq!(billed.value.total_value, 50300.0);
        assert_eq!(billed.value.degraded_holdings, 0);

        // BTC disappears from the provider; its last live price is used.
        f.provider.prices.lock().unwrap().remove("BTC");
        let billed = f.service.get_portfolio_metrics("main").await.unwrap();
        let btc = billed
            .value
            .holdings
            .iter()
            .find(|h| h.symbol == "BTC")
            .unwrap();
        assert_eq!(btc.current_price, 50000.0);
        assert!(btc.stale);
        assert_eq!(billed.value.degraded_holdings, 1);

        let err = f.service.get_portfolio_metrics("other").await.unwrap_err();
        assert!(matches!(err, CoreError::PortfolioNotFound(_)));
    }

    #[tokio::test]
    async fn test_alert_limit_per_tier() {
        let f = fixture(Tier::Free, 0).await;
        let new = |target: f64| NewAlert {
            account_id: "alice".to_string(),
            symbol: "BTC".to_string(),
            alert_type: AlertType::PriceAbove,
            target_value: target,
        };
        for target in [1.0, 2.0, 3.0] {
            f.service.create_alert(new(target)).await.unwrap();
        }
        let err = f.service.create_alert(new(4.0)).await.unwrap_err();
        assert!(matches!(err, CoreError::AlertLimitReached { limit: 3, .. }));

        let err = f.service.create_alert(new(-1.0)).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidAlert(_)));
    }

    #[tokio::test]
    async fn test_alert_sweep_is_edge_triggered() {
        let f = fixture(Tier::Pro, 0).await;
        let alert = f
            .service
            .create_alert(NewAlert {
                account_id: "alice".to_string(),
                symbol: "BTC".to_string(),
                alert_type: AlertType::PriceAbove,
                target_value: 50000.0,
            })
            .await
            .unwrap();

        let mut fired = Vec::new();
        for price in [49000.0, 51000.0, 51500.0, 50000.0, 50500.0] {
            f.provider.set("BTC", price, None);
            let billed = f.service.evaluate_alerts("alice").await.unwrap();
            // Sweeps are included for Pro.
            assert_eq!(billed.charge.cost, 0);
            fired.push(billed.value[0].fired);
        }
        assert_eq!(fired, vec![false, true, false, false, true]);

        let triggers = f.service.alert_triggers(&alert.id).await.unwrap();
        assert_eq!(triggers.len(), 2);
        assert_eq!(triggers[0].message, "BTC crossed above 50000");
        assert_eq!(f.dispatcher.seen.lock().unwrap().len(), 2);

        let stored = &f.service.list_alerts("alice").await.unwrap()[0];
        assert_eq!(stored.trigger_count, 2);
        assert_eq!(stored.last_observed_price, Some(50500.0));
    }

    #[tokio::test]
    async fn test_percentage_alert_suppressed_for_a_day() {
        let f = fixture(Tier::Pro, 0).await;
        f.service
            .create_alert(NewAlert {
                account_id: "alice".to_string(),
                symbol: "ETH".to_string(),
                alert_type: AlertType::PercentageChange,
                target_value: 5.0,
            })
            .await
            .unwrap();
        f.provider.set("ETH", 3000.0, Some(-7.5));

        let first = f.service.evaluate_alerts("alice").await.unwrap();
        assert!(first.value[0].fired);
        f.clock.advance(ChronoDuration::hours(2));
        let second = f.service.evaluate_alerts("alice").await.unwrap();
        assert!(!second.value[0].fired);
        f.clock.advance(ChronoDuration::hours(23));
        let third = f.service.evaluate_alerts("alice").await.unwrap();
        assert!(third.value[0].fired);
    }

    #[tokio::test]
    async fn test_paused_and_unpriced_alerts() {
        let f = fixture(Tier::Free, 5).await;
        let alert = f
            .service
            .create_alert(NewAlert {
                account_id: "alice".to_string(),
                symbol: "DOGE".to_string(),
                alert_type: AlertType::PriceBelow,
                target_value: 0.1,
            })
            .await
            .unwrap();

        // No price for DOGE: nothing fires, state untouched, sweep still billed.
        let billed = f.service.evaluate_alerts("alice").await.unwrap();
        assert!(!billed.value[0].fired);
        assert_eq!(billed.charge.new_balance, 4);

        let paused = f.service.set_alert_active(&alert.id, false).await.unwrap();
        assert!(!paused.is_active);
        let billed = f.service.evaluate_alerts("alice").await.unwrap();
        assert!(billed.value.is_empty());
        assert_eq!(billed.charge.cost, 0);
        assert_eq!(balance(&f.service).await, 4);

        f.service.delete_alert(&alert.id).await.unwrap();
        assert!(matches!(
            f.service.delete_alert(&alert.id).await,
            Err(CoreError::AlertNotFound(_))
        ));
    }
}
