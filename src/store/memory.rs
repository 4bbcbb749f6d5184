use super::{
    AccountStore, AlertStore, CreditOutcome, PriceMemoStore, ReserveOutcome, StoreError,
    commit_transaction, credit_transaction, is_stale, new_account, plan_reserve,
};
use crate::core::alert::{Alert, AlertTrigger};
use crate::core::ledger::{Account, AccountSeed, CreditTransaction, Hold};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
struct State {
    accounts: HashMap<String, Account>,
    transactions: HashMap<String, Vec<CreditTransaction>>,
    /// (account, reference) -> index into `transactions[account]`
    references: HashMap<(String, String), usize>,
    holds: HashMap<(String, String), Hold>,
    alerts: HashMap<Uuid, Alert>,
    triggers: HashMap<Uuid, Vec<AlertTrigger>>,
    prices: HashMap<String, HashMap<String, f64>>,
}

impl State {
    fn committed(&self, account_id: &str, reference_id: &str) -> Option<&CreditTransaction> {
        let index = self
            .references
            .get(&(account_id.to_string(), reference_id.to_string()))?;
        self.transactions.get(account_id)?.get(*index)
    }

    fn append(&mut self, tx: CreditTransaction) {
        let log = self.transactions.entry(tx.account_id.clone()).or_default();
        self.references
            .insert((tx.account_id.clone(), tx.reference_id.clone()), log.len());
        log.push(tx);
    }
}

/// Store kept entirely in memory. One lock guards all state, so every
/// method is atomic with respect to every other.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn open_account(
        &self,
        seed: &AccountSeed,
        now: DateTime<Utc>,
    ) -> Result<Account, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(account) = state.accounts.get_mut(&seed.id) {
            account.tier = seed.tier;
            account.monthly_allowance = seed.monthly_allowance;
            return Ok(account.clone());
        }
        let (account, opening) = new_account(seed, now);
        if let Some(tx) = opening {
            state.append(tx);
        }
        state.accounts.insert(account.id.clone(), account.clone());
        debug!(account = %account.id, "Opened account in memory");
        Ok(account)
    }

    async fn get_account(&self, account_id: &str) -> Result<Option<Account>, StoreError> {
        Ok(self.state.lock().await.accounts.get(account_id).cloned())
    }

    async fn reserve(
        &self,
        hold: &Hold,
        stale_before: DateTime<Utc>,
    ) -> Result<ReserveOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let key = (hold.account_id.clone(), hold.reference_id.clone());
        let committed = state
            .committed(&hold.account_id, &hold.reference_id)
            .cloned();
        let existing = state.holds.get(&key).cloned();
        let Some(account) = state.accounts.get_mut(&hold.account_id) else {
            return Ok(ReserveOutcome::AccountMissing);
        };
        let plan = plan_reserve(
            account,
            committed.as_ref(),
            existing.as_ref(),
            hold,
            stale_before,
        );
        if matches!(plan.outcome, ReserveOutcome::Reserved { .. }) {
            state.holds.insert(key, hold.clone());
        } else if plan.drop_stale_hold {
            state.holds.remove(&key);
        }
        Ok(plan.outcome)
    }

    async fn commit_hold(
        &self,
        account_id: &str,
        reference_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CreditTransaction>, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(tx) = state.committed(account_id, reference_id) {
            return Ok(Some(tx.clone()));
        }
        let key = (account_id.to_string(), reference_id.to_string());
        let Some(hold) = state.holds.remove(&key) else {
            return Ok(None);
        };
        let Some(account) = state.accounts.get_mut(account_id) else {
            return Err(StoreError::Corrupt(format!("hold without account {account_id}")));
        };
        let tx = commit_transaction(account, &hold, now);
        state.append(tx.clone());
        Ok(Some(tx))
    }

    async fn release_hold(
        &self,
        account_id: &str,
        reference_id: &str,
    ) -> Result<Option<u64>, StoreError> {
        let mut state = self.state.lock().await;
        let key = (account_id.to_string(), reference_id.to_string());
        let Some(hold) = state.holds.remove(&key) else {
            return Ok(None);
        };
        let Some(account) = state.accounts.get_mut(account_id) else {
            return Err(StoreError::Corrupt(format!("hold without account {account_id}")));
        };
        account.credit_balance += hold.amount;
        Ok(Some(account.credit_balance))
    }

    async fn release_stale_holds(
        &self,
        account_id: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Hold>, StoreError> {
        let mut state = self.state.lock().await;
        let stale: Vec<(String, String)> = state
            .holds
            .iter()
            .filter(|(_, h)| h.account_id == account_id && is_stale(h, stale_before))
            .map(|(key, _)| key.clone())
            .collect();
        let released: Vec<Hold> = stale
            .iter()
            .filter_map(|key| state.holds.remove(key))
            .collect();
        if released.is_empty() {
            return Ok(released);
        }
        let Some(account) = state.accounts.get_mut(account_id) else {
            return Err(StoreError::Corrupt(format!("hold without account {account_id}")));
        };
        account.credit_balance += released.iter().map(|h| h.amount).sum::<u64>();
        Ok(released)
    }

    async fn apply_credit(
        &self,
        account_id: &str,
        amount: u64,
        reason: &str,
        reference_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CreditOutcome, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(tx) = state.committed(account_id, reference_id) {
            return Ok(CreditOutcome::AlreadyApplied(tx.clone()));
        }
        let Some(account) = state.accounts.get_mut(account_id) else {
            return Ok(CreditOutcome::AccountMissing);
        };
        let Some(tx) = credit_transaction(account, amount, reason, reference_id, now) else {
            return Ok(CreditOutcome::BalanceLimit {
                balance: account.credit_balance,
            });
        };
        state.append(tx.clone());
        Ok(CreditOutcome::Applied(tx))
    }

    async fn transactions(&self, account_id: &str) -> Result<Vec<CreditTransaction>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .transactions
            .get(account_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn holds(&self, account_id: &str) -> Result<Vec<Hold>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .holds
            .values()
            .filter(|h| h.account_id == account_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn insert_alert(&self, alert: &Alert, limit: Option<usize>) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let existing = state
            .alerts
            .values()
            .filter(|a| a.account_id == alert.account_id)
            .count();
        if limit.is_some_and(|max| existing >= max) {
            return Ok(false);
        }
        state.alerts.insert(alert.id, alert.clone());
        Ok(true)
    }

    async fn get_alert(&self, id: &Uuid) -> Result<Option<Alert>, StoreError> {
        Ok(self.state.lock().await.alerts.get(id).cloned())
    }

    async fn alerts_for(&self, account_id: &str) -> Result<Vec<Alert>, StoreError> {
        let state = self.state.lock().await;
        let mut alerts: Vec<Alert> = state
            .alerts
            .values()
            .filter(|a| a.account_id == account_id)
            .cloned()
            .collect();
        alerts.sort_by_key(|a| (a.created_at, a.id));
        Ok(alerts)
    }

    async fn update_alert(
        &self,
        alert: &Alert,
        trigger: Option<&AlertTrigger>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(stored) = state.alerts.get_mut(&alert.id) else {
            return Ok(false);
        };
        if stored.revision != alert.revision {
            return Ok(false);
        }
        *stored = Alert {
            revision: alert.revision + 1,
            ..alert.clone()
        };
        if let Some(trigger) = trigger {
            state
                .triggers
                .entry(alert.id)
                .or_default()
                .push(trigger.clone());
        }
        Ok(true)
    }

    async fn delete_alert(&self, id: &Uuid) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        state.triggers.remove(id);
        Ok(state.alerts.remove(id).is_some())
    }

    async fn triggers_for(&self, alert_id: &Uuid) -> Result<Vec<AlertTrigger>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .triggers
            .get(alert_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl PriceMemoStore for MemoryStore {
    async fn remember_prices(
        &self,
        portfolio_id: &str,
        prices: &[(String, f64)],
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let memo = state.prices.entry(portfolio_id.to_string()).or_default();
        for (symbol, price) in prices {
            memo.insert(symbol.clone(), *price);
        }
        Ok(())
    }

    async fn remembered_prices(
        &self,
        portfolio_id: &str,
    ) -> Result<HashMap<String, f64>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .prices
            .get(portfolio_id)
            .cloned()
            .unwrap_or_default())
    }
}
