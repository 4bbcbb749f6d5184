//! Persistence for accounts, alerts and last-known holding prices.
//!
//! Each mutating method is a single indivisible operation in the backend: the
//! condition check and the write happen under the same lock/batch. Callers
//! never read-modify-write a balance themselves.

pub mod disk;
pub mod memory;

use crate::core::alert::{Alert, AlertTrigger};
use crate::core::ledger::{Account, AccountSeed, CreditTransaction, Hold, MAX_BALANCE};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(#[from] fjall::Error),
    #[error("failed to encode record: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("storage is corrupt: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReserveOutcome {
    Reserved { new_balance: u64 },
    AlreadyCommitted(CreditTransaction),
    AlreadyHeld,
    Insufficient { available: u64 },
    AccountMissing,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CreditOutcome {
    Applied(CreditTransaction),
    AlreadyApplied(CreditTransaction),
    /// The credit would lift the balance past [`MAX_BALANCE`]; nothing changed.
    BalanceLimit { balance: u64 },
    AccountMissing,
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Creates the account with its opening balance, or syncs tier and
    /// allowance of an existing one without touching its balance.
    async fn open_account(
        &self,
        seed: &AccountSeed,
        now: DateTime<Utc>,
    ) -> Result<Account, StoreError>;

    async fn get_account(&self, account_id: &str) -> Result<Option<Account>, StoreError>;

    /// Lowers the balance by `hold.amount` only if it covers it.
    ///
    /// A hold under the same reference created at or before `stale_before`
    /// is treated as abandoned: its credits go back first and the new hold
    /// takes its place.
    async fn reserve(
        &self,
        hold: &Hold,
        stale_before: DateTime<Utc>,
    ) -> Result<ReserveOutcome, StoreError>;

    /// Moves a hold into the transaction log. Returns the committed
    /// transaction, also when the reference was already committed.
    async fn commit_hold(
        &self,
        account_id: &str,
        reference_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CreditTransaction>, StoreError>;

    /// Drops a hold and gives its credits back. Returns the new balance.
    async fn release_hold(
        &self,
        account_id: &str,
        reference_id: &str,
    ) -> Result<Option<u64>, StoreError>;

    /// Drops every hold of the account created at or before `stale_before`
    /// and returns their credits in one step.
    async fn release_stale_holds(
        &self,
        account_id: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Hold>, StoreError>;

    async fn apply_credit(
        &self,
        account_id: &str,
        amount: u64,
        reason: &str,
        reference_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CreditOutcome, StoreError>;

    async fn transactions(&self, account_id: &str) -> Result<Vec<CreditTransaction>, StoreError>;

    async fn holds(&self, account_id: &str) -> Result<Vec<Hold>, StoreError>;
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Inserts unless the account already has `limit` alerts.
    async fn insert_alert(&self, alert: &Alert, limit: Option<usize>) -> Result<bool, StoreError>;

    async fn get_alert(&self, id: &Uuid) -> Result<Option<Alert>, StoreError>;

    async fn alerts_for(&self, account_id: &str) -> Result<Vec<Alert>, StoreError>;

    /// Replaces the alert if its stored revision is still `alert.revision`,
    /// bumping the revision and appending `trigger` in the same step.
    async fn update_alert(
        &self,
        alert: &Alert,
        trigger: Option<&AlertTrigger>,
    ) -> Result<bool, StoreError>;

    async fn delete_alert(&self, id: &Uuid) -> Result<bool, StoreError>;

    async fn triggers_for(&self, alert_id: &Uuid) -> Result<Vec<AlertTrigger>, StoreError>;
}

/// Last known price per holding, keyed by portfolio and symbol.
#[async_trait]
pub trait PriceMemoStore: Send + Sync {
    async fn remember_prices(
        &self,
        portfolio_id: &str,
        prices: &[(String, f64)],
    ) -> Result<(), StoreError>;

    async fn remembered_prices(&self, portfolio_id: &str)
    -> Result<HashMap<String, f64>, StoreError>;
}

pub trait Store: AccountStore + AlertStore + PriceMemoStore {}

impl<T: AccountStore + AlertStore + PriceMemoStore> Store for T {}

/// Hands out one backend under each of its trait views.
#[derive(Clone)]
pub struct StoreHandles {
    pub accounts: Arc<dyn AccountStore>,
    pub alerts: Arc<dyn AlertStore>,
    pub prices: Arc<dyn PriceMemoStore>,
}

impl StoreHandles {
    pub fn new<S: Store + 'static>(store: Arc<S>) -> Self {
        Self {
            accounts: store.clone(),
            alerts: store.clone(),
            prices: store,
        }
    }
}

// Transitions shared by the backends. Each takes the current records and
// returns what to write; the backend applies them atomically.

pub(crate) fn new_account(seed: &AccountSeed, now: DateTime<Utc>) -> (Account, Option<CreditTransaction>) {
    let opening = (seed.opening_balance > 0).then(|| CreditTransaction {
        account_id: seed.id.clone(),
        seq: 0,
        amount: balance_delta(seed.opening_balance),
        reason: "opening_balance".to_string(),
        reference_id: format!("opening:{}", seed.id),
        balance_after: seed.opening_balance,
        created_at: now,
    });
    let account = Account {
        id: seed.id.clone(),
        tier: seed.tier,
        credit_balance: seed.opening_balance,
        monthly_allowance: seed.monthly_allowance,
        transaction_count: opening.is_some() as u64,
        created_at: now,
    };
    (account, opening)
}

/// What a reserve decided. When `drop_stale_hold` is set the account already
/// has the stale hold's credits back and the backend must delete that hold
/// unless the new one overwrites it.
pub(crate) struct ReservePlan {
    pub outcome: ReserveOutcome,
    pub drop_stale_hold: bool,
}

pub(crate) fn plan_reserve(
    account: &mut Account,
    committed: Option<&CreditTransaction>,
    existing: Option<&Hold>,
    hold: &Hold,
    stale_before: DateTime<Utc>,
) -> ReservePlan {
    let plan = |outcome, drop_stale_hold| ReservePlan {
        outcome,
        drop_stale_hold,
    };
    if let Some(tx) = committed {
        return plan(ReserveOutcome::AlreadyCommitted(tx.clone()), false);
    }
    let drop_stale_hold = match existing {
        Some(previous) if previous.created_at > stale_before => {
            return plan(ReserveOutcome::AlreadyHeld, false);
        }
        Some(previous) => {
            account.credit_balance += previous.amount;
            true
        }
        None => false,
    };
    if account.credit_balance < hold.amount {
        return plan(
            ReserveOutcome::Insufficient {
                available: account.credit_balance,
            },
            drop_stale_hold,
        );
    }
    account.credit_balance -= hold.amount;
    plan(
        ReserveOutcome::Reserved {
            new_balance: account.credit_balance,
        },
        drop_stale_hold,
    )
}

pub(crate) fn is_stale(hold: &Hold, stale_before: DateTime<Utc>) -> bool {
    hold.created_at <= stale_before
}

pub(crate) fn commit_transaction(account: &mut Account, hold: &Hold, now: DateTime<Utc>) -> CreditTransaction {
    let tx = CreditTransaction {
        account_id: account.id.clone(),
        seq: account.transaction_count,
        amount: -balance_delta(hold.amount),
        reason: hold.reason.clone(),
        reference_id: hold.reference_id.clone(),
        balance_after: account.credit_balance,
        created_at: now,
    };
    account.transaction_count += 1;
    tx
}

/// Applies a credit, or returns `None` without touching the account when the
/// result would exceed [`MAX_BALANCE`].
pub(crate) fn credit_transaction(
    account: &mut Account,
    amount: u64,
    reason: &str,
    reference_id: &str,
    now: DateTime<Utc>,
) -> Option<CreditTransaction> {
    let balance = account
        .credit_balance
        .checked_add(amount)
        .filter(|b| *b <= MAX_BALANCE)?;
    account.credit_balance = balance;
    let tx = CreditTransaction {
        account_id: account.id.clone(),
        seq: account.transaction_count,
        amount: balance_delta(amount),
        reason: reason.to_string(),
        reference_id: reference_id.to_string(),
        balance_after: account.credit_balance,
        created_at: now,
    };
    account.transaction_count += 1;
    Some(tx)
}

// Amounts past MAX_BALANCE never reach the log, so the conversion is exact.
fn balance_delta(amount: u64) -> i64 {
    i64::try_from(amount).unwrap_or(i64::MAX)
}
