//! Credit balances, holds and the append-only transaction log.
//!
//! Every balance change goes through a single conditional primitive on the
//! [`AccountStore`]; this module never reads a balance, computes a new one and
//! writes it back.

use crate::core::clock::Clock;
use crate::core::entitlement::Tier;
use crate::store::{AccountStore, CreditOutcome, ReserveOutcome, StoreError};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Largest balance an account may hold. Log amounts are signed, so no single
/// amount or balance may go past `i64::MAX`.
pub const MAX_BALANCE: u64 = i64::MAX as u64;

/// How long a hold may sit uncommitted before a retry or sweep reclaims it.
pub const DEFAULT_HOLD_LEASE_SECS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub tier: Tier,
    pub credit_balance: u64,
    pub monthly_allowance: u64,
    pub transaction_count: u64,
    pub created_at: DateTime<Utc>,
}

/// Configuration-side description of an account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSeed {
    pub id: String,
    pub tier: Tier,
    #[serde(default)]
    pub monthly_allowance: u64,
    #[serde(default)]
    pub opening_balance: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub account_id: String,
    pub seq: u64,
    /// Negative for debits.
    pub amount: i64,
    pub reason: String,
    pub reference_id: String,
    pub balance_after: u64,
    pub created_at: DateTime<Utc>,
}

/// Credits set aside by a reserve and not yet committed or released.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hold {
    pub account_id: String,
    pub reference_id: String,
    pub amount: u64,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebitReceipt {
    pub account_id: String,
    pub reference_id: String,
    pub amount: u64,
    pub new_balance: u64,
    /// The reference had already been committed; nothing was charged.
    pub replayed: bool,
}

/// Handle for credits reserved by [`CreditLedger::reserve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    Held {
        account_id: String,
        reference_id: String,
        amount: u64,
        balance_after_hold: u64,
    },
    /// The reference was committed earlier; commit returns this receipt.
    Settled(DebitReceipt),
}

impl Reservation {
    pub fn reference_id(&self) -> &str {
        match self {
            Reservation::Held { reference_id, .. } => reference_id,
            Reservation::Settled(receipt) => &receipt.reference_id,
        }
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient credits: need {required}, have {available}")]
    InsufficientCredits { required: u64, available: u64 },
    #[error("charge {0} is already in progress")]
    DuplicateReference(String),
    #[error("account not found: {0}")]
    AccountNotFound(String),
    #[error("no reservation found for {0}")]
    UnknownReservation(String),
    #[error("amount {0} exceeds the largest allowed balance")]
    AmountTooLarge(u64),
    #[error("credit of {amount} would exceed the largest allowed balance (have {balance})")]
    BalanceLimit { amount: u64, balance: u64 },
    #[error("ledger storage failed: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditReport {
    pub account_id: String,
    pub balance: u64,
    pub ledger_sum: i64,
    pub held: u64,
    pub transactions: usize,
}

impl AuditReport {
    /// The balance is exactly what the log says minus what is on hold.
    pub fn is_consistent(&self) -> bool {
        self.ledger_sum - self.held as i64 == self.balance as i64
    }
}

pub struct CreditLedger {
    store: Arc<dyn AccountStore>,
    clock: Arc<dyn Clock>,
    hold_lease: ChronoDuration,
}

fn check_amount(amount: u64) -> Result<(), LedgerError> {
    if amount > MAX_BALANCE {
        return Err(LedgerError::AmountTooLarge(amount));
    }
    Ok(())
}

impl CreditLedger {
    pub fn new(store: Arc<dyn AccountStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            hold_lease: ChronoDuration::seconds(DEFAULT_HOLD_LEASE_SECS as i64),
        }
    }

    /// Holds older than `lease` count as abandoned by a process that never
    /// committed or released them.
    pub fn with_hold_lease(mut self, lease: ChronoDuration) -> Self {
        self.hold_lease = lease;
        self
    }

    fn stale_before(&self) -> DateTime<Utc> {
        self.clock.now() - self.hold_lease
    }

    pub async fn open_account(&self, seed: &AccountSeed) -> Result<Account, LedgerError> {
        check_amount(seed.opening_balance)?;
        let account = self.store.open_account(seed, self.clock.now()).await?;
        debug!(account = %account.id, balance = account.credit_balance, "Account ready");
        Ok(account)
    }

    pub async fn account(&self, account_id: &str) -> Result<Account, LedgerError> {
        self.store
            .get_account(account_id)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(account_id.to_string()))
    }

    /// Sets `amount` credits aside under `reference_id`.
    pub async fn reserve(
        &self,
        account_id: &str,
        amount: u64,
        reason: &str,
        reference_id: &str,
    ) -> Result<Reservation, LedgerError> {
        check_amount(amount)?;
        let hold = Hold {
            account_id: account_id.to_string(),
            reference_id: reference_id.to_string(),
            amount,
            reason: reason.to_string(),
            created_at: self.clock.now(),
        };
        match self.store.reserve(&hold, self.stale_before()).await? {
            ReserveOutcome::Reserved { new_balance } => {
                debug!(account = %account_id, reference = %reference_id, amount, new_balance, "Credits reserved");
                Ok(Reservation::Held {
                    account_id: account_id.to_string(),
                    reference_id: reference_id.to_string(),
                    amount,
                    balance_after_hold: new_balance,
                })
            }
            ReserveOutcome::AlreadyCommitted(tx) => {
                info!(account = %account_id, reference = %reference_id, "Duplicate charge ignored");
                Ok(Reservation::Settled(DebitReceipt {
                    account_id: tx.account_id,
                    reference_id: tx.reference_id,
                    amount: tx.amount.unsigned_abs(),
                    new_balance: tx.balance_after,
                    replayed: true,
                }))
            }
            ReserveOutcome::AlreadyHeld => {
                Err(LedgerError::DuplicateReference(reference_id.to_string()))
            }
            ReserveOutcome::Insufficient { available } => Err(LedgerError::InsufficientCredits {
                required: amount,
                available,
            }),
            ReserveOutcome::AccountMissing => {
                Err(LedgerError::AccountNotFound(account_id.to_string()))
            }
        }
    }

    /// Turns a reservation into a permanent debit.
    pub async fn commit(&self, reservation: Reservation) -> Result<DebitReceipt, LedgerError> {
        let (account_id, reference_id, amount) = match reservation {
            Reservation::Settled(receipt) => return Ok(receipt),
            Reservation::Held {
                account_id,
                reference_id,
                amount,
                ..
            } => (account_id, reference_id, amount),
        };
        let tx = self
            .store
            .commit_hold(&account_id, &reference_id, self.clock.now())
            .await?
            .ok_or_else(|| LedgerError::UnknownReservation(reference_id.clone()))?;
        info!(account = %account_id, reference = %reference_id, amount, balance = tx.balance_after, "Debit committed");
        Ok(DebitReceipt {
            account_id,
            reference_id,
            amount,
            new_balance: tx.balance_after,
            replayed: false,
        })
    }

    /// Returns reserved credits to the balance. Settled reservations are left alone.
    pub async fn release(&self, reservation: Reservation) -> Result<(), LedgerError> {
        if let Reservation::Held {
            account_id,
            reference_id,
            ..
        } = reservation
        {
            match self.store.release_hold(&account_id, &reference_id).await? {
                Some(balance) => {
                    debug!(account = %account_id, reference = %reference_id, balance, "Reservation released")
                }
                None => {
                    warn!(account = %account_id, reference = %reference_id, "Released an unknown reservation")
                }
            }
        }
        Ok(())
    }

    /// Releases one hold by reference, whoever created it. Returns the new balance.
    pub async fn release_hold(
        &self,
        account_id: &str,
        reference_id: &str,
    ) -> Result<u64, LedgerError> {
        let balance = self
            .store
            .release_hold(account_id, reference_id)
            .await?
            .ok_or_else(|| LedgerError::UnknownReservation(reference_id.to_string()))?;
        info!(account = %account_id, reference = %reference_id, balance, "Hold released");
        Ok(balance)
    }

    /// Gives back the credits of every hold past its lease.
    pub async fn reclaim_stale_holds(&self, account_id: &str) -> Result<Vec<Hold>, LedgerError> {
        let released = self
            .store
            .release_stale_holds(account_id, self.stale_before())
            .await?;
        for hold in &released {
            warn!(
                account = %account_id,
                reference = %hold.reference_id,
                amount = hold.amount,
                created_at = %hold.created_at,
                "Reclaimed abandoned hold"
            );
        }
        Ok(released)
    }

    pub async fn debit(
        &self,
        account_id: &str,
        amount: u64,
        reason: &str,
        reference_id: &str,
    ) -> Result<DebitReceipt, LedgerError> {
        let reservation = self.reserve(account_id, amount, reason, reference_id).await?;
        self.commit(reservation).await
    }

    /// Adds credits. With a reference, repeating the call is a no-op.
    pub async fn credit(
        &self,
        account_id: &str,
        amount: u64,
        reason: &str,
        reference_id: Option<&str>,
    ) -> Result<CreditTransaction, LedgerError> {
        check_amount(amount)?;
        let reference = reference_id
            .map(str::to_string)
            .unwrap_or_else(|| format!("credit:{}", uuid::Uuid::new_v4()));
        match self
            .store
            .apply_credit(account_id, amount, reason, &reference, self.clock.now())
            .await?
        {
            CreditOutcome::Applied(tx) => {
                info!(account = %account_id, amount, reason, balance = tx.balance_after, "Credits granted");
                Ok(tx)
            }
            CreditOutcome::AlreadyApplied(tx) => {
                debug!(account = %account_id, reference = %reference, "Credit already applied");
                Ok(tx)
            }
            CreditOutcome::BalanceLimit { balance } => {
                Err(LedgerError::BalanceLimit { amount, balance })
            }
            CreditOutcome::AccountMissing => {
                Err(LedgerError::AccountNotFound(account_id.to_string()))
            }
        }
    }

    /// Grants the account's monthly allowance once for the month containing `at`.
    pub async fn grant_monthly_allowance(
        &self,
        account_id: &str,
        at: DateTime<Utc>,
    ) -> Result<CreditTransaction, LedgerError> {
        let account = self.account(account_id).await?;
        let reference = format!("allowance:{}:{:04}-{:02}", account_id, at.year(), at.month());
        self.credit(
            account_id,
            account.monthly_allowance,
            "monthly_allowance",
            Some(&reference),
        )
        .await
    }

    pub async fn history(&self, account_id: &str) -> Result<Vec<CreditTransaction>, LedgerError> {
        Ok(self.store.transactions(account_id).await?)
    }

    pub async fn audit(&self, account_id: &str) -> Result<AuditReport, LedgerError> {
        let account = self.account(account_id).await?;
        let transactions = self.store.transactions(account_id).await?;
        let holds = self.store.holds(account_id).await?;
        Ok(AuditReport {
            account_id: account.id,
            balance: account.credit_balance,
            ledger_sum: transactions.iter().map(|t| t.amount).sum(),
            held: holds.iter().map(|h| h.amount).sum(),
            transactions: transactions.len(),
        })
    }
}
