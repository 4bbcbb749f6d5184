use crate::core::alert::AlertConditionInvalid;
use crate::core::entitlement::{Denial, Tier};
use crate::core::ledger::LedgerError;
use crate::store::StoreError;
use thiserror::Error;
use uuid::Uuid;

/// Everything a service call can fail with. Display strings are meant for
/// end users; provider detail never reaches them.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Denied(#[from] Denial),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    InvalidAlert(#[from] AlertConditionInvalid),
    #[error("{tier} tier allows at most {limit} alerts")]
    AlertLimitReached { tier: Tier, limit: usize },
    #[error("alert not found: {0}")]
    AlertNotFound(Uuid),
    #[error("portfolio not found: {0}")]
    PortfolioNotFound(String),
    #[error("alert {0} kept changing during update")]
    AlertContention(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CoreError {
    /// HTTP status a route layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            CoreError::Denied(denial) => denial.status_code(),
            CoreError::Ledger(LedgerError::InsufficientCredits { .. }) => 402,
            CoreError::Ledger(LedgerError::DuplicateReference(_)) => 409,
            CoreError::Ledger(LedgerError::AccountNotFound(_)) => 404,
            CoreError::Ledger(
                LedgerError::AmountTooLarge(_) | LedgerError::BalanceLimit { .. },
            ) => 400,
            CoreError::InvalidAlert(_) => 400,
            CoreError::AlertLimitReached { .. } => 403,
            CoreError::AlertNotFound(_) | CoreError::PortfolioNotFound(_) => 404,
            CoreError::AlertContention(_) => 409,
            CoreError::Ledger(_) | CoreError::Store(_) => 500,
        }
    }
}
