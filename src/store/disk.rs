use super::{
    AccountStore, AlertStore, CreditOutcome, PriceMemoStore, ReserveOutcome, StoreError,
    commit_transaction, credit_transaction, is_stale, new_account, plan_reserve,
};
use crate::core::alert::{Alert, AlertTrigger};
use crate::core::ledger::{Account, AccountSeed, CreditTransaction, Hold};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fjall::{Batch, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

const SEP: char = '\0';

fn key(parts: &[&str]) -> Vec<u8> {
    parts.join(&SEP.to_string()).into_bytes()
}

fn prefix(part: &str) -> Vec<u8> {
    format!("{part}{SEP}").into_bytes()
}

fn seq_key(owner: &str, seq: u64) -> Vec<u8> {
    key(&[owner, &format!("{seq:020}")])
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec(value)?)
}

fn read<T: DeserializeOwned>(partition: &PartitionHandle, key: &[u8]) -> Result<Option<T>, StoreError> {
    match partition.get(key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

fn scan<T: DeserializeOwned>(partition: &PartitionHandle, prefix: &[u8]) -> Result<Vec<T>, StoreError> {
    let mut values = Vec::new();
    for item in partition.prefix(prefix) {
        let (_, bytes) = item?;
        values.push(serde_json::from_slice(&bytes)?);
    }
    Ok(values)
}

/// Store backed by a fjall keyspace on disk.
///
/// Mutations are serialized by `write_lock` and land as one atomic batch, so a
/// balance change and its log entry are never observed apart.
pub struct DiskStore {
    keyspace: Keyspace,
    accounts: PartitionHandle,
    transactions: PartitionHandle,
    references: PartitionHandle,
    holds: PartitionHandle,
    alerts: PartitionHandle,
    triggers: PartitionHandle,
    prices: PartitionHandle,
    write_lock: Mutex<()>,
}

impl DiskStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(path)
            .map_err(|e| StoreError::Corrupt(format!("cannot create {}: {e}", path.display())))?;
        let keyspace = fjall::Config::new(path).open()?;
        let partition =
            |name: &str| keyspace.open_partition(name, PartitionCreateOptions::default());
        let store = Self {
            accounts: partition("accounts")?,
            transactions: partition("transactions")?,
            references: partition("references")?,
            holds: partition("holds")?,
            alerts: partition("alerts")?,
            triggers: partition("triggers")?,
            prices: partition("prices")?,
            keyspace: keyspace.clone(),
            write_lock: Mutex::new(()),
        };
        debug!("Opened disk store at {}", path.display());
        Ok(store)
    }

    fn account(&self, account_id: &str) -> Result<Option<Account>, StoreError> {
        read(&self.accounts, account_id.as_bytes())
    }

    fn committed(
        &self,
        account_id: &str,
        reference_id: &str,
    ) -> Result<Option<CreditTransaction>, StoreError> {
        read(&self.references, &key(&[account_id, reference_id]))
    }

    fn stage_transaction(&self, batch: &mut Batch, tx: &CreditTransaction) -> Result<(), StoreError> {
        let value = encode(tx)?;
        batch.insert(&self.transactions, seq_key(&tx.account_id, tx.seq), value.clone());
        batch.insert(
            &self.references,
            key(&[&tx.account_id, &tx.reference_id]),
            value,
        );
        Ok(())
    }

    fn commit(&self, batch: Batch) -> Result<(), StoreError> {
        batch.commit()?;
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}

#[async_trait]
impl AccountStore for DiskStore {
    async fn open_account(
        &self,
        seed: &AccountSeed,
        now: DateTime<Utc>,
    ) -> Result<Account, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut batch = self.keyspace.batch();
        let account = match self.account(&seed.id)? {
            Some(mut account) => {
                account.tier = seed.tier;
                account.monthly_allowance = seed.monthly_allowance;
                account
            }
            None => {
                let (account, opening) = new_account(seed, now);
                if let Some(tx) = opening {
                    self.stage_transaction(&mut batch, &tx)?;
                }
                account
            }
        };
        batch.insert(&self.accounts, account.id.clone().into_bytes(), encode(&account)?);
        self.commit(batch)?;
        Ok(account)
    }

    async fn get_account(&self, account_id: &str) -> Result<Option<Account>, StoreError> {
        self.account(account_id)
    }

    async fn reserve(
        &self,
        hold: &Hold,
        stale_before: DateTime<Utc>,
    ) -> Result<ReserveOutcome, StoreError> {
        let _guard = self.write_lock.lock().await;
        let Some(mut account) = self.account(&hold.account_id)? else {
            return Ok(ReserveOutcome::AccountMissing);
        };
        let committed = self.committed(&hold.account_id, &hold.reference_id)?;
        let hold_key = key(&[&hold.account_id, &hold.reference_id]);
        let existing = read::<Hold>(&self.holds, &hold_key)?;
        let plan = plan_reserve(
            &mut account,
            committed.as_ref(),
            existing.as_ref(),
            hold,
            stale_before,
        );
        let reserved = matches!(plan.outcome, ReserveOutcome::Reserved { .. });
        if reserved || plan.drop_stale_hold {
            let mut batch = self.keyspace.batch();
            batch.insert(&self.accounts, account.id.clone().into_bytes(), encode(&account)?);
            if reserved {
                batch.insert(&self.holds, hold_key, encode(hold)?);
            } else {
                batch.remove(&self.holds, hold_key);
            }
            self.commit(batch)?;
        }
        Ok(plan.outcome)
    }

    async fn commit_hold(
        &self,
        account_id: &str,
        reference_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CreditTransaction>, StoreError> {
        let _guard = self.write_lock.lock().await;
        if let Some(tx) = self.committed(account_id, reference_id)? {
            return Ok(Some(tx));
        }
        let hold_key = key(&[account_id, reference_id]);
        let Some(hold) = read::<Hold>(&self.holds, &hold_key)? else {
            return Ok(None);
        };
        let mut account = self
            .account(account_id)?
            .ok_or_else(|| StoreError::Corrupt(format!("hold without account {account_id}")))?;
        let tx = commit_transaction(&mut account, &hold, now);

        let mut batch = self.keyspace.batch();
        self.stage_transaction(&mut batch, &tx)?;
        batch.insert(&self.accounts, account.id.clone().into_bytes(), encode(&account)?);
        batch.remove(&self.holds, hold_key);
        self.commit(batch)?;
        Ok(Some(tx))
    }

    async fn release_hold(
        &self,
        account_id: &str,
        reference_id: &str,
    ) -> Result<Option<u64>, StoreError> {
        let _guard = self.write_lock.lock().await;
        let hold_key = key(&[account_id, reference_id]);
        let Some(hold) = read::<Hold>(&self.holds, &hold_key)? else {
            return Ok(None);
        };
        let mut account = self
            .account(account_id)?
            .ok_or_else(|| StoreError::Corrupt(format!("hold without account {account_id}")))?;
        account.credit_balance += hold.amount;

        let mut batch = self.keyspace.batch();
        batch.insert(&self.accounts, account.id.clone().into_bytes(), encode(&account)?);
        batch.remove(&self.holds, hold_key);
        self.commit(batch)?;
        Ok(Some(account.credit_balance))
    }

    async fn release_stale_holds(
        &self,
        account_id: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Hold>, StoreError> {
        let _guard = self.write_lock.lock().await;
        let released: Vec<Hold> = scan::<Hold>(&self.holds, &prefix(account_id))?
            .into_iter()
            .filter(|h| is_stale(h, stale_before))
            .collect();
        if released.is_empty() {
            return Ok(released);
        }
        let mut account = self
            .account(account_id)?
            .ok_or_else(|| StoreError::Corrupt(format!("hold without account {account_id}")))?;
        account.credit_balance += released.iter().map(|h| h.amount).sum::<u64>();

        let mut batch = self.keyspace.batch();
        batch.insert(&self.accounts, account.id.clone().into_bytes(), encode(&account)?);
        for hold in &released {
            batch.remove(&self.holds, key(&[account_id, &hold.reference_id]));
        }
        self.commit(batch)?;
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
        let _guard = self.write_lock.lock().await;
        if let Some(tx) = self.committed(account_id, reference_id)? {
            return Ok(CreditOutcome::AlreadyApplied(tx));
        }
        let Some(mut account) = self.account(account_id)? else {
            return Ok(CreditOutcome::AccountMissing);
        };
        let Some(tx) = credit_transaction(&mut account, amount, reason, reference_id, now) else {
            return Ok(CreditOutcome::BalanceLimit {
                balance: account.credit_balance,
            });
        };

        let mut batch = self.keyspace.batch();
        self.stage_transaction(&mut batch, &tx)?;
        batch.insert(&self.accounts, account.id.clone().into_bytes(), encode(&account)?);
        self.commit(batch)?;
        Ok(CreditOutcome::Applied(tx))
    }

    async fn transactions(&self, account_id: &str) -> Result<Vec<CreditTransaction>, StoreError> {
        scan(&self.transactions, &prefix(account_id))
    }

    async fn holds(&self, account_id: &str) -> Result<Vec<Hold>, StoreError> {
        scan(&self.holds, &prefix(account_id))
    }
}

#[async_trait]
impl AlertStore for DiskStore {
    async fn insert_alert(&self, alert: &Alert, limit: Option<usize>) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        if let Some(max) = limit {
            let existing = self.alerts_for(&alert.account_id).await?.len();
            if existing >= max {
                return Ok(false);
            }
        }
        let mut batch = self.keyspace.batch();
        batch.insert(
            &self.alerts,
            key(&[&alert.account_id, &alert.id.to_string()]),
            encode(alert)?,
        );
        self.commit(batch)?;
        Ok(true)
    }

    async fn get_alert(&self, id: &Uuid) -> Result<Option<Alert>, StoreError> {
        let wanted = format!("{SEP}{id}");
        for item in self.alerts.iter() {
            let (stored_key, bytes) = item?;
            if stored_key.ends_with(wanted.as_bytes()) {
                return Ok(Some(serde_json::from_slice(&bytes)?));
            }
        }
        Ok(None)
    }

    async fn alerts_for(&self, account_id: &str) -> Result<Vec<Alert>, StoreError> {
        let mut alerts: Vec<Alert> = scan(&self.alerts, &prefix(account_id))?;
        alerts.sort_by_key(|a| (a.created_at, a.id));
        Ok(alerts)
    }

    async fn update_alert(
        &self,
        alert: &Alert,
        trigger: Option<&AlertTrigger>,
    ) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let alert_key = key(&[&alert.account_id, &alert.id.to_string()]);
        let Some(stored) = read::<Alert>(&self.alerts, &alert_key)? else {
            return Ok(false);
        };
        if stored.revision != alert.revision {
            return Ok(false);
        }
        let next = Alert {
            revision: alert.revision + 1,
            ..alert.clone()
        };
        let mut batch = self.keyspace.batch();
        batch.insert(&self.alerts, alert_key, encode(&next)?);
        if let Some(trigger) = trigger {
            batch.insert(
                &self.triggers,
                seq_key(&alert.id.to_string(), next.trigger_count),
                encode(trigger)?,
            );
        }
        self.commit(batch)?;
        Ok(true)
    }

    async fn delete_alert(&self, id: &Uuid) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let Some(alert) = self.get_alert(id).await? else {
            return Ok(false);
        };
        let mut batch = self.keyspace.batch();
        batch.remove(&self.alerts, key(&[&alert.account_id, &id.to_string()]));
        for item in self.triggers.prefix(prefix(&id.to_string())) {
            let (trigger_key, _) = item?;
            batch.remove(&self.triggers, trigger_key.to_vec());
        }
        self.commit(batch)?;
        Ok(true)
    }

    async fn triggers_for(&self, alert_id: &Uuid) -> Result<Vec<AlertTrigger>, StoreError> {
        scan(&self.triggers, &prefix(&alert_id.to_string()))
    }
}

#[async_trait]
impl PriceMemoStore for DiskStore {
    async fn remember_prices(
        &self,
        portfolio_id: &str,
        prices: &[(String, f64)],
    ) -> Result<(), StoreError> {
        let mut batch = self.keyspace.batch();
        for (symbol, price) in prices {
            batch.insert(&self.prices, key(&[portfolio_id, symbol]), encode(price)?);
        }
        self.commit(batch)?;
        Ok(())
    }

    async fn remembered_prices(
        &self,
        portfolio_id: &str,
    ) -> Result<HashMap<String, f64>, StoreError> {
        let start = prefix(portfolio_id);
        let mut prices = HashMap::new();
        for item in self.prices.prefix(&start) {
            let (stored_key, bytes) = item?;
            let symbol = String::from_utf8_lossy(&stored_key[start.len()..]).to_string();
            prices.insert(symbol, serde_json::from_slice(&bytes)?);
        }
        Ok(prices)
    }
}
