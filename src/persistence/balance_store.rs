use redb::{ReadableTable, TableDefinition};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::persistence::redb_store::{RedbStore, StoreError};
use crate::plan::BucketKey;

const BALANCES_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("balances");
const BALANCE_LOCKS_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("balance_locks");

/// Per (account, currency) funds. `available` and `reserved` never go
/// negative; reservation is a transfer between the two guarded by
/// `available >= amount`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub account_id: u64,
    pub currency_id: u64,
    pub available: Decimal,
    pub reserved: Decimal,
}

/// Audit/idempotency record of one reservation. At most one lock exists per
/// (account, currency, reason, signal): a duplicate reserve attempt for the
/// same signal is a no-op, never a double debit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceLock {
    pub account_id: u64,
    pub currency_id: u64,
    pub signal_id: Uuid,
    pub amount: Decimal,
    pub reason: String,
    pub expires_at_ms: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct BucketReservation {
    pub key: BucketKey,
    pub amount: Decimal,
}

#[derive(Debug, Clone)]
pub enum ReserveOutcome {
    Reserved,
    Insufficient {
        key: BucketKey,
        required: Decimal,
        available: Decimal,
    },
}

impl ReserveOutcome {
    pub fn is_reserved(&self) -> bool {
        matches!(self, ReserveOutcome::Reserved)
    }
}

pub trait BalanceStore: Send + Sync {
    fn find_available(
        &self,
        buckets: &[BucketKey],
    ) -> Result<HashMap<BucketKey, Decimal>, StoreError>;
    fn balance(&self, key: BucketKey) -> Result<Option<BalanceSnapshot>, StoreError>;
    fn upsert(&self, snapshot: BalanceSnapshot) -> Result<(), StoreError>;
    /// Reserve every bucket or reserve nothing. A bucket already locked for
    /// this (signal, reason) is skipped; any insufficient bucket aborts the
    /// whole attempt and rolls back the buckets reserved before it.
    fn try_reserve(
        &self,
        signal_id: Uuid,
        reason: &str,
        reservations: &[BucketReservation],
        expires_at_ms: i64,
    ) -> Result<ReserveOutcome, StoreError>;
    fn lock_for(
        &self,
        key: BucketKey,
        reason: &str,
        signal_id: Uuid,
    ) -> Result<Option<BalanceLock>, StoreError>;
}

fn balance_key(key: BucketKey) -> String {
    format!("{}:{}", key.account_id, key.currency_id)
}

fn lock_key(key: BucketKey, reason: &str, signal_id: Uuid) -> String {
    format!(
        "{}:{}:{}:{}",
        key.account_id, key.currency_id, reason, signal_id
    )
}

pub struct RedbBalanceStore {
    store: Arc<RedbStore>,
}

impl RedbBalanceStore {
    pub fn new(store: Arc<RedbStore>) -> Self {
        Self { store }
    }
}

impl BalanceStore for RedbBalanceStore {
    fn find_available(
        &self,
        buckets: &[BucketKey],
    ) -> Result<HashMap<BucketKey, Decimal>, StoreError> {
        let txn = self.store.begin_read()?;
        let table = match txn.open_table(BALANCES_TABLE) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(HashMap::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = HashMap::new();
        for key in buckets {
            if let Some(v) = table.get(balance_key(*key).as_str())? {
                let row: BalanceSnapshot = serde_json::from_slice(&v.value())?;
                out.insert(*key, row.available);
            }
        }
        Ok(out)
    }

    fn balance(&self, key: BucketKey) -> Result<Option<BalanceSnapshot>, StoreError> {
        let txn = self.store.begin_read()?;
        let table = match txn.open_table(BALANCES_TABLE) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let row = table
            .get(balance_key(key).as_str())?
            .map(|v| serde_json::from_slice::<BalanceSnapshot>(&v.value()))
            .transpose()?;
        Ok(row)
    }

    fn upsert(&self, snapshot: BalanceSnapshot) -> Result<(), StoreError> {
        let txn = self.store.begin_write()?;
        {
            let mut table = txn.open_table(BALANCES_TABLE)?;
            let key = balance_key(BucketKey::new(snapshot.account_id, snapshot.currency_id));
            table.insert(key.as_str(), serde_json::to_vec(&snapshot)?)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn try_reserve(
        &self,
        signal_id: Uuid,
        reason: &str,
        reservations: &[BucketReservation],
        expires_at_ms: i64,
    ) -> Result<ReserveOutcome, StoreError> {
        let txn = self.store.begin_write()?;
        let outcome = {
            let mut balances = txn.open_table(BALANCES_TABLE)?;
            let mut locks = txn.open_table(BALANCE_LOCKS_TABLE)?;

            let mut outcome = ReserveOutcome::Reserved;
            for r in reservations {
                let lkey = lock_key(r.key, reason, signal_id);
                if locks.get(lkey.as_str())?.is_some() {
                    // Already reserved for this signal; redelivery must not
                    // debit a second time.
                    debug!(signal_id = %signal_id, account_id = r.key.account_id,
                        currency_id = r.key.currency_id, "lock exists, skipping bucket");
                    continue;
                }

                let bkey = balance_key(r.key);
                let current: Option<BalanceSnapshot> = match balances.get(bkey.as_str())? {
                    Some(v) => Some(serde_json::from_slice(&v.value())?),
                    None => None,
                };
                let mut row = match current {
                    Some(row) if row.available >= r.amount => row,
                    other => {
                        let available = other.map(|b| b.available).unwrap_or(Decimal::ZERO);
                        outcome = ReserveOutcome::Insufficient {
                            key: r.key,
                            required: r.amount,
                            available,
                        };
                        break;
                    }
                };

                row.available -= r.amount;
                row.reserved += r.amount;
                balances.insert(bkey.as_str(), serde_json::to_vec(&row)?)?;

                let lock = BalanceLock {
                    account_id: r.key.account_id,
                    currency_id: r.key.currency_id,
                    signal_id,
                    amount: r.amount,
                    reason: reason.to_string(),
                    expires_at_ms,
                };
                locks.insert(lkey.as_str(), serde_json::to_vec(&lock)?)?;
            }
            outcome
        };

        match outcome {
            ReserveOutcome::Reserved => {
                txn.commit()?;
                Ok(ReserveOutcome::Reserved)
            }
            insufficient => {
                // Abort drops every debit and lock written in this attempt.
                txn.abort()?;
                warn!(signal_id = %signal_id, "reservation aborted, no buckets held");
                Ok(insufficient)
            }
        }
    }

    fn lock_for(
        &self,
        key: BucketKey,
        reason: &str,
        signal_id: Uuid,
    ) -> Result<Option<BalanceLock>, StoreError> {
        let txn = self.store.begin_read()?;
        let table = match txn.open_table(BALANCE_LOCKS_TABLE) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let row = table
            .get(lock_key(key, reason, signal_id).as_str())?
            .map(|v| serde_json::from_slice::<BalanceLock>(&v.value()))
            .transpose()?;
        Ok(row)
    }
}
