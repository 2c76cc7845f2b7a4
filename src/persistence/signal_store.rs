use chrono::{DateTime, Utc};
use redb::{ReadableTable, TableDefinition};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::model::{Side, SignalStatus, TimeInForce};
use crate::persistence::redb_store::{RedbStore, StoreError};

const SIGNALS_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("signals");
const SIGNALS_BY_EXTERNAL_TABLE: TableDefinition<&str, &str> =
    TableDefinition::new("signals_by_external_id");
const SIGNAL_LEGS_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("signal_legs");

/// Persisted signal row. `external_id`, when present, is unique; re-delivery
/// of the same external id resolves to the original row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSignal {
    pub id: Uuid,
    pub external_id: Option<String>,
    pub ttl_ms: Option<i64>,
    pub status: SignalStatus,
    pub source: Option<String>,
    pub constraints: Option<String>,
    pub expected_pnl: Option<Decimal>,
    pub producer_created_at: Option<DateTime<Utc>>,
}

/// Child row written after integrity resolution, so the audit trail carries
/// resolved identifiers rather than raw producer strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredLeg {
    pub signal_id: Uuid,
    pub index: usize,
    pub exchange_id: u64,
    pub exchange_account_id: u64,
    pub pair_id: u64,
    pub spend_currency_id: u64,
    pub receive_currency_id: u64,
    pub side: Side,
    pub price: Decimal,
    pub qty: Decimal,
    pub required_spend: Decimal,
    pub time_in_force: TimeInForce,
}

#[derive(Debug, Clone, Copy)]
pub struct SavedSignal {
    pub id: Uuid,
    /// true when an existing row with the same external id was returned
    pub deduplicated: bool,
}

pub trait SignalStore: Send + Sync {
    fn find_by_external_id(&self, external_id: &str) -> Result<Option<StoredSignal>, StoreError>;
    /// Idempotent insert: when `external_id` already exists the stored id is
    /// returned and nothing is written.
    fn save(&self, signal: &StoredSignal) -> Result<SavedSignal, StoreError>;
    fn get(&self, id: Uuid) -> Result<Option<StoredSignal>, StoreError>;
    fn update_status(&self, id: Uuid, status: SignalStatus) -> Result<(), StoreError>;
    /// Legs are keyed (signal, index); a redelivered attempt overwrites
    /// instead of duplicating.
    fn save_legs(&self, signal_id: Uuid, legs: &[StoredLeg]) -> Result<(), StoreError>;
    fn legs_for(&self, signal_id: Uuid) -> Result<Vec<StoredLeg>, StoreError>;
}

pub struct RedbSignalStore {
    store: Arc<RedbStore>,
}

impl RedbSignalStore {
    pub fn new(store: Arc<RedbStore>) -> Self {
        Self { store }
    }
}

impl SignalStore for RedbSignalStore {
    fn find_by_external_id(&self, external_id: &str) -> Result<Option<StoredSignal>, StoreError> {
        let txn = self.store.begin_read()?;
        let index = match txn.open_table(SIGNALS_BY_EXTERNAL_TABLE) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let id = match index.get(external_id)? {
            Some(v) => v.value().to_string(),
            None => return Ok(None),
        };
        let signals = txn.open_table(SIGNALS_TABLE)?;
        let row = signals
            .get(id.as_str())?
            .map(|v| serde_json::from_slice::<StoredSignal>(&v.value()))
            .transpose()?;
        Ok(row)
    }

    fn save(&self, signal: &StoredSignal) -> Result<SavedSignal, StoreError> {
        let txn = self.store.begin_write()?;
        let saved = {
            let mut signals = txn.open_table(SIGNALS_TABLE)?;
            let mut index = txn.open_table(SIGNALS_BY_EXTERNAL_TABLE)?;

            // Re-check inside the write transaction: concurrent re-delivery
            // must not create a second row for the same external id.
            let existing = match &signal.external_id {
                Some(ext) => index.get(ext.as_str())?.map(|v| v.value().to_string()),
                None => None,
            };
            match existing {
                Some(id_str) => {
                    let id = Uuid::parse_str(&id_str)
                        .map_err(|e| StoreError::Integrity(format!("bad signal id: {e}")))?;
                    info!(signal_id = %id, external_id = ?signal.external_id,
                        "signal already exists (idempotent)");
                    SavedSignal {
                        id,
                        deduplicated: true,
                    }
                }
                None => {
                    let id_str = signal.id.to_string();
                    signals.insert(id_str.as_str(), serde_json::to_vec(signal)?)?;
                    if let Some(ext) = &signal.external_id {
                        index.insert(ext.as_str(), id_str.as_str())?;
                    }
                    SavedSignal {
                        id: signal.id,
                        deduplicated: false,
                    }
                }
            }
        };
        txn.commit()?;
        Ok(saved)
    }

    fn get(&self, id: Uuid) -> Result<Option<StoredSignal>, StoreError> {
        let txn = self.store.begin_read()?;
        let signals = match txn.open_table(SIGNALS_TABLE) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let row = signals
            .get(id.to_string().as_str())?
            .map(|v| serde_json::from_slice::<StoredSignal>(&v.value()))
            .transpose()?;
        Ok(row)
    }

    fn update_status(&self, id: Uuid, status: SignalStatus) -> Result<(), StoreError> {
        let txn = self.store.begin_write()?;
        {
            let mut signals = txn.open_table(SIGNALS_TABLE)?;
            let key = id.to_string();
            let mut row: StoredSignal = match signals.get(key.as_str())? {
                Some(v) => serde_json::from_slice(&v.value())?,
                None => return Err(StoreError::Integrity(format!("signal not found: {id}"))),
            };
            row.status = status;
            signals.insert(key.as_str(), serde_json::to_vec(&row)?)?;
        }
        txn.commit()?;
        info!(signal_id = %id, status = ?status, "signal status updated");
        Ok(())
    }

    fn save_legs(&self, signal_id: Uuid, legs: &[StoredLeg]) -> Result<(), StoreError> {
        let txn = self.store.begin_write()?;
        {
            let mut table = txn.open_table(SIGNAL_LEGS_TABLE)?;
            for leg in legs {
                let key = format!("{}:{}", signal_id, leg.index);
                table.insert(key.as_str(), serde_json::to_vec(leg)?)?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    fn legs_for(&self, signal_id: Uuid) -> Result<Vec<StoredLeg>, StoreError> {
        let txn = self.store.begin_read()?;
        let table = match txn.open_table(SIGNAL_LEGS_TABLE) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let prefix = format!("{signal_id}:");
        let mut legs = Vec::new();
        for res in table.range::<&str>(..)? {
            let (k, v) = res?;
            if k.value().starts_with(&prefix) {
                legs.push(serde_json::from_slice::<StoredLeg>(&v.value())?);
            }
        }
        legs.sort_by_key(|l| l.index);
        Ok(legs)
    }
}
