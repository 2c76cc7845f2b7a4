//! In-memory store implementations. Used by tests and dry-run tooling; the
//! semantics (idempotent save, all-or-nothing reservation) mirror the redb
//! implementations exactly.

use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::context::TimeProvider;
use crate::model::SignalStatus;
use crate::outcome::{RejectCode, ValidationPhase};
use crate::persistence::balance_store::{
    BalanceLock, BalanceSnapshot, BalanceStore, BucketReservation, ReserveOutcome,
};
use crate::persistence::event_log::{EventLog, SignalEvent, SignalEventType};
use crate::persistence::redb_store::StoreError;
use crate::persistence::reference::{
    Exchange, ExchangeAccount, Currency, Pair, PairRule, ReferenceStore,
};
use crate::persistence::signal_store::{SavedSignal, SignalStore, StoredLeg, StoredSignal};
use crate::plan::BucketKey;

/// Failure to inject on the next mutating call, for exercising the
/// persist-phase error branches.
#[derive(Debug, Clone)]
pub enum InjectedFailure {
    Reference(String),
    Unavailable(String),
}

impl InjectedFailure {
    fn into_error(self) -> StoreError {
        match self {
            InjectedFailure::Reference(msg) => StoreError::Reference(msg),
            InjectedFailure::Unavailable(msg) => StoreError::Unavailable(msg),
        }
    }
}

#[derive(Default)]
struct SignalTables {
    signals: HashMap<Uuid, StoredSignal>,
    by_external: HashMap<String, Uuid>,
    legs: BTreeMap<(Uuid, usize), StoredLeg>,
}

#[derive(Default)]
pub struct MemorySignalStore {
    inner: RwLock<SignalTables>,
    fail_next_save: Mutex<Option<InjectedFailure>>,
    fail_next_legs: Mutex<Option<InjectedFailure>>,
}

impl MemorySignalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_save(&self, failure: InjectedFailure) {
        *self.fail_next_save.lock() = Some(failure);
    }

    pub fn fail_next_save_legs(&self, failure: InjectedFailure) {
        *self.fail_next_legs.lock() = Some(failure);
    }
}

impl SignalStore for MemorySignalStore {
    fn find_by_external_id(&self, external_id: &str) -> Result<Option<StoredSignal>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .by_external
            .get(external_id)
            .and_then(|id| inner.signals.get(id))
            .cloned())
    }

    fn save(&self, signal: &StoredSignal) -> Result<SavedSignal, StoreError> {
        if let Some(failure) = self.fail_next_save.lock().take() {
            return Err(failure.into_error());
        }
        let mut inner = self.inner.write();
        if let Some(ext) = &signal.external_id {
            if let Some(existing) = inner.by_external.get(ext) {
                return Ok(SavedSignal {
                    id: *existing,
                    deduplicated: true,
                });
            }
        }
        inner.signals.insert(signal.id, signal.clone());
        if let Some(ext) = &signal.external_id {
            inner.by_external.insert(ext.clone(), signal.id);
        }
        Ok(SavedSignal {
            id: signal.id,
            deduplicated: false,
        })
    }

    fn get(&self, id: Uuid) -> Result<Option<StoredSignal>, StoreError> {
        Ok(self.inner.read().signals.get(&id).cloned())
    }

    fn update_status(&self, id: Uuid, status: SignalStatus) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        match inner.signals.get_mut(&id) {
            Some(row) => {
                row.status = status;
                Ok(())
            }
            None => Err(StoreError::Integrity(format!("signal not found: {id}"))),
        }
    }

    fn save_legs(&self, signal_id: Uuid, legs: &[StoredLeg]) -> Result<(), StoreError> {
        if let Some(failure) = self.fail_next_legs.lock().take() {
            return Err(failure.into_error());
        }
        let mut inner = self.inner.write();
        for leg in legs {
            inner.legs.insert((signal_id, leg.index), leg.clone());
        }
        Ok(())
    }

    fn legs_for(&self, signal_id: Uuid) -> Result<Vec<StoredLeg>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .legs
            .range((signal_id, 0)..=(signal_id, usize::MAX))
            .map(|(_, leg)| leg.clone())
            .collect())
    }
}

#[derive(Default)]
struct BalanceTables {
    balances: HashMap<BucketKey, BalanceSnapshot>,
    locks: HashMap<(BucketKey, String, Uuid), BalanceLock>,
}

/// Counting in the store doubles as the call-count spy the workflow tests
/// rely on to prove phase short-circuiting.
#[derive(Default)]
pub struct MemoryBalanceStore {
    inner: Mutex<BalanceTables>,
    find_available_calls: AtomicUsize,
    try_reserve_calls: AtomicUsize,
}

impl MemoryBalanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find_available_calls(&self) -> usize {
        self.find_available_calls.load(Ordering::SeqCst)
    }

    pub fn try_reserve_calls(&self) -> usize {
        self.try_reserve_calls.load(Ordering::SeqCst)
    }
}

impl BalanceStore for MemoryBalanceStore {
    fn find_available(
        &self,
        buckets: &[BucketKey],
    ) -> Result<HashMap<BucketKey, Decimal>, StoreError> {
        self.find_available_calls.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.lock();
        Ok(buckets
            .iter()
            .filter_map(|key| inner.balances.get(key).map(|b| (*key, b.available)))
            .collect())
    }

    fn balance(&self, key: BucketKey) -> Result<Option<BalanceSnapshot>, StoreError> {
        Ok(self.inner.lock().balances.get(&key).cloned())
    }

    fn upsert(&self, snapshot: BalanceSnapshot) -> Result<(), StoreError> {
        let key = BucketKey::new(snapshot.account_id, snapshot.currency_id);
        self.inner.lock().balances.insert(key, snapshot);
        Ok(())
    }

    fn try_reserve(
        &self,
        signal_id: Uuid,
        reason: &str,
        reservations: &[BucketReservation],
        expires_at_ms: i64,
    ) -> Result<ReserveOutcome, StoreError> {
        self.try_reserve_calls.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock();

        // Stage against copies; commit only when every bucket clears.
        let mut staged_balances = inner.balances.clone();
        let mut staged_locks = Vec::new();
        for r in reservations {
            let lock_id = (r.key, reason.to_string(), signal_id);
            if inner.locks.contains_key(&lock_id) {
                continue;
            }
            let row = staged_balances.get_mut(&r.key);
            match row {
                Some(row) if row.available >= r.amount => {
                    row.available -= r.amount;
                    row.reserved += r.amount;
                    staged_locks.push((
                        lock_id,
                        BalanceLock {
                            account_id: r.key.account_id,
                            currency_id: r.key.currency_id,
                            signal_id,
                            amount: r.amount,
                            reason: reason.to_string(),
                            expires_at_ms,
                        },
                    ));
                }
                other => {
                    let available = other.map(|b| b.available).unwrap_or(Decimal::ZERO);
                    return Ok(ReserveOutcome::Insufficient {
                        key: r.key,
                        required: r.amount,
                        available,
                    });
                }
            }
        }

        inner.balances = staged_balances;
        for (lock_id, lock) in staged_locks {
            inner.locks.insert(lock_id, lock);
        }
        Ok(ReserveOutcome::Reserved)
    }

    fn lock_for(
        &self,
        key: BucketKey,
        reason: &str,
        signal_id: Uuid,
    ) -> Result<Option<BalanceLock>, StoreError> {
        Ok(self
            .inner
            .lock()
            .locks
            .get(&(key, reason.to_string(), signal_id))
            .cloned())
    }
}

pub struct MemoryEventLog {
    events: Mutex<Vec<SignalEvent>>,
    time: Arc<dyn TimeProvider>,
}

impl MemoryEventLog {
    pub fn new(time: Arc<dyn TimeProvider>) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            time,
        }
    }

    pub fn all_events(&self) -> Vec<SignalEvent> {
        self.events.lock().clone()
    }

    fn append(&self, mut event: SignalEvent) -> Result<u64, StoreError> {
        let mut events = self.events.lock();
        event.seq = events.len() as u64 + 1;
        let seq = event.seq;
        events.push(event);
        Ok(seq)
    }
}

impl EventLog for MemoryEventLog {
    fn record_received(
        &self,
        signal_id: Uuid,
        external_id: Option<&str>,
        payload: Option<serde_json::Value>,
    ) -> Result<u64, StoreError> {
        self.append(SignalEvent {
            seq: 0,
            signal_id,
            event_type: SignalEventType::Received,
            phase: None,
            reject_code: None,
            message: None,
            external_id: external_id.map(str::to_string),
            payload,
            at_ms: self.time.now_millis(),
        })
    }

    fn record_ok(&self, signal_id: Uuid, phase: ValidationPhase) -> Result<u64, StoreError> {
        self.append(SignalEvent {
            seq: 0,
            signal_id,
            event_type: SignalEventType::ok_for(phase),
            phase: Some(phase),
            reject_code: None,
            message: None,
            external_id: None,
            payload: None,
            at_ms: self.time.now_millis(),
        })
    }

    fn record_failed(
        &self,
        signal_id: Uuid,
        phase: ValidationPhase,
        code: RejectCode,
        message: &str,
        details: &BTreeMap<String, serde_json::Value>,
    ) -> Result<u64, StoreError> {
        self.append(SignalEvent {
            seq: 0,
            signal_id,
            event_type: SignalEventType::failed_for(phase),
            phase: Some(phase),
            reject_code: Some(code),
            message: Some(message.to_string()),
            external_id: None,
            payload: serde_json::to_value(details).ok(),
            at_ms: self.time.now_millis(),
        })
    }

    fn record_accepted(&self, signal_id: Uuid) -> Result<u64, StoreError> {
        self.append(SignalEvent {
            seq: 0,
            signal_id,
            event_type: SignalEventType::Accepted,
            phase: None,
            reject_code: None,
            message: None,
            external_id: None,
            payload: None,
            at_ms: self.time.now_millis(),
        })
    }

    fn events_for(&self, signal_id: Uuid) -> Result<Vec<SignalEvent>, StoreError> {
        Ok(self
            .events
            .lock()
            .iter()
            .filter(|e| e.signal_id == signal_id)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
struct ReferenceTables {
    exchanges: HashMap<u64, Exchange>,
    exchanges_by_name: HashMap<String, u64>,
    accounts: HashMap<u64, ExchangeAccount>,
    currencies: HashMap<u64, Currency>,
    pairs: HashMap<u64, Pair>,
    pairs_by_symbol: HashMap<String, u64>,
    rules: HashMap<(u64, u64), PairRule>,
}

#[derive(Default)]
pub struct MemoryReferenceStore {
    inner: RwLock<ReferenceTables>,
}

impl MemoryReferenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReferenceStore for MemoryReferenceStore {
    fn exchange_by_name(&self, name: &str) -> Result<Option<Exchange>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .exchanges_by_name
            .get(&name.to_lowercase())
            .and_then(|id| inner.exchanges.get(id))
            .cloned())
    }

    fn pair_by_symbol(&self, symbol: &str) -> Result<Option<Pair>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .pairs_by_symbol
            .get(&symbol.to_lowercase())
            .and_then(|id| inner.pairs.get(id))
            .cloned())
    }

    fn primary_account(&self, exchange_id: u64) -> Result<Option<ExchangeAccount>, StoreError> {
        Ok(self
            .inner
            .read()
            .accounts
            .values()
            .find(|a| a.exchange_id == exchange_id && a.is_primary)
            .cloned())
    }

    fn pair_rule(&self, exchange_id: u64, pair_id: u64) -> Result<Option<PairRule>, StoreError> {
        Ok(self
            .inner
            .read()
            .rules
            .get(&(exchange_id, pair_id))
            .cloned())
    }

    fn upsert_exchange(&self, exchange: &Exchange) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner
            .exchanges_by_name
            .insert(exchange.name.to_lowercase(), exchange.id);
        inner.exchanges.insert(exchange.id, exchange.clone());
        Ok(())
    }

    fn upsert_account(&self, account: &ExchangeAccount) -> Result<(), StoreError> {
        self.inner
            .write()
            .accounts
            .insert(account.id, account.clone());
        Ok(())
    }

    fn upsert_currency(&self, currency: &Currency) -> Result<(), StoreError> {
        self.inner
            .write()
            .currencies
            .insert(currency.id, currency.clone());
        Ok(())
    }

    fn upsert_pair(&self, pair: &Pair) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner
            .pairs_by_symbol
            .insert(pair.symbol.to_lowercase(), pair.id);
        inner.pairs.insert(pair.id, pair.clone());
        Ok(())
    }

    fn upsert_pair_rule(&self, rule: &PairRule) -> Result<(), StoreError> {
        self.inner
            .write()
            .rules
            .insert((rule.exchange_id, rule.pair_id), rule.clone());
        Ok(())
    }
}
