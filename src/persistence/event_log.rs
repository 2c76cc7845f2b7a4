use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::context::TimeProvider;
use crate::outcome::{RejectCode, ValidationPhase};
use crate::persistence::redb_store::{RedbStore, StoreError};

const EVENTS_TABLE: TableDefinition<u64, Vec<u8>> = TableDefinition::new("signal_events");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalEventType {
    Received,
    IntegrityOk,
    IntegrityFailed,
    FreshnessOk,
    FreshnessFailed,
    BalanceOk,
    BalanceFailed,
    MarketOk,
    MarketFailed,
    LiquidityOk,
    LiquidityFailed,
    PnlOk,
    PnlFailed,
    RiskOk,
    RiskFailed,
    /// all validations passed
    Accepted,
    /// final rejected (mirror of the status change)
    Rejected,
    StatusChanged,
}

impl SignalEventType {
    pub fn ok_for(phase: ValidationPhase) -> Self {
        match phase {
            ValidationPhase::Persist => SignalEventType::StatusChanged,
            ValidationPhase::Integrity => SignalEventType::IntegrityOk,
            ValidationPhase::Freshness => SignalEventType::FreshnessOk,
            ValidationPhase::Balance => SignalEventType::BalanceOk,
            ValidationPhase::Market => SignalEventType::MarketOk,
            ValidationPhase::Liquidity => SignalEventType::LiquidityOk,
            ValidationPhase::Pnl => SignalEventType::PnlOk,
            ValidationPhase::Risk => SignalEventType::RiskOk,
        }
    }

    pub fn failed_for(phase: ValidationPhase) -> Self {
        match phase {
            ValidationPhase::Persist => SignalEventType::StatusChanged,
            ValidationPhase::Integrity => SignalEventType::IntegrityFailed,
            ValidationPhase::Freshness => SignalEventType::FreshnessFailed,
            ValidationPhase::Balance => SignalEventType::BalanceFailed,
            ValidationPhase::Market => SignalEventType::MarketFailed,
            ValidationPhase::Liquidity => SignalEventType::LiquidityFailed,
            ValidationPhase::Pnl => SignalEventType::PnlFailed,
            ValidationPhase::Risk => SignalEventType::RiskFailed,
        }
    }
}

/// One per phase outcome, append-only. The ledger is what operators read to
/// explain a decision after the fact, so every rejection lands here before
/// the pipeline returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEvent {
    pub seq: u64,
    pub signal_id: Uuid,
    pub event_type: SignalEventType,
    pub phase: Option<ValidationPhase>,
    pub reject_code: Option<RejectCode>,
    pub message: Option<String>,
    pub external_id: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub at_ms: i64,
}

pub trait EventLog: Send + Sync {
    fn record_received(
        &self,
        signal_id: Uuid,
        external_id: Option<&str>,
        payload: Option<serde_json::Value>,
    ) -> Result<u64, StoreError>;
    fn record_ok(&self, signal_id: Uuid, phase: ValidationPhase) -> Result<u64, StoreError>;
    fn record_failed(
        &self,
        signal_id: Uuid,
        phase: ValidationPhase,
        code: RejectCode,
        message: &str,
        details: &BTreeMap<String, serde_json::Value>,
    ) -> Result<u64, StoreError>;
    fn record_accepted(&self, signal_id: Uuid) -> Result<u64, StoreError>;
    fn events_for(&self, signal_id: Uuid) -> Result<Vec<SignalEvent>, StoreError>;
}

pub struct RedbEventLog {
    store: Arc<RedbStore>,
    time: Arc<dyn TimeProvider>,
}

impl RedbEventLog {
    pub fn new(store: Arc<RedbStore>, time: Arc<dyn TimeProvider>) -> Self {
        Self { store, time }
    }

    fn append(&self, mut event: SignalEvent) -> Result<u64, StoreError> {
        let txn = self.store.begin_write()?;
        let seq = {
            let mut table = txn.open_table(EVENTS_TABLE)?;
            let last = table.last()?.map(|(k, _)| k.value()).unwrap_or(0);
            let seq = last + 1;
            event.seq = seq;
            table.insert(seq, serde_json::to_vec(&event)?)?;
            seq
        };
        txn.commit()?;
        debug!(seq, signal_id = %event.signal_id, event_type = ?event.event_type, "event appended");
        Ok(seq)
    }
}

impl EventLog for RedbEventLog {
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
        let txn = self.store.begin_read()?;
        let table = match txn.open_table(EVENTS_TABLE) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut events = Vec::new();
        for res in table.range(0..)? {
            let (_, v) = res?;
            let event: SignalEvent = serde_json::from_slice(&v.value())?;
            if event.signal_id == signal_id {
                events.push(event);
            }
        }
        Ok(events)
    }
}
