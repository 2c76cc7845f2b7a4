use redb::{ReadableTable, TableDefinition};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::persistence::balance_store::{BalanceSnapshot, BalanceStore};
use crate::persistence::redb_store::{RedbStore, StoreError};

const EXCHANGES_TABLE: TableDefinition<u64, Vec<u8>> = TableDefinition::new("exchanges");
const EXCHANGES_BY_NAME_TABLE: TableDefinition<&str, u64> =
    TableDefinition::new("exchanges_by_name");
const ACCOUNTS_TABLE: TableDefinition<u64, Vec<u8>> = TableDefinition::new("exchange_accounts");
const CURRENCIES_TABLE: TableDefinition<u64, Vec<u8>> = TableDefinition::new("currencies");
const PAIRS_TABLE: TableDefinition<u64, Vec<u8>> = TableDefinition::new("pairs");
const PAIRS_BY_SYMBOL_TABLE: TableDefinition<&str, u64> = TableDefinition::new("pairs_by_symbol");
const PAIR_RULES_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("pair_rules");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExchangeStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exchange {
    pub id: u64,
    pub name: String,
    pub status: ExchangeStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeAccount {
    pub id: u64,
    pub exchange_id: u64,
    pub label: String,
    pub is_primary: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Currency {
    pub id: u64,
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pair {
    pub id: u64,
    pub symbol: String,
    pub base_currency_id: u64,
    pub quote_currency_id: u64,
}

/// Per (exchange, pair) trading constraints used by the market-rules gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairRule {
    pub exchange_id: u64,
    pub pair_id: u64,
    #[serde(default)]
    pub tick_size: Option<Decimal>,
    #[serde(default)]
    pub step_size: Option<Decimal>,
    #[serde(default)]
    pub min_notional: Option<Decimal>,
    #[serde(default)]
    pub max_order_size: Option<Decimal>,
}

pub trait ReferenceStore: Send + Sync {
    /// Name lookup is case-insensitive.
    fn exchange_by_name(&self, name: &str) -> Result<Option<Exchange>, StoreError>;
    fn pair_by_symbol(&self, symbol: &str) -> Result<Option<Pair>, StoreError>;
    fn primary_account(&self, exchange_id: u64) -> Result<Option<ExchangeAccount>, StoreError>;
    fn pair_rule(&self, exchange_id: u64, pair_id: u64) -> Result<Option<PairRule>, StoreError>;

    fn upsert_exchange(&self, exchange: &Exchange) -> Result<(), StoreError>;
    fn upsert_account(&self, account: &ExchangeAccount) -> Result<(), StoreError>;
    fn upsert_currency(&self, currency: &Currency) -> Result<(), StoreError>;
    fn upsert_pair(&self, pair: &Pair) -> Result<(), StoreError>;
    fn upsert_pair_rule(&self, rule: &PairRule) -> Result<(), StoreError>;
}

fn rule_key(exchange_id: u64, pair_id: u64) -> String {
    format!("{exchange_id}:{pair_id}")
}

pub struct RedbReferenceStore {
    store: Arc<RedbStore>,
}

impl RedbReferenceStore {
    pub fn new(store: Arc<RedbStore>) -> Self {
        Self { store }
    }
}

impl ReferenceStore for RedbReferenceStore {
    fn exchange_by_name(&self, name: &str) -> Result<Option<Exchange>, StoreError> {
        let txn = self.store.begin_read()?;
        let index = match txn.open_table(EXCHANGES_BY_NAME_TABLE) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let id = match index.get(name.to_lowercase().as_str())? {
            Some(v) => v.value(),
            None => return Ok(None),
        };
        let table = txn.open_table(EXCHANGES_TABLE)?;
        let row = table
            .get(id)?
            .map(|v| serde_json::from_slice::<Exchange>(&v.value()))
            .transpose()?;
        Ok(row)
    }

    fn pair_by_symbol(&self, symbol: &str) -> Result<Option<Pair>, StoreError> {
        let txn = self.store.begin_read()?;
        let index = match txn.open_table(PAIRS_BY_SYMBOL_TABLE) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let id = match index.get(symbol.to_lowercase().as_str())? {
            Some(v) => v.value(),
            None => return Ok(None),
        };
        let table = txn.open_table(PAIRS_TABLE)?;
        let row = table
            .get(id)?
            .map(|v| serde_json::from_slice::<Pair>(&v.value()))
            .transpose()?;
        Ok(row)
    }

    fn primary_account(&self, exchange_id: u64) -> Result<Option<ExchangeAccount>, StoreError> {
        let txn = self.store.begin_read()?;
        let table = match txn.open_table(ACCOUNTS_TABLE) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        // Account counts are tiny; a scan beats maintaining another index.
        for res in table.range(0..)? {
            let (_, v) = res?;
            let account: ExchangeAccount = serde_json::from_slice(&v.value())?;
            if account.exchange_id == exchange_id && account.is_primary {
                return Ok(Some(account));
            }
        }
        Ok(None)
    }

    fn pair_rule(&self, exchange_id: u64, pair_id: u64) -> Result<Option<PairRule>, StoreError> {
        let txn = self.store.begin_read()?;
        let table = match txn.open_table(PAIR_RULES_TABLE) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let row = table
            .get(rule_key(exchange_id, pair_id).as_str())?
            .map(|v| serde_json::from_slice::<PairRule>(&v.value()))
            .transpose()?;
        Ok(row)
    }

    fn upsert_exchange(&self, exchange: &Exchange) -> Result<(), StoreError> {
        let txn = self.store.begin_write()?;
        {
            let mut table = txn.open_table(EXCHANGES_TABLE)?;
            table.insert(exchange.id, serde_json::to_vec(exchange)?)?;
            let mut index = txn.open_table(EXCHANGES_BY_NAME_TABLE)?;
            index.insert(exchange.name.to_lowercase().as_str(), exchange.id)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn upsert_account(&self, account: &ExchangeAccount) -> Result<(), StoreError> {
        let txn = self.store.begin_write()?;
        {
            let mut table = txn.open_table(ACCOUNTS_TABLE)?;
            table.insert(account.id, serde_json::to_vec(account)?)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn upsert_currency(&self, currency: &Currency) -> Result<(), StoreError> {
        let txn = self.store.begin_write()?;
        {
            let mut table = txn.open_table(CURRENCIES_TABLE)?;
            table.insert(currency.id, serde_json::to_vec(currency)?)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn upsert_pair(&self, pair: &Pair) -> Result<(), StoreError> {
        let txn = self.store.begin_write()?;
        {
            let mut table = txn.open_table(PAIRS_TABLE)?;
            table.insert(pair.id, serde_json::to_vec(pair)?)?;
            let mut index = txn.open_table(PAIRS_BY_SYMBOL_TABLE)?;
            index.insert(pair.symbol.to_lowercase().as_str(), pair.id)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn upsert_pair_rule(&self, rule: &PairRule) -> Result<(), StoreError> {
        let txn = self.store.begin_write()?;
        {
            let mut table = txn.open_table(PAIR_RULES_TABLE)?;
            table.insert(
                rule_key(rule.exchange_id, rule.pair_id).as_str(),
                serde_json::to_vec(rule)?,
            )?;
        }
        txn.commit()?;
        Ok(())
    }
}

/// Boot-time reference data, loaded from a JSON file and applied idempotently.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReferenceSeed {
    #[serde(default)]
    pub currencies: Vec<Currency>,
    #[serde(default)]
    pub exchanges: Vec<Exchange>,
    #[serde(default)]
    pub accounts: Vec<ExchangeAccount>,
    #[serde(default)]
    pub pairs: Vec<Pair>,
    #[serde(default)]
    pub rules: Vec<PairRule>,
    #[serde(default)]
    pub balances: Vec<BalanceSnapshot>,
}

impl ReferenceSeed {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let raw = std::fs::read(path)
            .map_err(|e| StoreError::Integrity(format!("seed file unreadable: {e}")))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn apply(
        &self,
        reference: &dyn ReferenceStore,
        balances: &dyn BalanceStore,
    ) -> Result<(), StoreError> {
        for currency in &self.currencies {
            reference.upsert_currency(currency)?;
        }
        for exchange in &self.exchanges {
            reference.upsert_exchange(exchange)?;
        }
        for account in &self.accounts {
            reference.upsert_account(account)?;
        }
        for pair in &self.pairs {
            reference.upsert_pair(pair)?;
        }
        for rule in &self.rules {
            reference.upsert_pair_rule(rule)?;
        }
        for balance in &self.balances {
            balances.upsert(balance.clone())?;
        }
        info!(
            exchanges = self.exchanges.len(),
            pairs = self.pairs.len(),
            balances = self.balances.len(),
            "reference data seeded"
        );
        Ok(())
    }
}
