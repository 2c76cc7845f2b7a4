use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::persistence::redb_store::StoreError;
use crate::persistence::reference::{
    Exchange, ExchangeAccount, ExchangeStatus, Pair, PairRule, ReferenceStore,
};

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("{kind} not found: {value}")]
    NotFound { kind: &'static str, value: String },
    #[error("exchange is disabled: {0}")]
    Inactive(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Read-through cache over the reference store. Reference rows change only
/// through the upsert methods below, which invalidate the affected entries;
/// there is no TTL.
pub struct ExchangeDirectory {
    store: Arc<dyn ReferenceStore>,
    exchanges: DashMap<String, Exchange>,
    primary_accounts: DashMap<u64, ExchangeAccount>,
    pairs: DashMap<String, Pair>,
}

impl ExchangeDirectory {
    pub fn new(store: Arc<dyn ReferenceStore>) -> Self {
        Self {
            store,
            exchanges: DashMap::new(),
            primary_accounts: DashMap::new(),
            pairs: DashMap::new(),
        }
    }

    pub fn require_exchange(&self, name: &str) -> Result<Exchange, DirectoryError> {
        let key = name.to_lowercase();
        let exchange = match self.exchanges.get(&key) {
            Some(cached) => cached.clone(),
            None => {
                let loaded =
                    self.store
                        .exchange_by_name(name)?
                        .ok_or_else(|| DirectoryError::NotFound {
                            kind: "exchange",
                            value: name.to_string(),
                        })?;
                debug!(exchange = %loaded.name, "directory cache fill");
                self.exchanges.insert(key, loaded.clone());
                loaded
            }
        };
        if exchange.status == ExchangeStatus::Inactive {
            return Err(DirectoryError::Inactive(exchange.name));
        }
        Ok(exchange)
    }

    /// Resolve an account by exchange and label. Labels beyond the primary
    /// account are not modeled yet, so every label resolves to the primary
    /// account of the exchange.
    pub fn require_account(
        &self,
        exchange_name: &str,
        _label: &str,
    ) -> Result<ExchangeAccount, DirectoryError> {
        let exchange = self.require_exchange(exchange_name)?;
        self.require_primary_account(&exchange)
    }

    pub fn require_primary_account(
        &self,
        exchange: &Exchange,
    ) -> Result<ExchangeAccount, DirectoryError> {
        if let Some(cached) = self.primary_accounts.get(&exchange.id) {
            return Ok(cached.clone());
        }
        let account =
            self.store
                .primary_account(exchange.id)?
                .ok_or_else(|| DirectoryError::NotFound {
                    kind: "primary account",
                    value: exchange.name.clone(),
                })?;
        self.primary_accounts.insert(exchange.id, account.clone());
        Ok(account)
    }

    pub fn require_pair(&self, symbol: &str) -> Result<Pair, DirectoryError> {
        let key = symbol.to_lowercase();
        if let Some(cached) = self.pairs.get(&key) {
            return Ok(cached.clone());
        }
        let pair = self
            .store
            .pair_by_symbol(symbol)?
            .ok_or_else(|| DirectoryError::NotFound {
                kind: "pair",
                value: symbol.to_string(),
            })?;
        self.pairs.insert(key, pair.clone());
        Ok(pair)
    }

    /// Rules are consulted once per signal in the market phase; no cache.
    pub fn pair_rule(
        &self,
        exchange_id: u64,
        pair_id: u64,
    ) -> Result<Option<PairRule>, DirectoryError> {
        Ok(self.store.pair_rule(exchange_id, pair_id)?)
    }

    // Writes go through the directory so the cache never serves a row the
    // store no longer holds.

    pub fn upsert_exchange(&self, exchange: &Exchange) -> Result<(), DirectoryError> {
        self.store.upsert_exchange(exchange)?;
        self.exchanges.remove(&exchange.name.to_lowercase());
        self.primary_accounts.remove(&exchange.id);
        Ok(())
    }

    pub fn upsert_account(&self, account: &ExchangeAccount) -> Result<(), DirectoryError> {
        self.store.upsert_account(account)?;
        self.primary_accounts.remove(&account.exchange_id);
        Ok(())
    }

    pub fn upsert_pair(&self, pair: &Pair) -> Result<(), DirectoryError> {
        self.store.upsert_pair(pair)?;
        self.pairs.remove(&pair.symbol.to_lowercase());
        Ok(())
    }

    pub fn clear_cache(&self) {
        self.exchanges.clear();
        self.primary_accounts.clear();
        self.pairs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::memory::MemoryReferenceStore;

    fn seeded_directory() -> ExchangeDirectory {
        let store = Arc::new(MemoryReferenceStore::new());
        store
            .upsert_exchange(&Exchange {
                id: 1,
                name: "AlphaX".to_string(),
                status: ExchangeStatus::Active,
            })
            .unwrap();
        store
            .upsert_account(&ExchangeAccount {
                id: 11,
                exchange_id: 1,
                label: "main".to_string(),
                is_primary: true,
            })
            .unwrap();
        ExchangeDirectory::new(store)
    }

    #[test]
    fn lookup_is_case_insensitive_and_cached() {
        let directory = seeded_directory();
        let a = directory.require_exchange("alphax").unwrap();
        let b = directory.require_exchange("ALPHAX").unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn unknown_exchange_is_not_found() {
        let directory = seeded_directory();
        let err = directory.require_exchange("ghost").unwrap_err();
        assert!(matches!(err, DirectoryError::NotFound { .. }));
    }

    #[test]
    fn inactive_exchange_is_rejected() {
        let directory = seeded_directory();
        directory
            .upsert_exchange(&Exchange {
                id: 1,
                name: "AlphaX".to_string(),
                status: ExchangeStatus::Inactive,
            })
            .unwrap();
        let err = directory.require_exchange("alphax").unwrap_err();
        assert!(matches!(err, DirectoryError::Inactive(_)));
    }

    #[test]
    fn upsert_invalidates_cached_entry() {
        let directory = seeded_directory();
        let ex = directory.require_exchange("alphax").unwrap();
        let account = directory.require_primary_account(&ex).unwrap();
        assert_eq!(account.id, 11);

        directory
            .upsert_account(&ExchangeAccount {
                id: 11,
                exchange_id: 1,
                label: "main".to_string(),
                is_primary: false,
            })
            .unwrap();
        directory
            .upsert_account(&ExchangeAccount {
                id: 12,
                exchange_id: 1,
                label: "backup".to_string(),
                is_primary: true,
            })
            .unwrap();
        let account = directory.require_primary_account(&ex).unwrap();
        assert_eq!(account.id, 12);
    }
}
