use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::model::Side;

/// The unit of balance contention: one (account, currency) pair. Legs that
/// spend from the same bucket must have their required amounts summed before
/// any availability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketKey {
    pub account_id: u64,
    pub currency_id: u64,
}

impl BucketKey {
    pub fn new(account_id: u64, currency_id: u64) -> Self {
        Self {
            account_id,
            currency_id,
        }
    }
}

/// One leg after reference resolution. Immutable once computed; held on the
/// signal context for the rest of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedLeg {
    pub index: usize,
    pub exchange_id: u64,
    pub exchange_name: String,
    pub exchange_account_id: u64,
    pub pair_id: u64,
    pub base_currency_id: u64,
    pub quote_currency_id: u64,
    /// BUY -> quote, SELL -> base
    pub spend_currency_id: u64,
    /// BUY -> base, SELL -> quote
    pub receive_currency_id: u64,
    pub market_symbol: String,
    pub side: Side,
    /// base quantity
    pub qty: Decimal,
    pub price: Decimal,
    /// BUY: qty*price, SELL: qty
    pub required_spend: Decimal,
}

impl ResolvedLeg {
    pub fn spend_bucket(&self) -> BucketKey {
        BucketKey::new(self.exchange_account_id, self.spend_currency_id)
    }

    /// Spend for an executed quantity, in the spend currency's units.
    pub fn spend_for_qty(&self, qty: Decimal) -> Decimal {
        match self.side {
            Side::Buy => qty * self.price,
            Side::Sell => qty,
        }
    }
}

/// Output of the sizing pass.
#[derive(Debug, Clone)]
pub struct SizingResult {
    /// true when alpha < 1
    pub scaled: bool,
    /// alpha in [0, 1]
    pub scale_ratio: Decimal,
    /// per-leg executable quantity, same ordering as the input legs
    pub exec_qty: Vec<Decimal>,
}

/// Execution-ready leg: resolved identifiers plus the sized quantity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLegPlan {
    pub index: usize,
    pub exchange_id: u64,
    pub exchange_account_id: u64,
    pub pair_id: u64,
    pub base_currency_id: u64,
    pub quote_currency_id: u64,
    pub spend_currency_id: u64,
    pub receive_currency_id: u64,
    pub exchange_name: String,
    pub market_symbol: String,
    pub side: Side,
    /// requested base qty
    pub req_qty: Decimal,
    pub price: Decimal,
    pub required_spend: Decimal,
    /// sized base qty, <= req_qty
    pub exec_qty: Decimal,
}

impl ExecutionLegPlan {
    pub fn from_resolved(leg: &ResolvedLeg, exec_qty: Decimal) -> Self {
        Self {
            index: leg.index,
            exchange_id: leg.exchange_id,
            exchange_account_id: leg.exchange_account_id,
            pair_id: leg.pair_id,
            base_currency_id: leg.base_currency_id,
            quote_currency_id: leg.quote_currency_id,
            spend_currency_id: leg.spend_currency_id,
            receive_currency_id: leg.receive_currency_id,
            exchange_name: leg.exchange_name.clone(),
            market_symbol: leg.market_symbol.clone(),
            side: leg.side,
            req_qty: leg.qty,
            price: leg.price,
            required_spend: leg.required_spend,
            exec_qty,
        }
    }
}

/// The sized, reservation-confirmed view of a signal's legs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub legs: Vec<ExecutionLegPlan>,
}
