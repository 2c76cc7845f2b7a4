use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};

use crate::directory::{DirectoryError, ExchangeDirectory};
use crate::model::{Side, SignalMeta};
use crate::outcome::{RejectCode, Rejection, StepResult, ValidationPhase};
use crate::persistence::redb_store::StoreError;
use crate::pipeline::SignalContext;
use crate::plan::ResolvedLeg;

/// Meta-field gate: presence and value checks only, no lookups.
/// First violation wins.
pub struct MetaIntegrity;

impl MetaIntegrity {
    pub fn validate(meta: Option<&SignalMeta>, now: DateTime<Utc>) -> StepResult {
        let Some(meta) = meta else {
            warn!("integrity failed: missing meta");
            return StepResult::fail(Rejection::new(
                RejectCode::IntegrityMissingMeta,
                "Missing meta",
                ValidationPhase::Integrity,
                "MetaIntegrity",
                now,
            ));
        };
        if is_blank(meta.signal_id.as_deref()) {
            return fail("Missing meta.signalId", RejectCode::IntegrityMissingField, now);
        }
        if meta.created_at.is_none() {
            return fail("Missing meta.createdAt", RejectCode::IntegrityMissingField, now);
        }
        if meta.ttl_ms.is_none_or(|ttl| ttl <= 0) {
            return fail(
                "Missing/invalid meta.ttlMs",
                RejectCode::IntegrityInvalidValue,
                now,
            );
        }
        if is_blank(meta.pair.as_deref()) {
            return fail("Missing meta.pair", RejectCode::IntegrityMissingField, now);
        }
        if meta.max_latency_ms.is_some_and(|v| v <= 0) {
            return fail(
                "Invalid meta.maxLatencyMs",
                RejectCode::IntegrityInvalidValue,
                now,
            );
        }

        info!(signal_id = ?meta.signal_id, pair = ?meta.pair, "meta integrity ok");
        StepResult::ok()
    }
}

fn fail(msg: &str, code: RejectCode, now: DateTime<Utc>) -> StepResult {
    warn!("integrity failed: {msg}");
    StepResult::fail(Rejection::new(
        code,
        msg,
        ValidationPhase::Integrity,
        "MetaIntegrity",
        now,
    ))
}

fn is_blank(s: Option<&str>) -> bool {
    s.is_none_or(|s| s.trim().is_empty())
}

/// Per-leg gate: validates raw fields, then resolves every reference
/// (exchange, pair, primary account, currencies) exactly once and writes the
/// canonical legs onto the context. Resolution is all-or-nothing; a failing
/// leg leaves `resolved_legs` empty.
pub struct OrdersIntegrity {
    directory: Arc<ExchangeDirectory>,
}

impl OrdersIntegrity {
    pub fn new(directory: Arc<ExchangeDirectory>) -> Self {
        Self { directory }
    }

    /// Infrastructure failures (store unavailable) bubble as `Err` so the
    /// orchestrator can leave the message for redelivery; everything else is
    /// a terminal `StepResult::fail`.
    pub fn validate_and_resolve(&self, ctx: &mut SignalContext) -> Result<StepResult, StoreError> {
        let orders = &ctx.dto.orders;
        let signal_id = ctx.dto.external_id().unwrap_or("n/a").to_string();
        let now = ctx.now;

        if orders.len() != 2 {
            return Ok(leg_fail(
                "Leg count must be exactly 2",
                RejectCode::InvalidInput,
                &signal_id,
                None,
                now,
            ));
        }

        let mut resolved = Vec::with_capacity(orders.len());
        for (i, leg) in orders.iter().enumerate() {
            if is_blank(leg.exchange_name.as_deref()) {
                return Ok(leg_fail(
                    "Missing exchangeName",
                    RejectCode::IntegrityMissingField,
                    &signal_id,
                    Some(i),
                    now,
                ));
            }
            if is_blank(leg.pair_name.as_deref()) {
                return Ok(leg_fail(
                    "Missing pairName",
                    RejectCode::IntegrityMissingField,
                    &signal_id,
                    Some(i),
                    now,
                ));
            }
            let Some(side) = leg.side else {
                return Ok(leg_fail(
                    "Missing side",
                    RejectCode::IntegrityMissingField,
                    &signal_id,
                    Some(i),
                    now,
                ));
            };
            let price = leg.price_decimal();
            let Some(price) = price.filter(|p| *p > Decimal::ZERO) else {
                return Ok(leg_fail(
                    "Missing/invalid price",
                    RejectCode::IntegrityInvalidValue,
                    &signal_id,
                    Some(i),
                    now,
                ));
            };
            let Some(qty) = leg.base_qty().filter(|q| *q > Decimal::ZERO) else {
                return Ok(leg_fail(
                    "Missing/invalid base quantity",
                    RejectCode::IntegrityInvalidValue,
                    &signal_id,
                    Some(i),
                    now,
                ));
            };

            let exchange_name = leg.exchange_name.as_deref().unwrap_or_default();
            let pair_name = leg.pair_name.as_deref().unwrap_or_default();

            let exchange = match self.directory.require_exchange(exchange_name) {
                Ok(ex) => ex,
                Err(DirectoryError::Store(e)) => return Err(e),
                Err(e) => {
                    return Ok(reference_fail(&e.to_string(), &signal_id, i, now));
                }
            };
            let pair = match self.directory.require_pair(pair_name) {
                Ok(p) => p,
                Err(DirectoryError::Store(e)) => return Err(e),
                Err(e) => {
                    return Ok(reference_fail(&e.to_string(), &signal_id, i, now));
                }
            };
            let account = match self.directory.require_primary_account(&exchange) {
                Ok(a) => a,
                Err(DirectoryError::Store(e)) => return Err(e),
                Err(e) => {
                    return Ok(reference_fail(&e.to_string(), &signal_id, i, now));
                }
            };

            let (spend, receive) = match side {
                Side::Buy => (pair.quote_currency_id, pair.base_currency_id),
                Side::Sell => (pair.base_currency_id, pair.quote_currency_id),
            };
            let required_spend = match side {
                Side::Buy => qty * price,
                Side::Sell => qty,
            };

            resolved.push(ResolvedLeg {
                index: i,
                exchange_id: exchange.id,
                exchange_name: exchange.name,
                exchange_account_id: account.id,
                pair_id: pair.id,
                base_currency_id: pair.base_currency_id,
                quote_currency_id: pair.quote_currency_id,
                spend_currency_id: spend,
                receive_currency_id: receive,
                market_symbol: pair_name.to_string(),
                side,
                qty,
                price,
                required_spend,
            });
        }

        ctx.resolved_legs = resolved;
        info!(signal_id = %signal_id, legs = 2, "orders integrity+resolve ok");
        Ok(StepResult::ok())
    }
}

fn leg_fail(
    msg: &str,
    code: RejectCode,
    signal_id: &str,
    leg_index: Option<usize>,
    now: DateTime<Utc>,
) -> StepResult {
    warn!(signal_id = %signal_id, leg_index = ?leg_index, "integrity failed: {msg}");
    let mut rej = Rejection::new(code, msg, ValidationPhase::Integrity, "OrdersIntegrity", now)
        .with_detail("signal_id", signal_id);
    if let Some(i) = leg_index {
        rej = rej.with_leg(i);
    }
    StepResult::fail(rej)
}

fn reference_fail(msg: &str, signal_id: &str, leg_index: usize, now: DateTime<Utc>) -> StepResult {
    warn!(signal_id = %signal_id, leg_index, "integrity failed: {msg}");
    StepResult::fail(
        Rejection::new(
            RejectCode::ReferenceNotFound,
            msg,
            ValidationPhase::Integrity,
            "OrdersIntegrity",
            now,
        )
        .with_detail("signal_id", signal_id)
        .with_leg(leg_index),
    )
}
