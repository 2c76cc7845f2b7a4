use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::outcome::{rejections, RejectCode, Rejection, StepResult, ValidationPhase};
use crate::persistence::balance_store::{BalanceStore, BucketReservation, ReserveOutcome};
use crate::persistence::redb_store::StoreError;
use crate::pipeline::SignalContext;
use crate::plan::{BucketKey, ExecutionLegPlan, ExecutionPlan};
use crate::sizing::ExecutionSizer;

pub const RESERVE_REASON: &str = "SIGNAL_RESERVE";

#[derive(Debug)]
pub struct ReservationReport {
    pub result: StepResult,
    /// sized plan, present when funds were reserved
    pub plan: Option<ExecutionPlan>,
    pub scaled: bool,
    pub scale_ratio: Decimal,
    pub buckets: usize,
}

impl ReservationReport {
    fn failed(rejection: Rejection) -> Self {
        Self {
            result: StepResult::fail(rejection),
            plan: None,
            scaled: false,
            scale_ratio: Decimal::ZERO,
            buckets: 0,
        }
    }
}

/// Balance gate: aggregates required spend per (account, currency) bucket,
/// sizes the signal to what the buckets can fund, then reserves the sized
/// spends — every bucket or none. Reservation is idempotent per signal, so a
/// redelivered message can never debit twice.
pub struct BalanceReservation {
    balances: Arc<dyn BalanceStore>,
}

impl BalanceReservation {
    pub fn new(balances: Arc<dyn BalanceStore>) -> Self {
        Self { balances }
    }

    /// `Err` is an infrastructure fault (store down); callers map it to a
    /// retry. Business outcomes, including insufficient funds, come back in
    /// the report.
    pub fn reserve_for_signal(
        &self,
        ctx: &SignalContext,
    ) -> Result<ReservationReport, StoreError> {
        let now = ctx.now;
        let signal_id = ctx.dto.external_id().unwrap_or("n/a");
        let legs = &ctx.resolved_legs;

        if legs.len() != 2 {
            warn!(signal_id = %signal_id, legs = legs.len(), "balance guard: resolved legs missing");
            return Ok(ReservationReport::failed(
                Rejection::new(
                    RejectCode::InvalidInput,
                    "Resolved legs missing or invalid",
                    ValidationPhase::Balance,
                    "BalanceReservation",
                    now,
                )
                .with_detail("legs", legs.len()),
            ));
        }

        // Requested spend per bucket; BTreeMap keeps reservation order stable
        // across retries.
        let mut requested: BTreeMap<(u64, u64), Decimal> = BTreeMap::new();
        for leg in legs {
            let key = leg.spend_bucket();
            *requested
                .entry((key.account_id, key.currency_id))
                .or_default() += leg.required_spend;
        }
        let bucket_keys: Vec<BucketKey> = requested
            .keys()
            .map(|(account, currency)| BucketKey::new(*account, *currency))
            .collect();

        let available = self.balances.find_available(&bucket_keys)?;
        let sizing = ExecutionSizer::size_for_balances(legs, &available);

        if sizing.scale_ratio <= Decimal::ZERO {
            warn!(signal_id = %signal_id, "balance insufficient: alpha <= 0");
            return Ok(ReservationReport::failed(
                Rejection::new(
                    RejectCode::InsufficientFunds,
                    "No executable size from balances",
                    ValidationPhase::Balance,
                    "BalanceReservation",
                    now,
                )
                .with_detail("signal_id", signal_id)
                .with_detail("alpha", sizing.scale_ratio),
            ));
        }

        // Sized plan and the spends actually reserved (recomputed from the
        // sized quantities so a scaled signal never reserves more than it
        // can trade).
        let plan_legs: Vec<ExecutionLegPlan> = legs
            .iter()
            .zip(&sizing.exec_qty)
            .map(|(leg, exec_qty)| ExecutionLegPlan::from_resolved(leg, *exec_qty))
            .collect();

        let mut sized_spend: BTreeMap<(u64, u64), Decimal> = BTreeMap::new();
        for (leg, exec_qty) in legs.iter().zip(&sizing.exec_qty) {
            let key = leg.spend_bucket();
            *sized_spend
                .entry((key.account_id, key.currency_id))
                .or_default() += leg.spend_for_qty(*exec_qty);
        }
        let reservations: Vec<BucketReservation> = sized_spend
            .iter()
            .map(|((account, currency), amount)| BucketReservation {
                key: BucketKey::new(*account, *currency),
                amount: *amount,
            })
            .collect();

        let expires_at_ms = lock_expiry_ms(ctx);
        let outcome = self.balances.try_reserve(
            ctx.saved_signal_id,
            RESERVE_REASON,
            &reservations,
            expires_at_ms,
        )?;

        match outcome {
            ReserveOutcome::Reserved => {
                if sizing.scaled {
                    info!(
                        signal_id = %signal_id, alpha = %sizing.scale_ratio,
                        "balance scaled: legs sized down to fit available funds"
                    );
                } else {
                    info!(
                        signal_id = %signal_id, legs = legs.len(), buckets = reservations.len(),
                        "balance & reservation passed"
                    );
                }
                Ok(ReservationReport {
                    result: StepResult::ok(),
                    plan: Some(ExecutionPlan { legs: plan_legs }),
                    scaled: sizing.scaled,
                    scale_ratio: sizing.scale_ratio,
                    buckets: reservations.len(),
                })
            }
            ReserveOutcome::Insufficient {
                key,
                required,
                available,
            } => {
                warn!(
                    signal_id = %signal_id, account_id = key.account_id,
                    currency_id = key.currency_id, %required, %available,
                    "balance reservation rejected"
                );
                Ok(ReservationReport::failed(rejections::insufficient_funds(
                    now,
                    "BalanceReservation",
                    key.account_id,
                    key.currency_id,
                    required,
                    available,
                )))
            }
        }
    }
}

/// Locks expire with the signal itself: producer timestamp + ttl, falling
/// back to now + ttl when the producer timestamp is absent.
fn lock_expiry_ms(ctx: &SignalContext) -> i64 {
    let meta = ctx.dto.meta.as_ref();
    let base = meta
        .and_then(|m| m.created_at)
        .map(|t| t.timestamp_millis())
        .unwrap_or_else(|| ctx.now.timestamp_millis());
    let ttl = meta.and_then(|m| m.ttl_ms).unwrap_or(0);
    base + ttl
}
