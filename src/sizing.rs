use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::HashMap;
use tracing::debug;

use crate::plan::{BucketKey, ResolvedLeg, SizingResult};

/// Internal quantity scale before any market-specific quantization.
const QTY_SCALE: u32 = 18;

/// Pure sizing logic: compute a single alpha in [0,1] from bucket
/// availabilities, then apply it to all legs' requested base quantities.
/// Rounding is toward zero so a sized plan can never overspend.
///
/// This is the single authority for "how much can we actually trade";
/// no other component computes quantities on its own.
pub struct ExecutionSizer;

impl ExecutionSizer {
    pub fn size_for_balances(
        legs: &[ResolvedLeg],
        available_by_bucket: &HashMap<BucketKey, Decimal>,
    ) -> SizingResult {
        if legs.is_empty() {
            return SizingResult {
                scaled: false,
                scale_ratio: Decimal::ZERO,
                exec_qty: Vec::new(),
            };
        }

        // 1) Aggregate required spend per bucket (BUY: quote, SELL: base units)
        let mut required_by_bucket: HashMap<BucketKey, Decimal> = HashMap::new();
        for leg in legs {
            *required_by_bucket.entry(leg.spend_bucket()).or_default() += leg.required_spend;
        }

        // 2) alpha = min over buckets of (available / required)
        let mut alpha = Decimal::ONE;
        for (key, required) in &required_by_bucket {
            if *required <= Decimal::ZERO {
                continue;
            }
            let available = available_by_bucket
                .get(key)
                .copied()
                .unwrap_or(Decimal::ZERO);
            let ratio = if available <= Decimal::ZERO {
                Decimal::ZERO
            } else {
                available.checked_div(*required).unwrap_or(Decimal::ZERO)
            };
            if ratio < alpha {
                alpha = ratio;
            }
            if alpha.is_zero() {
                break;
            }
        }

        // 3) Clamp to [0, 1]
        alpha = alpha.clamp(Decimal::ZERO, Decimal::ONE);

        // 4) Per-leg exec qty = req qty * alpha, rounded toward zero
        let exec_qty: Vec<Decimal> = legs
            .iter()
            .map(|leg| {
                if leg.qty <= Decimal::ZERO {
                    Decimal::ZERO
                } else {
                    (leg.qty * alpha).round_dp_with_strategy(QTY_SCALE, RoundingStrategy::ToZero)
                }
            })
            .collect();

        let scaled = alpha < Decimal::ONE;
        debug!(alpha = %alpha, scaled, legs = legs.len(), "sizing computed");

        SizingResult {
            scaled,
            scale_ratio: alpha,
            exec_qty,
        }
    }
}
