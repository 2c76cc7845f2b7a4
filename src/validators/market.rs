use rust_decimal::{Decimal, RoundingStrategy};
use std::sync::Arc;
use tracing::{info, warn};

use crate::directory::{DirectoryError, ExchangeDirectory};
use crate::model::Side;
use crate::outcome::{RejectCode, Rejection, StepResult, ValidationPhase};
use crate::persistence::redb_store::StoreError;
use crate::pipeline::SignalContext;
use crate::plan::{ExecutionLegPlan, ExecutionPlan};

/// Snap a price down to the venue tick grid. Prices at or below zero and
/// missing ticks pass through untouched.
pub fn quantize_down(price: Decimal, tick: Option<Decimal>) -> Decimal {
    quantize(price, tick, RoundingStrategy::ToZero)
}

/// Snap a price up to the venue tick grid.
pub fn quantize_up(price: Decimal, tick: Option<Decimal>) -> Decimal {
    quantize(price, tick, RoundingStrategy::AwayFromZero)
}

fn quantize(price: Decimal, tick: Option<Decimal>, strategy: RoundingStrategy) -> Decimal {
    let Some(tick) = tick.filter(|t| *t > Decimal::ZERO) else {
        return price;
    };
    if price <= Decimal::ZERO {
        return price;
    }
    let steps = (price / tick).round_dp_with_strategy(0, strategy);
    steps * tick
}

#[derive(Debug)]
pub struct MarketReport {
    pub result: StepResult,
    /// plan with guarded prices, present when the gate passed
    pub plan: Option<ExecutionPlan>,
}

/// Venue-rule gate: tick alignment (up for BUY, down for SELL — never price
/// a leg more aggressively than requested), min notional and size ceiling
/// against the sized quantity.
pub struct MarketRules {
    directory: Arc<ExchangeDirectory>,
}

impl MarketRules {
    pub fn new(directory: Arc<ExchangeDirectory>) -> Self {
        Self { directory }
    }

    pub fn apply(&self, ctx: &SignalContext, plan: &ExecutionPlan) -> Result<MarketReport, StoreError> {
        let signal_id = ctx.dto.external_id().unwrap_or("n/a");
        let now = ctx.now;

        let mut guarded_legs = Vec::with_capacity(plan.legs.len());
        for leg in &plan.legs {
            let rule = match self.directory.pair_rule(leg.exchange_id, leg.pair_id) {
                Ok(rule) => rule,
                Err(DirectoryError::Store(e)) => return Err(e),
                Err(_) => None,
            };
            let tick = rule.as_ref().and_then(|r| r.tick_size);

            let guarded = match leg.side {
                Side::Buy => quantize_up(leg.price, tick),
                Side::Sell => quantize_down(leg.price, tick),
            };
            if guarded <= Decimal::ZERO {
                warn!(signal_id = %signal_id, leg_index = leg.index, price = %leg.price,
                    "market price invalid after quantization");
                return Ok(MarketReport {
                    result: StepResult::fail(
                        Rejection::new(
                            RejectCode::MarketRuleViolation,
                            "Invalid price after quantization",
                            ValidationPhase::Market,
                            "MarketRules",
                            now,
                        )
                        .with_leg(leg.index)
                        .with_detail("input_price", leg.price)
                        .with_detail("tick", tick),
                    ),
                    plan: None,
                });
            }

            if let Some(min_notional) = rule.as_ref().and_then(|r| r.min_notional) {
                let notional = leg.exec_qty * guarded;
                if notional < min_notional {
                    warn!(signal_id = %signal_id, leg_index = leg.index, %notional,
                        %min_notional, "market min notional fail");
                    return Ok(MarketReport {
                        result: StepResult::fail(
                            Rejection::new(
                                RejectCode::MinNotional,
                                "Order notional below venue minimum",
                                ValidationPhase::Market,
                                "MarketRules",
                                now,
                            )
                            .with_leg(leg.index)
                            .with_detail("notional", notional)
                            .with_detail("min_notional", min_notional),
                        ),
                        plan: None,
                    });
                }
            }

            if let Some(max_order_size) = rule.as_ref().and_then(|r| r.max_order_size) {
                if leg.exec_qty > max_order_size {
                    warn!(signal_id = %signal_id, leg_index = leg.index, qty = %leg.exec_qty,
                        %max_order_size, "market size ceiling fail");
                    return Ok(MarketReport {
                        result: StepResult::fail(
                            Rejection::new(
                                RejectCode::SizeCeiling,
                                "Order size above venue ceiling",
                                ValidationPhase::Market,
                                "MarketRules",
                                now,
                            )
                            .with_leg(leg.index)
                            .with_detail("qty", leg.exec_qty)
                            .with_detail("max_order_size", max_order_size),
                        ),
                        plan: None,
                    });
                }
            }

            guarded_legs.push(ExecutionLegPlan {
                price: guarded,
                ..leg.clone()
            });
        }

        info!(signal_id = %signal_id, legs = guarded_legs.len(), "price guard ok");
        Ok(MarketReport {
            result: StepResult::ok(),
            plan: Some(ExecutionPlan { legs: guarded_legs }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn quantize_down_snaps_to_grid() {
        assert_eq!(quantize_down(dec!(10.07), Some(dec!(0.05))), dec!(10.05));
        assert_eq!(quantize_down(dec!(10.05), Some(dec!(0.05))), dec!(10.05));
    }

    #[test]
    fn quantize_up_snaps_to_grid() {
        assert_eq!(quantize_up(dec!(10.07), Some(dec!(0.05))), dec!(10.10));
        assert_eq!(quantize_up(dec!(10.10), Some(dec!(0.05))), dec!(10.10));
    }

    #[test]
    fn missing_tick_passes_price_through() {
        assert_eq!(quantize_down(dec!(10.07), None), dec!(10.07));
        assert_eq!(quantize_up(dec!(10.07), Some(dec!(0))), dec!(10.07));
    }
}
