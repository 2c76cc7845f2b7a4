use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::context::EngineContext;
use crate::decision::Decision;
use crate::metrics;
use crate::model::{SignalStatus, TradeSignal};
use crate::outcome::{rejections, ProcessResult, ValidationPhase};
use crate::persistence::event_log::EventLog;
use crate::persistence::redb_store::StoreError;
use crate::persistence::signal_store::{SignalStore, StoredLeg, StoredSignal};
use crate::plan::ResolvedLeg;
use crate::reservation::BalanceReservation;
use crate::validators::freshness::FreshnessValidator;
use crate::validators::integrity::{MetaIntegrity, OrdersIntegrity};
use crate::validators::market::MarketRules;

/// Working state for one signal's trip through the pipeline. Built once
/// after persist; `resolved_legs` is written exactly once by integrity
/// resolution and read by every later phase. Never shared across signals.
pub struct SignalContext {
    pub dto: TradeSignal,
    /// pinned at context build so every phase sees the same instant
    pub now: DateTime<Utc>,
    pub saved_signal_id: Uuid,
    pub resolved_legs: Vec<ResolvedLeg>,
}

impl SignalContext {
    pub fn new(dto: TradeSignal, now: DateTime<Utc>, saved_signal_id: Uuid) -> Self {
        Self {
            dto,
            now,
            saved_signal_id,
            resolved_legs: Vec::new(),
        }
    }
}

/// The phase orchestrator. Phases run strictly in order; the first failing
/// phase short-circuits through the decision layer and later phases never
/// execute.
///
/// usage:
/// let pipeline = SignalPipeline::new(...deps...);
/// let result = pipeline.process(signal);
pub struct SignalPipeline {
    engine: EngineContext,
    signals: Arc<dyn SignalStore>,
    events: Arc<dyn EventLog>,
    orders_integrity: OrdersIntegrity,
    market_rules: MarketRules,
    reservation: BalanceReservation,
    decision: Decision,
}

impl SignalPipeline {
    pub fn new(
        engine: EngineContext,
        signals: Arc<dyn SignalStore>,
        events: Arc<dyn EventLog>,
        orders_integrity: OrdersIntegrity,
        market_rules: MarketRules,
        reservation: BalanceReservation,
        decision: Decision,
    ) -> Self {
        Self {
            engine,
            signals,
            events,
            orders_integrity,
            market_rules,
            reservation,
            decision,
        }
    }

    pub fn process(&self, dto: TradeSignal) -> ProcessResult {
        let started_ms = self.engine.time.now_millis();
        let result = self.run(dto);
        let elapsed_ms = self.engine.time.now_millis() - started_ms;
        metrics::observe_pipeline_latency(elapsed_ms as f64 / 1000.0);
        result
    }

    fn run(&self, dto: TradeSignal) -> ProcessResult {
        let now = self.engine.time.now();
        let external_id = dto.external_id().map(str::to_string);

        // --- Persist (idempotent) ---
        let signal_id = match self.persist(&dto) {
            Ok(id) => id,
            Err(e) if e.is_reference() => {
                // Unknown reference is a business decision, not a fault:
                // reject and ack so the producer is not retried forever.
                warn!(external_id = ?external_id, error = %e, "persist rejected");
                metrics::inc_rejected();
                return ProcessResult::rejected(
                    None,
                    vec![rejections::reference_not_found(
                        now,
                        "SignalStore",
                        ValidationPhase::Persist,
                        "signal",
                        &e.to_string(),
                    )],
                );
            }
            Err(e) => {
                error!(external_id = ?external_id, error = %e, "persist error (transient)");
                metrics::inc_retried();
                return ProcessResult::retry_transient(vec![rejections::internal_error(
                    now,
                    "SignalStore",
                    &e.to_string(),
                )]);
            }
        };

        let mut ctx = SignalContext::new(dto, now, signal_id);

        // --- Integrity: meta, then per-leg validation + resolution ---
        let step = MetaIntegrity::validate(ctx.dto.meta.as_ref(), ctx.now);
        if let Some(result) = self.decision.handle(&ctx, &step, ValidationPhase::Integrity) {
            return result;
        }
        let step = match self.orders_integrity.validate_and_resolve(&mut ctx) {
            Ok(step) => step,
            Err(e) => return self.transient(&ctx, ValidationPhase::Integrity, e),
        };
        if let Some(result) = self.decision.handle(&ctx, &step, ValidationPhase::Integrity) {
            return result;
        }
        self.record_ok(&ctx, ValidationPhase::Integrity);

        // --- Persist legs (resolved identifiers, audit-consistent) ---
        if let Err(e) = self.persist_legs(&ctx) {
            return self.transient(&ctx, ValidationPhase::Persist, e);
        }

        // --- Freshness ---
        let step = FreshnessValidator::validate(&ctx);
        if let Some(result) = self.decision.handle(&ctx, &step, ValidationPhase::Freshness) {
            return result;
        }
        self.record_ok(&ctx, ValidationPhase::Freshness);

        // --- Balance: sizing + all-or-nothing reservation ---
        let report = match self.reservation.reserve_for_signal(&ctx) {
            Ok(report) => report,
            Err(e) => return self.transient(&ctx, ValidationPhase::Balance, e),
        };
        if let Some(result) = self
            .decision
            .handle(&ctx, &report.result, ValidationPhase::Balance)
        {
            return result;
        }
        self.record_ok(&ctx, ValidationPhase::Balance);
        let plan = report.plan.unwrap_or_default();

        // --- Market rules (tick / notional / ceiling) ---
        let market = match self.market_rules.apply(&ctx, &plan) {
            Ok(market) => market,
            Err(e) => return self.transient(&ctx, ValidationPhase::Market, e),
        };
        if let Some(result) = self
            .decision
            .handle(&ctx, &market.result, ValidationPhase::Market)
        {
            return result;
        }
        self.record_ok(&ctx, ValidationPhase::Market);
        let plan = market.plan.unwrap_or(plan);

        // Status stays RECEIVED here; the execution layer owns the VALIDATED
        // transition once it picks the plan up.
        if let Err(e) = self.events.record_accepted(signal_id) {
            warn!(signal_id = %signal_id, error = %e, "event recording (ACCEPTED) failed");
        }
        info!(
            signal_id = %signal_id, external_id = ?ctx.dto.external_id(),
            alpha = %report.scale_ratio, scaled = report.scaled, legs = plan.legs.len(),
            "signal accepted"
        );
        metrics::inc_accepted();
        ProcessResult::accepted(signal_id)
            .with_meta("alpha", report.scale_ratio)
            .with_meta("scaled", report.scaled)
            .with_meta("buckets", report.buckets)
            .with_meta("plan", plan)
    }

    fn persist(&self, dto: &TradeSignal) -> Result<Uuid, StoreError> {
        let meta = dto.meta.as_ref();
        let row = StoredSignal {
            id: self.engine.id.new_id(),
            external_id: dto.external_id().map(str::to_string),
            ttl_ms: meta.and_then(|m| m.ttl_ms),
            status: SignalStatus::Received,
            source: dto.source.clone(),
            constraints: dto
                .constraints
                .as_ref()
                .and_then(|c| serde_json::to_string(c).ok()),
            expected_pnl: dto.expected_pnl.as_ref().and_then(|v| v.to_decimal()),
            producer_created_at: meta.and_then(|m| m.created_at),
        };
        let saved = self.signals.save(&row)?;
        if !saved.deduplicated {
            if let Err(e) = self.events.record_received(
                saved.id,
                row.external_id.as_deref(),
                serde_json::to_value(dto).ok(),
            ) {
                warn!(signal_id = %saved.id, error = %e, "event recording (RECEIVED) failed");
            }
        }
        Ok(saved.id)
    }

    fn persist_legs(&self, ctx: &SignalContext) -> Result<(), StoreError> {
        let legs: Vec<StoredLeg> = ctx
            .resolved_legs
            .iter()
            .map(|leg| StoredLeg {
                signal_id: ctx.saved_signal_id,
                index: leg.index,
                exchange_id: leg.exchange_id,
                exchange_account_id: leg.exchange_account_id,
                pair_id: leg.pair_id,
                spend_currency_id: leg.spend_currency_id,
                receive_currency_id: leg.receive_currency_id,
                side: leg.side,
                price: leg.price,
                qty: leg.qty,
                required_spend: leg.required_spend,
                time_in_force: ctx
                    .dto
                    .orders
                    .get(leg.index)
                    .map(|o| o.tif_or_default())
                    .unwrap_or_default(),
            })
            .collect();
        self.signals.save_legs(ctx.saved_signal_id, &legs)?;
        info!(signal_id = %ctx.saved_signal_id, count = legs.len(), "legs persisted");
        Ok(())
    }

    fn record_ok(&self, ctx: &SignalContext, phase: ValidationPhase) {
        if let Err(e) = self.events.record_ok(ctx.saved_signal_id, phase) {
            warn!(signal_id = %ctx.saved_signal_id, phase = ?phase, error = %e,
                "event recording (OK) failed");
        }
    }

    fn transient(
        &self,
        ctx: &SignalContext,
        phase: ValidationPhase,
        err: StoreError,
    ) -> ProcessResult {
        error!(signal_id = %ctx.saved_signal_id, phase = ?phase, error = %err,
            "transient store failure, leaving message for redelivery");
        metrics::inc_retried();
        ProcessResult::retry_transient(vec![rejections::transient_upstream(
            ctx.now,
            phase,
            "store",
            &err.to_string(),
        )])
    }
}
