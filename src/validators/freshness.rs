use tracing::{debug, warn};

use crate::outcome::{rejections, RejectCode, Rejection, StepResult, ValidationPhase};
use crate::pipeline::SignalContext;

/// TTL / latency gate. Pure function of (createdAt, ttlMs, maxLatencyMs) and
/// the context's pinned `now` — never the wall clock — so a frozen clock
/// makes the outcome deterministic. No side effects.
pub struct FreshnessValidator;

impl FreshnessValidator {
    pub fn validate(ctx: &SignalContext) -> StepResult {
        let now = ctx.now;
        let Some(meta) = ctx.dto.meta.as_ref() else {
            warn!("freshness invalid: missing meta");
            return StepResult::fail(Rejection::new(
                RejectCode::IntegrityMissingMeta,
                "Missing meta",
                ValidationPhase::Freshness,
                "FreshnessValidator",
                now,
            ));
        };

        let signal_id = meta.signal_id.as_deref().unwrap_or("n/a");
        let (Some(created_at), Some(ttl_ms)) = (meta.created_at, meta.ttl_ms.filter(|t| *t > 0))
        else {
            warn!(signal_id = %signal_id, "freshness invalid: missing/invalid fields");
            return StepResult::fail(
                Rejection::new(
                    RejectCode::IntegrityMissingField,
                    "Missing/invalid createdAt or ttlMs",
                    ValidationPhase::Freshness,
                    "FreshnessValidator",
                    now,
                )
                .with_detail("signal_id", signal_id),
            );
        };

        let age_ms = now.timestamp_millis() - created_at.timestamp_millis();

        if age_ms > ttl_ms {
            warn!(signal_id = %signal_id, age_ms, ttl_ms, "freshness expired");
            return StepResult::fail(
                rejections::stale(now, age_ms, ttl_ms).with_detail("signal_id", signal_id),
            );
        }

        if let Some(max_latency_ms) = meta.max_latency_ms.filter(|v| *v > 0) {
            if age_ms > max_latency_ms {
                warn!(signal_id = %signal_id, age_ms, max_latency_ms, "freshness latency fail");
                return StepResult::fail(
                    rejections::latency_exceeded(now, age_ms, max_latency_ms)
                        .with_detail("signal_id", signal_id),
                );
            }
        }

        debug!(signal_id = %signal_id, age_ms, ttl_ms, "freshness ok");
        StepResult::ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SimulatedTimeProvider;
    use crate::context::TimeProvider;
    use crate::model::{SignalMeta, TradeSignal};
    use crate::outcome::RejectCode;
    use uuid::Uuid;

    fn ctx_with_meta(now_ms: i64, meta: SignalMeta) -> SignalContext {
        let time = SimulatedTimeProvider::new(now_ms);
        SignalContext::new(
            TradeSignal {
                meta: Some(meta),
                ..Default::default()
            },
            time.now(),
            Uuid::new_v4(),
        )
    }

    fn meta(created_ms: i64, ttl_ms: i64) -> SignalMeta {
        SignalMeta {
            signal_id: Some("sig-1".to_string()),
            created_at: Some(
                chrono::TimeZone::timestamp_millis_opt(&chrono::Utc, created_ms).unwrap(),
            ),
            ttl_ms: Some(ttl_ms),
            pair: Some("BTC-USDT".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn within_ttl_passes() {
        let ctx = ctx_with_meta(10_000, meta(6_000, 5_000));
        assert!(FreshnessValidator::validate(&ctx).is_ok());
    }

    #[test]
    fn age_over_ttl_is_stale() {
        // created 10s before now, ttl 5s
        let ctx = ctx_with_meta(20_000, meta(10_000, 5_000));
        let step = FreshnessValidator::validate(&ctx);
        let rej = step.rejection().expect("should fail");
        assert_eq!(rej.code, RejectCode::Stale);
    }

    #[test]
    fn age_at_ttl_boundary_passes() {
        let ctx = ctx_with_meta(15_000, meta(10_000, 5_000));
        assert!(FreshnessValidator::validate(&ctx).is_ok());
    }

    #[test]
    fn latency_guard_fires_with_distinct_message() {
        let mut m = meta(10_000, 60_000);
        m.max_latency_ms = Some(2_000);
        let ctx = ctx_with_meta(15_000, m);
        let step = FreshnessValidator::validate(&ctx);
        let rej = step.rejection().expect("should fail");
        assert_eq!(rej.code, RejectCode::Stale);
        assert!(rej.message.contains("max_latency_ms"));
    }

    #[test]
    fn missing_created_at_is_integrity_class() {
        let mut m = meta(10_000, 5_000);
        m.created_at = None;
        let ctx = ctx_with_meta(10_000, m);
        let step = FreshnessValidator::validate(&ctx);
        let rej = step.rejection().expect("should fail");
        assert_eq!(rej.code, RejectCode::IntegrityMissingField);
    }

    #[test]
    fn missing_meta_fails() {
        let time = SimulatedTimeProvider::new(1_000);
        let ctx = SignalContext::new(TradeSignal::default(), time.now(), Uuid::new_v4());
        let step = FreshnessValidator::validate(&ctx);
        assert_eq!(
            step.rejection().unwrap().code,
            RejectCode::IntegrityMissingMeta
        );
    }
}
