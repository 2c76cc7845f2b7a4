use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Canonical machine-friendly reject codes. Closed set; analysis tooling
/// keys off these, so new failure modes get a new variant, not a new string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectCode {
    /// ttl exceeded / latency guard failed
    Stale,
    /// not enough balance to execute the leg/plan
    InsufficientFunds,
    /// tick/step/minNotional/ceiling violations
    MarketRuleViolation,
    MinNotional,
    SizeCeiling,
    /// order book depth cannot fill qty within slippage window
    InsufficientLiquidity,
    PnlTooLow,
    /// portfolio / per-exchange caps / circuit breaker
    RiskLimit,
    /// temporary dependency issue
    TransientUpstream,
    InternalError,
    ReferenceNotFound,
    InvalidInput,
    IntegrityMissingMeta,
    IntegrityMissingField,
    IntegrityInvalidValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationPhase {
    /// initial persist / idempotency / normalization
    Persist,
    Integrity,
    /// ttl / latency validation
    Freshness,
    /// balances & reservation
    Balance,
    /// market rules (tick/step/minNotional/ceiling)
    Market,
    /// order book depth / slippage
    Liquidity,
    /// fees & expected pnl
    Pnl,
    /// risk / exposure limits
    Risk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AckAction {
    /// Processing completed; ack the message.
    Ack,
    /// Do not ack; let ack-wait expire for redelivery (safer than immediate nak).
    NoAck,
    /// Negative ack, immediate redelivery. Use sparingly.
    Nak,
    /// Permanently terminate this message (park / drop per consumer config).
    Term,
}

/// Immutable record of one validation failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rejection {
    pub code: RejectCode,
    pub message: String,
    pub phase: ValidationPhase,
    /// step id, e.g. "FreshnessValidator"
    pub validator: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leg_index: Option<usize>,
    pub occurred_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, serde_json::Value>,
}

impl Rejection {
    pub fn new(
        code: RejectCode,
        message: impl Into<String>,
        phase: ValidationPhase,
        validator: &str,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            phase,
            validator: validator.to_string(),
            leg_index: None,
            occurred_at,
            details: BTreeMap::new(),
        }
    }

    pub fn with_leg(mut self, index: usize) -> Self {
        self.leg_index = Some(index);
        self
    }

    pub fn with_detail(mut self, key: &str, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.insert(key.to_string(), v);
        }
        self
    }
}

/// Factory helpers for the recurring rejection shapes.
pub mod rejections {
    use super::*;
    use rust_decimal::Decimal;

    pub fn stale(now: DateTime<Utc>, age_ms: i64, ttl_ms: i64) -> Rejection {
        Rejection::new(
            RejectCode::Stale,
            "Signal expired: age_ms > ttl_ms",
            ValidationPhase::Freshness,
            "FreshnessValidator",
            now,
        )
        .with_detail("age_ms", age_ms)
        .with_detail("ttl_ms", ttl_ms)
    }

    pub fn latency_exceeded(now: DateTime<Utc>, age_ms: i64, max_latency_ms: i64) -> Rejection {
        Rejection::new(
            RejectCode::Stale,
            "Latency guard failed: age_ms > max_latency_ms",
            ValidationPhase::Freshness,
            "FreshnessValidator",
            now,
        )
        .with_detail("age_ms", age_ms)
        .with_detail("max_latency_ms", max_latency_ms)
    }

    pub fn insufficient_funds(
        now: DateTime<Utc>,
        validator: &str,
        account_id: u64,
        currency_id: u64,
        required: Decimal,
        available: Decimal,
    ) -> Rejection {
        Rejection::new(
            RejectCode::InsufficientFunds,
            "Insufficient available balance",
            ValidationPhase::Balance,
            validator,
            now,
        )
        .with_detail("account_id", account_id)
        .with_detail("currency_id", currency_id)
        .with_detail("required", required)
        .with_detail("available", available)
    }

    pub fn reference_not_found(
        now: DateTime<Utc>,
        validator: &str,
        phase: ValidationPhase,
        ref_type: &str,
        ref_value: &str,
    ) -> Rejection {
        Rejection::new(
            RejectCode::ReferenceNotFound,
            "Reference not found",
            phase,
            validator,
            now,
        )
        .with_detail("reference_type", ref_type)
        .with_detail("reference_value", ref_value)
    }

    pub fn internal_error(now: DateTime<Utc>, validator: &str, error: &str) -> Rejection {
        Rejection::new(
            RejectCode::InternalError,
            "Internal error",
            ValidationPhase::Persist,
            validator,
            now,
        )
        .with_detail("error", error)
    }

    pub fn transient_upstream(
        now: DateTime<Utc>,
        phase: ValidationPhase,
        dependency: &str,
        reason: &str,
    ) -> Rejection {
        Rejection::new(
            RejectCode::TransientUpstream,
            "Transient upstream dependency issue",
            phase,
            dependency,
            now,
        )
        .with_detail("reason", reason)
    }
}

/// Outcome of a single validation step. Keep this minimal; the `Rejection`
/// carries the details.
#[derive(Debug, Clone)]
pub enum StepResult {
    Ok,
    Fail(Box<Rejection>),
}

impl StepResult {
    pub fn ok() -> Self {
        StepResult::Ok
    }

    pub fn fail(rejection: Rejection) -> Self {
        StepResult::Fail(Box::new(rejection))
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, StepResult::Ok)
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            StepResult::Ok => None,
            StepResult::Fail(rej) => Some(rej),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessStatus {
    Accepted,
    Rejected,
    Retry,
}

/// Terminal outcome for one signal, consumed by the queue layer for the
/// ack decision.
#[derive(Debug, Clone)]
pub struct ProcessResult {
    pub status: ProcessStatus,
    pub ack_action: AckAction,
    pub signal_id: Option<Uuid>,
    pub rejections: Vec<Rejection>,
    /// log/metric hints (sizing alpha, bucket count, ...)
    pub meta: BTreeMap<String, serde_json::Value>,
}

impl ProcessResult {
    pub fn accepted(id: Uuid) -> Self {
        Self {
            status: ProcessStatus::Accepted,
            ack_action: AckAction::Ack,
            signal_id: Some(id),
            rejections: Vec::new(),
            meta: BTreeMap::new(),
        }
    }

    /// Logical failure: a business decision, never retried by the queue.
    pub fn rejected(id: Option<Uuid>, rejections: Vec<Rejection>) -> Self {
        Self {
            status: ProcessStatus::Rejected,
            ack_action: AckAction::Ack,
            signal_id: id,
            rejections,
            meta: BTreeMap::new(),
        }
    }

    /// Infrastructure failure: leave un-acked so ack-wait triggers redelivery.
    pub fn retry_transient(rejections: Vec<Rejection>) -> Self {
        Self {
            status: ProcessStatus::Retry,
            ack_action: AckAction::NoAck,
            signal_id: None,
            rejections,
            meta: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.meta.insert(key.to_string(), v);
        }
        self
    }

    pub fn is_ack(&self) -> bool {
        self.ack_action == AckAction::Ack
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_always_maps_to_ack() {
        let result = ProcessResult::rejected(None, vec![]);
        assert_eq!(result.status, ProcessStatus::Rejected);
        assert_eq!(result.ack_action, AckAction::Ack);
    }

    #[test]
    fn transient_retry_maps_to_no_ack() {
        let result = ProcessResult::retry_transient(vec![]);
        assert_eq!(result.status, ProcessStatus::Retry);
        assert_eq!(result.ack_action, AckAction::NoAck);
        assert!(result.signal_id.is_none());
    }

    #[test]
    fn accepted_carries_signal_id_and_ack() {
        let id = Uuid::new_v4();
        let result = ProcessResult::accepted(id);
        assert_eq!(result.signal_id, Some(id));
        assert!(result.is_ack());
    }

    #[test]
    fn reject_codes_serialize_screaming_snake() {
        let json = serde_json::to_string(&RejectCode::InsufficientFunds).unwrap();
        assert_eq!(json, "\"INSUFFICIENT_FUNDS\"");
        let json = serde_json::to_string(&RejectCode::IntegrityMissingField).unwrap();
        assert_eq!(json, "\"INTEGRITY_MISSING_FIELD\"");
    }
}
