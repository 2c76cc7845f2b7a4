use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY", alias = "buy", alias = "Buy")]
    Buy,
    #[serde(rename = "SELL", alias = "sell", alias = "Sell")]
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TimeInForce {
    #[serde(rename = "IOC", alias = "ioc")]
    #[default]
    Ioc,
    #[serde(rename = "FOK", alias = "fok")]
    Fok,
    #[serde(rename = "GTC", alias = "gtc")]
    Gtc,
    #[serde(rename = "DAY", alias = "day")]
    Day,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalStatus {
    Received,
    Validated,
    Executing,
    Filled,
    Partial,
    Cancelled,
    Rejected,
}

/// Numeric wire value. Producers send `{string, float64, float64Exact, ratStr}`;
/// the exact string form wins over the float when both are present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecimalValue {
    #[serde(default, alias = "String")]
    pub string: Option<String>,
    #[serde(default, alias = "Float64")]
    pub float64: Option<f64>,
    #[serde(default)]
    pub float64_exact: Option<bool>,
    #[serde(default)]
    pub rat_str: Option<String>,
}

impl DecimalValue {
    pub fn from_text(s: &str) -> Self {
        Self {
            string: Some(s.to_string()),
            ..Default::default()
        }
    }

    /// Prefer the exact string; fall back to float64. None when neither parses.
    pub fn to_decimal(&self) -> Option<Decimal> {
        if let Some(s) = &self.string {
            if !s.is_empty() {
                if let Ok(d) = Decimal::from_str(s) {
                    return Some(d);
                }
            }
        }
        self.float64.and_then(Decimal::from_f64)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMeta {
    #[serde(default, alias = "signal_id")]
    pub signal_id: Option<String>,
    #[serde(default, alias = "created_at")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "ttl_ms")]
    pub ttl_ms: Option<i64>,
    #[serde(default, alias = "max_latency_ms")]
    pub max_latency_ms: Option<i64>,
    #[serde(default, alias = "Pair")]
    pub pair: Option<String>,
    #[serde(default, alias = "Couple")]
    pub couple: Option<String>,
    #[serde(default)]
    pub clockwise: Option<bool>,
}

/// One order leg as delivered on the wire. Exactly one of base/quote amount
/// must resolve to a positive base quantity (quote amount derives via price).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderInstruction {
    #[serde(default, alias = "exchange_name", alias = "Exchange")]
    pub exchange_name: Option<String>,
    #[serde(default, alias = "pair_name", alias = "market")]
    pub pair_name: Option<String>,
    #[serde(default, alias = "Side")]
    pub side: Option<Side>,
    #[serde(default, alias = "Price")]
    pub price: Option<DecimalValue>,
    #[serde(default, alias = "base_amount")]
    pub base_amount: Option<DecimalValue>,
    #[serde(default, alias = "quote_amount")]
    pub quote_amount: Option<DecimalValue>,
    #[serde(default, alias = "time_in_force")]
    pub time_in_force: Option<TimeInForce>,
}

impl OrderInstruction {
    pub fn price_decimal(&self) -> Option<Decimal> {
        self.price.as_ref().and_then(DecimalValue::to_decimal)
    }

    /// Base quantity: explicit base amount, else quote amount divided by price.
    pub fn base_qty(&self) -> Option<Decimal> {
        if let Some(base) = self.base_amount.as_ref().and_then(DecimalValue::to_decimal) {
            return Some(base);
        }
        let quote = self
            .quote_amount
            .as_ref()
            .and_then(DecimalValue::to_decimal)?;
        let price = self.price_decimal()?;
        if price <= Decimal::ZERO {
            return None;
        }
        quote.checked_div(price)
    }

    pub fn tif_or_default(&self) -> TimeInForce {
        self.time_in_force.unwrap_or_default()
    }
}

/// Root inbound signal, aligned 1:1 with the JetStream JSON payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeSignal {
    #[serde(default)]
    pub meta: Option<SignalMeta>,
    #[serde(default, alias = "legs")]
    pub orders: Vec<OrderInstruction>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub constraints: Option<serde_json::Value>,
    #[serde(default, alias = "expected_pnl")]
    pub expected_pnl: Option<DecimalValue>,
}

impl TradeSignal {
    /// Producer-assigned external id, used for idempotent re-delivery.
    pub fn external_id(&self) -> Option<&str> {
        self.meta.as_ref().and_then(|m| m.signal_id.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn decimal_value_prefers_exact_string() {
        let v = DecimalValue {
            string: Some("0.1".to_string()),
            float64: Some(0.30000000000000004),
            float64_exact: Some(false),
            rat_str: None,
        };
        assert_eq!(v.to_decimal(), Some(dec!(0.1)));
    }

    #[test]
    fn decimal_value_falls_back_to_float() {
        let v = DecimalValue {
            float64: Some(2.5),
            ..Default::default()
        };
        assert_eq!(v.to_decimal(), Some(dec!(2.5)));
    }

    #[test]
    fn base_qty_derives_from_quote_amount() {
        let leg = OrderInstruction {
            price: Some(DecimalValue::from_text("10")),
            quote_amount: Some(DecimalValue::from_text("25")),
            ..Default::default()
        };
        assert_eq!(leg.base_qty(), Some(dec!(2.5)));
    }

    #[test]
    fn decodes_producer_payload_with_aliases() {
        let raw = serde_json::json!({
            "meta": {
                "signalId": "sig-1",
                "createdAt": "2026-01-10T12:00:00Z",
                "ttlMs": 5000,
                "pair": "BTC-USDT"
            },
            "orders": [
                {
                    "exchangeName": "alphax",
                    "pairName": "BTC-USDT",
                    "side": "buy",
                    "price": { "string": "10" },
                    "baseAmount": { "float64": 2.0 }
                }
            ],
            "unknownField": true
        });
        let signal: TradeSignal = serde_json::from_value(raw).unwrap();
        assert_eq!(signal.external_id(), Some("sig-1"));
        assert_eq!(signal.orders.len(), 1);
        assert_eq!(signal.orders[0].side, Some(Side::Buy));
        assert_eq!(signal.orders[0].base_qty(), Some(dec!(2)));
    }
}
