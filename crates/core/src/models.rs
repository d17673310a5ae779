use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

use crate::errors::BrokerError;

/// Format a timestamp the way the OANDA v20 API does (RFC 3339, nanoseconds,
/// `Z` suffix). Every sink uses this single form so that key comparisons
/// against read-back rows behave.
pub fn fmt_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

// ---------------------------------------------------------------------------
// Candle
// ---------------------------------------------------------------------------

/// A flattened OHLC candle for one instrument and one time bucket.
///
/// The API nests bid/ask/mid sub-objects; this record flattens them into
/// `bidOpen..midClose` fields. Components the server did not send stay
/// `None` and are omitted from JSON output rather than defaulted. Only
/// candles the server marked complete are ever turned into this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub instrument: String,
    pub time: DateTime<Utc>,
    pub volume: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bid_open: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bid_high: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bid_low: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bid_close: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask_open: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask_high: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask_low: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask_close: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mid_open: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mid_high: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mid_low: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mid_close: Option<Decimal>,
}

impl Candle {
    /// Dedup key: `(instrument, time)` with the canonical time form.
    pub fn key(&self) -> (String, String) {
        (self.instrument.clone(), fmt_time(&self.time))
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// Names of broker payload fields that carry numbers as JSON strings.
/// They are rewritten to real numbers before storage so the persisted
/// schema stays stable across batches; everything else passes through
/// as opaque JSON.
const NUMERIC_FIELDS: &[&str] = &[
    "id",
    "batchID",
    "tradeID",
    "orderID",
    "userID",
    "pl",
    "accountBalance",
    "units",
    "requestedUnits",
    "price",
    "financing",
    "commission",
    "halfSpreadCost",
    "guaranteedExecutionFee",
    "initialMarginRequired",
    "marginRate",
    "distance",
];

/// Rewrite known numeric string fields to JSON numbers, recursively.
/// Integer-looking values become integers, the rest become floats;
/// unparseable strings are left untouched.
pub fn coerce_numeric_fields(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, v) in map.iter_mut() {
                if NUMERIC_FIELDS.contains(&key.as_str()) {
                    if let Value::String(s) = v {
                        if let Ok(n) = s.parse::<i64>() {
                            *v = Value::from(n);
                        } else if let Ok(f) = s.parse::<f64>() {
                            if let Some(n) = serde_json::Number::from_f64(f) {
                                *v = Value::Number(n);
                            }
                        }
                        continue;
                    }
                }
                coerce_numeric_fields(v);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                coerce_numeric_fields(item);
            }
        }
        _ => {}
    }
}

/// One account transaction, persisted as an `(id, time, json)` row.
/// Immutable once fetched; ids are unique and monotonic per account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub time: String,
    pub raw: Value,
}

impl Transaction {
    /// Build a transaction from a raw API payload, coercing numeric fields.
    pub fn from_value(mut value: Value) -> Result<Self, BrokerError> {
        coerce_numeric_fields(&mut value);
        let id = value
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| BrokerError::ParseError("transaction without integer id".into()))?;
        let time = value
            .get("time")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(Self {
            id,
            time,
            raw: value,
        })
    }

    /// The raw payload rendered as a compact JSON string.
    pub fn json(&self) -> String {
        self.raw.to_string()
    }
}

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

/// An open position as reported by the account endpoint. Transient: it is
/// read and acted upon (closed) in the same invocation, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub instrument: String,
    #[serde(default)]
    pub long: PositionSide,
    #[serde(default)]
    pub short: PositionSide,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionSide {
    #[serde(default)]
    pub units: Decimal,
}

/// Body of a position close request. Each side is `"ALL"` when it currently
/// holds nonzero units and `"NONE"` otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosePositionRequest {
    pub long_units: String,
    pub short_units: String,
}

impl ClosePositionRequest {
    pub fn for_position(position: &Position) -> Self {
        let side = |units: Decimal| {
            if units.is_zero() {
                "NONE".to_string()
            } else {
                "ALL".to_string()
            }
        };
        Self {
            long_units: side(position.long.units),
            short_units: side(position.short.units),
        }
    }
}

// ---------------------------------------------------------------------------
// Spread
// ---------------------------------------------------------------------------

/// Current bid/ask with the derived spread-to-mid ratio for one instrument.
#[derive(Debug, Clone, Serialize)]
pub struct SpreadRatio {
    pub instrument: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub mid: Decimal,
    pub spread: Decimal,
    pub ratio_of_spread_to_mid: Decimal,
}

impl SpreadRatio {
    pub fn new(instrument: impl Into<String>, bid: Decimal, ask: Decimal) -> Self {
        let mid = (bid + ask) / Decimal::TWO;
        let spread = ask - bid;
        let ratio = if mid.is_zero() {
            Decimal::ZERO
        } else {
            spread / mid
        };
        Self {
            instrument: instrument.into(),
            bid,
            ask,
            mid,
            spread,
            ratio_of_spread_to_mid: ratio,
        }
    }
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

/// Which long-lived stream to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTarget {
    /// Live prices; requires a non-empty instrument list.
    Pricing,
    /// Account-wide transaction events.
    Transaction,
}

impl StreamTarget {
    /// Database table that records this stream.
    pub fn stream_table(&self) -> &'static str {
        match self {
            StreamTarget::Pricing => "pricing_stream",
            StreamTarget::Transaction => "transaction_stream",
        }
    }
}

impl FromStr for StreamTarget {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pricing" => Ok(StreamTarget::Pricing),
            "transaction" => Ok(StreamTarget::Transaction),
            other => Err(BrokerError::InvalidTarget(other.to_string())),
        }
    }
}

/// One inbound stream message, classified by the suffix of its `type` tag.
#[derive(Debug, Clone)]
pub enum StreamMessage {
    Heartbeat(Value),
    Price(Value),
    Transaction(Value),
}

impl StreamMessage {
    pub fn classify(value: Value) -> Self {
        let tag = value.get("type").and_then(Value::as_str).unwrap_or("");
        if tag.ends_with("HEARTBEAT") {
            StreamMessage::Heartbeat(value)
        } else if tag.ends_with("PRICE") {
            StreamMessage::Price(value)
        } else {
            StreamMessage::Transaction(value)
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, StreamMessage::Heartbeat(_))
    }

    pub fn raw(&self) -> &Value {
        match self {
            StreamMessage::Heartbeat(v) | StreamMessage::Price(v) | StreamMessage::Transaction(v) => v,
        }
    }

    /// Instrument field, if present and non-empty.
    pub fn instrument(&self) -> Option<&str> {
        self.raw()
            .get("instrument")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Queue list key: the instrument for price ticks, `"transactions"`
    /// for account events.
    pub fn queue_key(&self) -> String {
        match self {
            StreamMessage::Transaction(_) => "transactions".to_string(),
            _ => self.instrument().unwrap_or_default().to_string(),
        }
    }

    pub fn time(&self) -> Option<&str> {
        self.raw().get("time").and_then(Value::as_str)
    }
}
