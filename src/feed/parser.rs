/// Trade payload parsing for combined and per-symbol feed frames
use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{FlowError, Result};
use crate::types::RawTick;

#[derive(Debug, Deserialize)]
struct TradePayload {
    #[serde(rename = "s", default)]
    symbol: Option<String>,
    #[serde(rename = "p", default, deserialize_with = "decimal")]
    price: Option<f64>,
    #[serde(rename = "q", default, deserialize_with = "decimal")]
    quantity: Option<f64>,
    #[serde(rename = "T", default)]
    trade_time: Option<i64>,
    #[serde(rename = "E", default)]
    event_time: Option<i64>,
    #[serde(rename = "t", default)]
    trade_id: Option<u64>,
    #[serde(rename = "m", default)]
    is_buyer_maker: Option<bool>,
}

impl TradePayload {
    fn into_raw(self, symbol: Option<String>) -> RawTick {
        RawTick {
            symbol: symbol.or(self.symbol).map(|s| s.to_uppercase()),
            price: self.price,
            quantity: self.quantity,
            timestamp: self.trade_time.or(self.event_time),
            trade_id: self.trade_id,
            is_buyer_maker: self.is_buyer_maker,
        }
    }
}

/// The exchange sends decimals as strings; accept plain numbers too
fn decimal<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|e| de::Error::custom(format!("invalid decimal '{}': {}", s, e))),
        Some(other) => Err(de::Error::custom(format!("expected decimal, got {}", other))),
    }
}

fn parse_json(text: &str) -> Result<Value> {
    serde_json::from_str(text).map_err(|e| FlowError::Parse(format!("invalid JSON: {}", e)))
}

fn decode_payload(data: Value) -> Result<TradePayload> {
    serde_json::from_value(data).map_err(|e| FlowError::Parse(format!("bad trade payload: {}", e)))
}

/// Parse a combined-stream frame `{"stream": "btcusdt@trade", "data": {...}}`.
/// `Ok(None)` for well-formed frames that carry no trade (subscription acks).
pub fn parse_combined(text: &str) -> Result<Option<RawTick>> {
    let mut frame = parse_json(text)?;

    let stream = match frame.get("stream").and_then(Value::as_str) {
        Some(stream) => stream.to_string(),
        None => return Ok(None),
    };

    let (symbol, kind) = stream.split_once('@').unwrap_or((stream.as_str(), ""));
    if kind != "trade" {
        return Ok(None);
    }

    let data = match frame.get_mut("data").map(Value::take) {
        Some(data) if data.is_object() => data,
        Some(_) => return Err(FlowError::Parse(format!("non-object data on {}", stream))),
        None => return Ok(None),
    };

    Ok(Some(decode_payload(data)?.into_raw(Some(symbol.to_string()))))
}

/// Parse a raw per-symbol trade frame. The `s` field wins over `symbol`.
pub fn parse_symbol_frame(text: &str, symbol: &str) -> Result<Option<RawTick>> {
    let frame = parse_json(text)?;

    if !frame.is_object() {
        return Err(FlowError::Parse("trade frame is not an object".to_string()));
    }

    match frame.get("e").and_then(Value::as_str) {
        Some("trade") => {}
        Some(_) => return Ok(None),
        None if frame.get("result").is_some() => return Ok(None),
        None => {}
    }

    let payload = decode_payload(frame)?;
    let fallback = payload.symbol.is_none().then(|| symbol.to_string());

    Ok(Some(payload.into_raw(fallback)))
}
