//! Trade-execution events from the upstream combined stream.

use common::ProductId;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Aggressor side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// A trade where the buyer was the resting (maker) order was a sell.
    pub fn from_buyer_is_maker(buyer_is_maker: bool) -> Self {
        if buyer_is_maker {
            Side::Sell
        } else {
            Side::Buy
        }
    }
}

/// A single executed trade, as forwarded to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerEvent {
    /// Stream the event arrived on; matches the subscribed channel.
    pub product_id: ProductId,
    /// Exchange symbol (e.g. "BTCUSDT").
    pub symbol: String,
    pub trade_id: u64,
    pub price: Decimal,
    pub quantity: Decimal,
    pub side: Side,
    /// Trade time in milliseconds since the epoch.
    pub timestamp_ms: i64,
}

// ============================================================================
// Raw Message Types (private)
// ============================================================================

/// Combined-stream envelope: `{"stream":"btcusdt@trade","data":{...}}`.
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    stream: Option<String>,
    data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawTrade {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "t")]
    trade_id: u64,
    #[serde(rename = "p")]
    price: Decimal,
    #[serde(rename = "q")]
    quantity: Decimal,
    #[serde(rename = "T")]
    trade_time: i64,
    #[serde(rename = "m")]
    buyer_is_maker: bool,
}

/// Parse an upstream payload into a ticker event.
///
/// Returns `Ok(None)` for payloads that are not trade executions (command
/// replies, heartbeats, other stream kinds) and `Err` for trade payloads
/// whose fields cannot be read.
pub fn parse_trade_event(payload: &str) -> serde_json::Result<Option<TickerEvent>> {
    let envelope: RawEnvelope = serde_json::from_str(payload)?;

    let (Some(stream), Some(data)) = (envelope.stream, envelope.data) else {
        return Ok(None);
    };
    if data.get("e").and_then(|e| e.as_str()) != Some("trade") {
        return Ok(None);
    }

    let raw: RawTrade = serde_json::from_value(data)?;
    Ok(Some(TickerEvent {
        product_id: stream,
        symbol: raw.symbol,
        trade_id: raw.trade_id,
        price: raw.price,
        quantity: raw.quantity,
        side: Side::from_buyer_is_maker(raw.buyer_is_maker),
        timestamp_ms: raw.trade_time,
    }))
}
