use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// OHLC bar
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Candle {
    pub symbol: String,
    /// Timeframe such as `1m` or `1h`
    pub timeframe: String,
    pub time: DateTime<Utc>,
    pub broker_time: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub tick_volume: u64,
    pub spread: u64,
    pub volume: Decimal,
}

/// Single tick
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Tick {
    pub symbol: String,
    pub time: DateTime<Utc>,
    pub broker_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bid: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<Decimal>,
    /// `buy` or `sell` for exchange ticks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub side: Option<String>,
}

/// Side of an order book entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BookEntryType {
    #[default]
    #[serde(rename = "BOOK_TYPE_SELL")]
    Sell,
    #[serde(rename = "BOOK_TYPE_BUY")]
    Buy,
    #[serde(rename = "BOOK_TYPE_SELL_MARKET")]
    SellMarket,
    #[serde(rename = "BOOK_TYPE_BUY_MARKET")]
    BuyMarket,
    #[serde(other)]
    Unknown,
}

/// One level of the order book
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BookEntry {
    #[serde(rename = "type")]
    pub entry_type: BookEntryType,
    pub price: Decimal,
    pub volume: Decimal,
}

/// Order book snapshot (market depth)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Book {
    pub symbol: String,
    pub time: DateTime<Utc>,
    pub broker_time: String,
    pub book: Vec<BookEntry>,
}
