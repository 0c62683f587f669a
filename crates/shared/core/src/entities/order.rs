use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::values::{id_from_string_or_number, optional_id_from_string_or_number};

/// Order type as reported by the terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OrderType {
    #[default]
    #[serde(rename = "ORDER_TYPE_BUY")]
    Buy,
    #[serde(rename = "ORDER_TYPE_SELL")]
    Sell,
    #[serde(rename = "ORDER_TYPE_BUY_LIMIT")]
    BuyLimit,
    #[serde(rename = "ORDER_TYPE_SELL_LIMIT")]
    SellLimit,
    #[serde(rename = "ORDER_TYPE_BUY_STOP")]
    BuyStop,
    #[serde(rename = "ORDER_TYPE_SELL_STOP")]
    SellStop,
    #[serde(rename = "ORDER_TYPE_BUY_STOP_LIMIT")]
    BuyStopLimit,
    #[serde(rename = "ORDER_TYPE_SELL_STOP_LIMIT")]
    SellStopLimit,
    #[serde(rename = "ORDER_TYPE_CLOSE_BY")]
    CloseBy,
    #[serde(other)]
    Unknown,
}

impl OrderType {
    /// Returns true for orders that wait in the book (limit / stop)
    pub fn is_pending(&self) -> bool {
        !matches!(self, OrderType::Buy | OrderType::Sell | OrderType::CloseBy)
    }
}

/// Order lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OrderState {
    #[serde(rename = "ORDER_STATE_STARTED")]
    Started,
    #[default]
    #[serde(rename = "ORDER_STATE_PLACED")]
    Placed,
    #[serde(rename = "ORDER_STATE_CANCELED")]
    Canceled,
    #[serde(rename = "ORDER_STATE_PARTIAL")]
    Partial,
    #[serde(rename = "ORDER_STATE_FILLED")]
    Filled,
    #[serde(rename = "ORDER_STATE_REJECTED")]
    Rejected,
    #[serde(rename = "ORDER_STATE_EXPIRED")]
    Expired,
    #[serde(other)]
    Unknown,
}

/// A pending order, or a history order once `done_time` is set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Order {
    /// Order ticket
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub id: String,

    #[serde(rename = "type")]
    pub order_type: OrderType,

    pub state: OrderState,

    pub magic: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,

    /// Time the order was executed or canceled (history orders only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done_time: Option<DateTime<Utc>>,

    pub symbol: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_price: Option<Decimal>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_price: Option<Decimal>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<Decimal>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<Decimal>,

    pub volume: Decimal,
    pub current_volume: Decimal,

    #[serde(
        skip_serializing_if = "Option::is_none",
        deserialize_with = "optional_id_from_string_or_number"
    )]
    pub position_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub filling_mode: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Order {
    /// Volume already filled
    pub fn filled_volume(&self) -> Decimal {
        self.volume - self.current_volume
    }
}
