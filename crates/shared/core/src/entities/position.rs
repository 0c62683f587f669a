use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::values::{id_from_string_or_number, optional_id_from_string_or_number};

/// Position direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PositionType {
    /// Long position - profit when price rises
    #[default]
    #[serde(rename = "POSITION_TYPE_BUY")]
    Buy,
    /// Short position - profit when price falls
    #[serde(rename = "POSITION_TYPE_SELL")]
    Sell,
    /// Any value this client does not know yet
    #[serde(other)]
    Unknown,
}

/// An open position in the terminal
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Position {
    /// Position ticket
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub id: String,

    #[serde(rename = "type")]
    pub position_type: PositionType,

    pub symbol: String,

    /// Expert advisor magic number
    pub magic: i64,

    /// Time the position was opened
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,

    /// Last modification time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_time: Option<DateTime<Utc>>,

    pub open_price: Decimal,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_price: Option<Decimal>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_tick_value: Option<Decimal>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<Decimal>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<Decimal>,

    pub volume: Decimal,
    pub swap: Decimal,
    pub commission: Decimal,
    pub profit: Decimal,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub unrealized_profit: Option<Decimal>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub realized_profit: Option<Decimal>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    #[serde(
        skip_serializing_if = "Option::is_none",
        deserialize_with = "optional_id_from_string_or_number"
    )]
    pub order_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Position {
    /// Unrealized profit including swap and commission
    pub fn net_profit(&self) -> Decimal {
        self.profit + self.swap + self.commission
    }
}
