use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::values::{id_from_string_or_number, optional_id_from_string_or_number};

/// Deal type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DealType {
    #[default]
    #[serde(rename = "DEAL_TYPE_BUY")]
    Buy,
    #[serde(rename = "DEAL_TYPE_SELL")]
    Sell,
    #[serde(rename = "DEAL_TYPE_BALANCE")]
    Balance,
    #[serde(rename = "DEAL_TYPE_CREDIT")]
    Credit,
    #[serde(rename = "DEAL_TYPE_COMMISSION")]
    Commission,
    #[serde(other)]
    Unknown,
}

/// Executed deal from the account history
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Deal {
    /// Deal ticket
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub id: String,

    #[serde(rename = "type")]
    pub deal_type: DealType,

    /// `DEAL_ENTRY_IN`, `DEAL_ENTRY_OUT`, ...
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,

    pub magic: i64,
    pub time: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<Decimal>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,

    pub commission: Decimal,
    pub swap: Decimal,
    pub profit: Decimal,

    #[serde(
        skip_serializing_if = "Option::is_none",
        deserialize_with = "optional_id_from_string_or_number"
    )]
    pub position_id: Option<String>,

    #[serde(
        skip_serializing_if = "Option::is_none",
        deserialize_with = "optional_id_from_string_or_number"
    )]
    pub order_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}
