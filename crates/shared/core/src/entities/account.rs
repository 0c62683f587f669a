use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::values::optional_id_from_string_or_number;

/// Trading account information as reported by the terminal
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccountInformation {
    /// Platform identifier (mt4, mt5)
    pub platform: String,

    /// Broker name
    pub broker: String,

    /// Account base currency ISO code
    pub currency: String,

    /// Broker server name
    pub server: String,

    pub balance: Decimal,
    pub equity: Decimal,
    pub margin: Decimal,
    pub free_margin: Decimal,
    pub leverage: Decimal,

    /// Margin level in percent, absent when no margin is used
    #[serde(skip_serializing_if = "Option::is_none")]
    pub margin_level: Option<Decimal>,

    /// Whether trading is allowed for this account
    pub trade_allowed: bool,

    /// Whether the terminal is connected with the investor password
    #[serde(skip_serializing_if = "Option::is_none")]
    pub investor_mode: Option<bool>,

    /// Account owner name
    pub name: String,

    #[serde(
        skip_serializing_if = "Option::is_none",
        deserialize_with = "optional_id_from_string_or_number"
    )]
    pub login: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub credit: Option<Decimal>,
}

/// Account-level figures pushed alongside price, candle, tick and book batches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccountMetrics {
    pub equity: Option<Decimal>,
    pub margin: Option<Decimal>,
    pub free_margin: Option<Decimal>,
    pub margin_level: Option<Decimal>,
}

impl AccountMetrics {
    /// True when the server sent none of the figures
    pub fn is_empty(&self) -> bool {
        self.equity.is_none()
            && self.margin.is_none()
            && self.free_margin.is_none()
            && self.margin_level.is_none()
    }
}

impl AccountInformation {
    /// Overwrite the derived account fields with the ones present in `metrics`
    pub fn apply_metrics(&mut self, metrics: &AccountMetrics) {
        if let Some(equity) = metrics.equity {
            self.equity = equity;
        }
        if let Some(margin) = metrics.margin {
            self.margin = margin;
        }
        if let Some(free_margin) = metrics.free_margin {
            self.free_margin = free_margin;
        }
        if metrics.margin_level.is_some() {
            self.margin_level = metrics.margin_level;
        }
    }
}
