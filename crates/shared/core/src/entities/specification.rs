use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Trading specification of a symbol on a broker server.
///
/// Specifications are identical for every account on the same server, which is why
/// the hash cache stores them keyed by server name rather than by account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SymbolSpecification {
    pub symbol: String,

    /// Minimum price change
    pub tick_size: Decimal,

    pub min_volume: Decimal,
    pub max_volume: Decimal,
    pub volume_step: Decimal,

    /// Number of decimal digits in quotes
    pub digits: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract_size: Option<Decimal>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub point: Option<Decimal>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub filling_modes: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_mode: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub trade_mode: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub swap_long: Option<Decimal>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub swap_short: Option<Decimal>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_currency: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub profit_currency: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub margin_currency: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}
