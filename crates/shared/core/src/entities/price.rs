use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Latest quote for a symbol
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SymbolPrice {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,

    /// Tick value for a profitable position
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profit_tick_value: Option<Decimal>,

    /// Tick value for a losing position
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loss_tick_value: Option<Decimal>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_currency_exchange_rate: Option<Decimal>,

    /// Quote time
    pub time: DateTime<Utc>,

    /// Quote time in broker timezone, `YYYY-MM-DD HH:mm:ss.SSS`
    pub broker_time: String,
}

impl SymbolPrice {
    /// Ask minus bid
    pub fn spread(&self) -> Decimal {
        self.ask - self.bid
    }

    /// Returns true when `self` may replace `current` in a price map.
    /// Quotes older than the one already held are stale.
    pub fn supersedes(&self, current: &SymbolPrice) -> bool {
        self.time >= current.time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn price_at(seconds: i64) -> SymbolPrice {
        SymbolPrice {
            symbol: "EURUSD".to_string(),
            bid: dec!(1.0841),
            ask: dec!(1.0843),
            time: Utc.timestamp_opt(seconds, 0).unwrap(),
            ..Default::default()
        }
    }

    #[test]
    fn test_spread() {
        assert_eq!(price_at(0).spread(), dec!(0.0002));
    }

    #[test]
    fn test_supersedes_only_newer_or_equal_quotes() {
        assert!(price_at(10).supersedes(&price_at(5)));
        assert!(price_at(10).supersedes(&price_at(10)));
        assert!(!price_at(5).supersedes(&price_at(10)));
    }
}
