//! Inbound synchronization packets.
//!
//! Every packet carries the account it belongs to, the replica (instance number + host)
//! that produced it and, for sequenced streams, a sequence number. The type specific body
//! is flattened next to those fields and tagged by `type`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::entities::{
    AccountInformation, AccountMetrics, Book, Candle, Deal, HealthStatus, Order, Position,
    SymbolPrice, SymbolSpecification, Tick,
};
use crate::identifiers::InstanceIndex;
use crate::values::ids_from_strings_or_numbers;

/// A single packet received from the streaming transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynchronizationPacket {
    pub account_id: String,

    /// Replica number, 0 when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_index: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<u64>,

    /// Server time the sequence was assigned, milliseconds since epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_timestamp: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synchronization_id: Option<String>,

    #[serde(flatten)]
    pub payload: PacketPayload,

    /// Local receive time, set by the router
    #[serde(skip)]
    pub received_at: Option<DateTime<Utc>>,
}

/// Type specific packet body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum PacketPayload {
    /// The replica accepted the subscription
    Authenticated {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        replicas: Option<u32>,
    },

    /// The replica dropped the subscription
    Disconnected,

    /// Heartbeat carrying broker connectivity
    Status {
        #[serde(default)]
        connected: bool,
        #[serde(default)]
        health_status: Option<HealthStatus>,
    },

    /// A synchronization pass begins.
    ///
    /// A `*HashIndex` refers to the hash list sent with the synchronize request and
    /// means that data set is unchanged since that hash. Older servers send the
    /// `*Updated` flags instead.
    SynchronizationStarted {
        #[serde(default)]
        specifications_hash_index: Option<usize>,
        #[serde(default)]
        positions_hash_index: Option<usize>,
        #[serde(default)]
        orders_hash_index: Option<usize>,
        #[serde(default)]
        specifications_updated: Option<bool>,
        #[serde(default)]
        positions_updated: Option<bool>,
        #[serde(default)]
        orders_updated: Option<bool>,
    },

    AccountInformation {
        #[serde(default)]
        account_information: Option<AccountInformation>,
    },

    /// Full replacement of open positions
    Positions {
        #[serde(default)]
        positions: Vec<Position>,
    },

    /// Full replacement of pending orders
    Orders {
        #[serde(default)]
        orders: Vec<Order>,
    },

    /// Specification upserts and removals
    Specifications {
        #[serde(default)]
        specifications: Vec<SymbolSpecification>,
        #[serde(default)]
        removed_symbols: Vec<String>,
    },

    /// Incremental change of terminal state
    Update {
        #[serde(default)]
        account_information: Option<AccountInformation>,
        #[serde(default)]
        updated_positions: Vec<Position>,
        #[serde(default, deserialize_with = "ids_from_strings_or_numbers")]
        removed_position_ids: Vec<String>,
        #[serde(default)]
        updated_orders: Vec<Order>,
        #[serde(default, deserialize_with = "ids_from_strings_or_numbers")]
        completed_order_ids: Vec<String>,
        #[serde(default)]
        history_orders: Vec<Order>,
        #[serde(default)]
        deals: Vec<Deal>,
    },

    /// Quote batch, optionally with market data and account figures
    Prices {
        #[serde(default)]
        prices: Vec<SymbolPrice>,
        #[serde(default)]
        candles: Vec<Candle>,
        #[serde(default)]
        ticks: Vec<Tick>,
        #[serde(default)]
        books: Vec<Book>,
        #[serde(default)]
        equity: Option<Decimal>,
        #[serde(default)]
        margin: Option<Decimal>,
        #[serde(default)]
        free_margin: Option<Decimal>,
        #[serde(default)]
        margin_level: Option<Decimal>,
    },

    HistoryOrders {
        #[serde(default)]
        history_orders: Vec<Order>,
    },

    Deals {
        #[serde(default)]
        deals: Vec<Deal>,
    },

    OrderSynchronizationFinished,

    DealSynchronizationFinished,
}

impl PacketPayload {
    /// Wire name of the packet type
    pub fn type_name(&self) -> &'static str {
        match self {
            PacketPayload::Authenticated { .. } => "authenticated",
            PacketPayload::Disconnected => "disconnected",
            PacketPayload::Status { .. } => "status",
            PacketPayload::SynchronizationStarted { .. } => "synchronizationStarted",
            PacketPayload::AccountInformation { .. } => "accountInformation",
            PacketPayload::Positions { .. } => "positions",
            PacketPayload::Orders { .. } => "orders",
            PacketPayload::Specifications { .. } => "specifications",
            PacketPayload::Update { .. } => "update",
            PacketPayload::Prices { .. } => "prices",
            PacketPayload::HistoryOrders { .. } => "historyOrders",
            PacketPayload::Deals { .. } => "deals",
            PacketPayload::OrderSynchronizationFinished => "orderSynchronizationFinished",
            PacketPayload::DealSynchronizationFinished => "dealSynchronizationFinished",
        }
    }
}

impl SynchronizationPacket {
    pub fn new(account_id: impl Into<String>, payload: PacketPayload) -> Self {
        Self {
            account_id: account_id.into(),
            instance_index: None,
            host: None,
            sequence_number: None,
            sequence_timestamp: None,
            synchronization_id: None,
            payload,
            received_at: None,
        }
    }

    pub fn with_instance(mut self, number: u32, host: impl Into<String>) -> Self {
        self.instance_index = Some(number);
        self.host = Some(host.into());
        self
    }

    pub fn with_sequence(mut self, sequence_number: u64, sequence_timestamp: i64) -> Self {
        self.sequence_number = Some(sequence_number);
        self.sequence_timestamp = Some(sequence_timestamp);
        self
    }

    pub fn with_synchronization_id(mut self, synchronization_id: impl Into<String>) -> Self {
        self.synchronization_id = Some(synchronization_id.into());
        self
    }

    pub fn instance_number(&self) -> u32 {
        self.instance_index.unwrap_or(0)
    }

    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or("")
    }

    /// Key of the ordered stream this packet belongs to: `account:number:host`
    pub fn stream_id(&self) -> String {
        format!("{}:{}:{}", self.account_id, self.instance_number(), self.host())
    }

    /// Full instance index within `region`
    pub fn instance(&self, region: &str) -> InstanceIndex {
        InstanceIndex::new(region, self.instance_number(), self.host())
    }

    pub fn type_name(&self) -> &'static str {
        self.payload.type_name()
    }

    /// A `synchronizationStarted` packet with a synchronization id opens a new session
    /// and restarts sequence numbering for its stream.
    pub fn is_session_start(&self) -> bool {
        matches!(self.payload, PacketPayload::SynchronizationStarted { .. })
            && self.synchronization_id.is_some()
    }

    /// Account figures carried by a `prices` packet
    pub fn account_metrics(&self) -> Option<AccountMetrics> {
        match &self.payload {
            PacketPayload::Prices {
                equity,
                margin,
                free_margin,
                margin_level,
                ..
            } => Some(AccountMetrics {
                equity: *equity,
                margin: *margin,
                free_margin: *free_margin,
                margin_level: *margin_level,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_parse_sequenced_positions_packet() {
        let packet: SynchronizationPacket = serde_json::from_value(json!({
            "type": "positions",
            "accountId": "accountId",
            "instanceIndex": 1,
            "host": "ps-mpa-1",
            "sequenceNumber": 12,
            "sequenceTimestamp": 1603124267178i64,
            "synchronizationId": "synchronizationId",
            "positions": [{"id": "46214692", "type": "POSITION_TYPE_BUY", "symbol": "GBPUSD"}]
        }))
        .unwrap();

        assert_eq!(packet.stream_id(), "accountId:1:ps-mpa-1");
        assert_eq!(packet.sequence_number, Some(12));
        assert_eq!(packet.instance("vint-hill").to_string(), "vint-hill:1:ps-mpa-1");
        match packet.payload {
            PacketPayload::Positions { positions } => assert_eq!(positions[0].id, "46214692"),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_parse_update_with_numeric_ids() {
        let packet: SynchronizationPacket = serde_json::from_value(json!({
            "type": "update",
            "accountId": "accountId",
            "removedPositionIds": [1234],
            "completedOrderIds": ["2345"]
        }))
        .unwrap();

        match packet.payload {
            PacketPayload::Update {
                removed_position_ids,
                completed_order_ids,
                updated_positions,
                ..
            } => {
                assert_eq!(removed_position_ids, vec!["1234"]);
                assert_eq!(completed_order_ids, vec!["2345"]);
                assert!(updated_positions.is_empty());
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_session_start_requires_synchronization_id() {
        let started = PacketPayload::SynchronizationStarted {
            specifications_hash_index: None,
            positions_hash_index: Some(0),
            orders_hash_index: None,
            specifications_updated: None,
            positions_updated: None,
            orders_updated: None,
        };

        let anonymous = SynchronizationPacket::new("a", started.clone());
        assert!(!anonymous.is_session_start());
        assert!(anonymous.with_synchronization_id("s1").is_session_start());
    }

    #[test]
    fn test_prices_packet_metrics() {
        let packet: SynchronizationPacket = serde_json::from_value(json!({
            "type": "prices",
            "accountId": "accountId",
            "prices": [{"symbol": "EURUSD", "bid": 1.0841, "ask": 1.0843,
                        "time": "2020-04-15T02:45:06.521Z"}],
            "equity": 100,
            "freeMargin": 75.5
        }))
        .unwrap();

        let metrics = packet.account_metrics().unwrap();
        assert_eq!(metrics.equity, Some(dec!(100)));
        assert_eq!(metrics.free_margin, Some(dec!(75.5)));
        assert!(metrics.margin.is_none());
        assert_eq!(packet.type_name(), "prices");
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let parsed = serde_json::from_value::<SynchronizationPacket>(json!({
            "type": "somethingElse",
            "accountId": "accountId"
        }));
        assert!(parsed.is_err());
    }
}
