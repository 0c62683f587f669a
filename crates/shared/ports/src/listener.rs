//! Synchronization listener capability
//!
//! Consumers implement only the callbacks they care about; every method has a
//! no-op default. Batch callbacks default to calling their per-item counterparts.

use async_trait::async_trait;
use termsync_core::{
    AccountInformation, AccountMetrics, Book, Candle, Deal, HealthStatus, InstanceIndex, Order,
    Position, SymbolPrice, SymbolSpecification, Tick,
};

use crate::error::ListenerResult;

/// What a `synchronizationStarted` packet announced for each data set.
///
/// A data set that is not updated keeps the state identified by its hash (when the
/// server referenced one of the hashes sent with the synchronize request).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SynchronizationStart {
    pub synchronization_id: Option<String>,
    pub specifications_updated: bool,
    pub positions_updated: bool,
    pub orders_updated: bool,
    pub specifications_hash: Option<String>,
    pub positions_hash: Option<String>,
    pub orders_hash: Option<String>,
}

impl SynchronizationStart {
    /// A pass in which the server resends everything
    pub fn full(synchronization_id: impl Into<String>) -> Self {
        Self {
            synchronization_id: Some(synchronization_id.into()),
            specifications_updated: true,
            positions_updated: true,
            orders_updated: true,
            ..Default::default()
        }
    }
}

/// Receives terminal synchronization events for one account
#[async_trait]
pub trait SynchronizationListener: Send + Sync {
    /// Subscription to the replica was authenticated
    async fn on_connected(&self, _instance: &InstanceIndex, _replicas: u32) -> ListenerResult {
        Ok(())
    }

    async fn on_health_status(
        &self,
        _instance: &InstanceIndex,
        _status: &HealthStatus,
    ) -> ListenerResult {
        Ok(())
    }

    /// Connection to the replica was lost
    async fn on_disconnected(&self, _instance: &InstanceIndex) -> ListenerResult {
        Ok(())
    }

    async fn on_broker_connection_status_changed(
        &self,
        _instance: &InstanceIndex,
        _connected: bool,
    ) -> ListenerResult {
        Ok(())
    }

    async fn on_synchronization_started(
        &self,
        _instance: &InstanceIndex,
        _start: &SynchronizationStart,
    ) -> ListenerResult {
        Ok(())
    }

    async fn on_account_information_updated(
        &self,
        _instance: &InstanceIndex,
        _account_information: &AccountInformation,
    ) -> ListenerResult {
        Ok(())
    }

    /// All open positions, replacing whatever was known before
    async fn on_positions_replaced(
        &self,
        _instance: &InstanceIndex,
        _positions: &[Position],
    ) -> ListenerResult {
        Ok(())
    }

    async fn on_positions_synchronized(
        &self,
        _instance: &InstanceIndex,
        _synchronization_id: &str,
    ) -> ListenerResult {
        Ok(())
    }

    /// Incremental position change from one `update` packet
    async fn on_positions_updated(
        &self,
        instance: &InstanceIndex,
        updated: &[Position],
        removed_ids: &[String],
    ) -> ListenerResult {
        for position in updated {
            self.on_position_updated(instance, position).await?;
        }
        for id in removed_ids {
            self.on_position_removed(instance, id).await?;
        }
        Ok(())
    }

    async fn on_position_updated(
        &self,
        _instance: &InstanceIndex,
        _position: &Position,
    ) -> ListenerResult {
        Ok(())
    }

    async fn on_position_removed(&self, _instance: &InstanceIndex, _position_id: &str) -> ListenerResult {
        Ok(())
    }

    async fn on_pending_orders_replaced(
        &self,
        _instance: &InstanceIndex,
        _orders: &[Order],
    ) -> ListenerResult {
        Ok(())
    }

    async fn on_pending_orders_synchronized(
        &self,
        _instance: &InstanceIndex,
        _synchronization_id: &str,
    ) -> ListenerResult {
        Ok(())
    }

    /// Incremental pending order change from one `update` packet
    async fn on_pending_orders_updated(
        &self,
        instance: &InstanceIndex,
        updated: &[Order],
        completed_ids: &[String],
    ) -> ListenerResult {
        for order in updated {
            self.on_pending_order_updated(instance, order).await?;
        }
        for id in completed_ids {
            self.on_pending_order_completed(instance, id).await?;
        }
        Ok(())
    }

    async fn on_pending_order_updated(&self, _instance: &InstanceIndex, _order: &Order) -> ListenerResult {
        Ok(())
    }

    async fn on_pending_order_completed(
        &self,
        _instance: &InstanceIndex,
        _order_id: &str,
    ) -> ListenerResult {
        Ok(())
    }

    async fn on_history_order_added(
        &self,
        _instance: &InstanceIndex,
        _history_order: &Order,
    ) -> ListenerResult {
        Ok(())
    }

    async fn on_history_orders_synchronized(
        &self,
        _instance: &InstanceIndex,
        _synchronization_id: &str,
    ) -> ListenerResult {
        Ok(())
    }

    async fn on_deal_added(&self, _instance: &InstanceIndex, _deal: &Deal) -> ListenerResult {
        Ok(())
    }

    async fn on_deals_synchronized(
        &self,
        _instance: &InstanceIndex,
        _synchronization_id: &str,
    ) -> ListenerResult {
        Ok(())
    }

    /// Specification upserts and removals from one `specifications` packet
    async fn on_symbol_specifications_updated(
        &self,
        instance: &InstanceIndex,
        specifications: &[SymbolSpecification],
        removed_symbols: &[String],
    ) -> ListenerResult {
        for specification in specifications {
            self.on_symbol_specification_updated(instance, specification)
                .await?;
        }
        for symbol in removed_symbols {
            self.on_symbol_specification_removed(instance, symbol).await?;
        }
        Ok(())
    }

    async fn on_symbol_specification_updated(
        &self,
        _instance: &InstanceIndex,
        _specification: &SymbolSpecification,
    ) -> ListenerResult {
        Ok(())
    }

    async fn on_symbol_specification_removed(
        &self,
        _instance: &InstanceIndex,
        _symbol: &str,
    ) -> ListenerResult {
        Ok(())
    }

    /// Quote batch with the account figures pushed alongside it
    async fn on_symbol_prices_updated(
        &self,
        instance: &InstanceIndex,
        prices: &[SymbolPrice],
        _metrics: &AccountMetrics,
    ) -> ListenerResult {
        for price in prices {
            self.on_symbol_price_updated(instance, price).await?;
        }
        Ok(())
    }

    async fn on_symbol_price_updated(
        &self,
        _instance: &InstanceIndex,
        _price: &SymbolPrice,
    ) -> ListenerResult {
        Ok(())
    }

    async fn on_candles_updated(
        &self,
        _instance: &InstanceIndex,
        _candles: &[Candle],
        _metrics: &AccountMetrics,
    ) -> ListenerResult {
        Ok(())
    }

    async fn on_ticks_updated(
        &self,
        _instance: &InstanceIndex,
        _ticks: &[Tick],
        _metrics: &AccountMetrics,
    ) -> ListenerResult {
        Ok(())
    }

    async fn on_books_updated(
        &self,
        _instance: &InstanceIndex,
        _books: &[Book],
        _metrics: &AccountMetrics,
    ) -> ListenerResult {
        Ok(())
    }

    /// The replica stream ended (heartbeat loss or explicit disconnect)
    async fn on_stream_closed(&self, _instance: &InstanceIndex) -> ListenerResult {
        Ok(())
    }
}

/// Notified when a transport channel of a region reconnected
#[async_trait]
pub trait ReconnectListener: Send + Sync {
    async fn on_reconnected(&self, region: &str, instance_number: u32) -> ListenerResult;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RemovalRecorder {
        removed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SynchronizationListener for RemovalRecorder {
        async fn on_position_removed(
            &self,
            _instance: &InstanceIndex,
            position_id: &str,
        ) -> ListenerResult {
            self.removed.lock().unwrap().push(position_id.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_batch_callbacks_fan_out_to_item_callbacks() {
        let recorder = RemovalRecorder::default();
        let instance = InstanceIndex::new("vint-hill", 0, "ps-mpa-1");

        recorder
            .on_positions_updated(&instance, &[Position::default()], &["1".into(), "2".into()])
            .await
            .unwrap();

        assert_eq!(*recorder.removed.lock().unwrap(), vec!["1", "2"]);
    }

    #[tokio::test]
    async fn test_default_callbacks_are_no_ops() {
        let recorder = RemovalRecorder::default();
        let instance = InstanceIndex::combined("vint-hill");

        assert!(recorder.on_connected(&instance, 1).await.is_ok());
        assert!(recorder.on_stream_closed(&instance).await.is_ok());
    }

    // Ensure traits are object-safe
    fn _assert_listener_object_safe(_: &dyn SynchronizationListener) {}
    fn _assert_reconnect_listener_object_safe(_: &dyn ReconnectListener) {}
}
