use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use termsync_core::{Deal, Order};

use crate::listener::SynchronizationListener;

/// Durable order / deal history, fed by the same event stream as the terminal mirror.
///
/// The last record times tell the next synchronize request where history should
/// resume; the finished flags tell a connection whether history is complete.
#[async_trait]
pub trait HistoryStorage: SynchronizationListener {
    /// Time of the newest history order, for one replica or across all of them
    fn last_history_order_time(&self, instance_number: Option<u32>) -> Option<DateTime<Utc>>;

    /// Time of the newest deal, for one replica or across all of them
    fn last_deal_time(&self, instance_number: Option<u32>) -> Option<DateTime<Utc>>;

    /// True once any replica finished synchronizing history orders
    fn order_synchronization_finished(&self) -> bool;

    /// True once any replica finished synchronizing deals
    fn deal_synchronization_finished(&self) -> bool;

    fn history_orders(&self) -> Vec<Order>;

    fn deals(&self) -> Vec<Deal>;

    /// Drop all stored history
    async fn clear(&self);

    /// View of the storage as a plain listener, for registration with the fan-out
    fn as_listener(self: Arc<Self>) -> Arc<dyn SynchronizationListener>;
}
