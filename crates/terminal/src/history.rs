//! In-memory order and deal history

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use termsync_core::{Deal, InstanceIndex, Order};
use termsync_ports::{HistoryStorage, ListenerResult, SynchronizationListener, SynchronizationStart};

#[derive(Debug, Default)]
struct Inner {
    deals: HashMap<String, Deal>,
    history_orders: HashMap<String, Order>,
    last_deal_time: HashMap<u32, DateTime<Utc>>,
    last_history_order_time: HashMap<u32, DateTime<Utc>>,
    orders_finished: HashMap<u32, bool>,
    deals_finished: HashMap<u32, bool>,
}

fn latest(times: &HashMap<u32, DateTime<Utc>>, instance_number: Option<u32>) -> Option<DateTime<Utc>> {
    match instance_number {
        Some(number) => times.get(&number).copied(),
        None => times.values().max().copied(),
    }
}

/// Time a history order is filed under
fn order_time(order: &Order) -> Option<DateTime<Utc>> {
    order.done_time.or(order.time)
}

/// History storage kept in process memory.
///
/// Records are deduplicated by id; a record arriving again replaces the stored one.
#[derive(Debug, Default)]
pub struct MemoryHistoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryHistoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStorage for MemoryHistoryStorage {
    fn last_history_order_time(&self, instance_number: Option<u32>) -> Option<DateTime<Utc>> {
        latest(&self.inner.lock().last_history_order_time, instance_number)
    }

    fn last_deal_time(&self, instance_number: Option<u32>) -> Option<DateTime<Utc>> {
        latest(&self.inner.lock().last_deal_time, instance_number)
    }

    fn order_synchronization_finished(&self) -> bool {
        self.inner.lock().orders_finished.values().any(|finished| *finished)
    }

    fn deal_synchronization_finished(&self) -> bool {
        self.inner.lock().deals_finished.values().any(|finished| *finished)
    }

    fn history_orders(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self.inner.lock().history_orders.values().cloned().collect();
        orders.sort_by(|a, b| {
            order_time(a)
                .cmp(&order_time(b))
                .then_with(|| a.id.cmp(&b.id))
        });
        orders
    }

    fn deals(&self) -> Vec<Deal> {
        let mut deals: Vec<Deal> = self.inner.lock().deals.values().cloned().collect();
        deals.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.id.cmp(&b.id)));
        deals
    }

    async fn clear(&self) {
        *self.inner.lock() = Inner::default();
    }

    fn as_listener(self: Arc<Self>) -> Arc<dyn SynchronizationListener> {
        self
    }
}

#[async_trait]
impl SynchronizationListener for MemoryHistoryStorage {
    async fn on_synchronization_started(
        &self,
        instance: &InstanceIndex,
        _start: &SynchronizationStart,
    ) -> ListenerResult {
        let mut inner = self.inner.lock();
        inner.orders_finished.insert(instance.number, false);
        inner.deals_finished.insert(instance.number, false);
        Ok(())
    }

    async fn on_history_order_added(
        &self,
        instance: &InstanceIndex,
        history_order: &Order,
    ) -> ListenerResult {
        let mut inner = self.inner.lock();
        if let Some(time) = order_time(history_order) {
            let last = inner
                .last_history_order_time
                .entry(instance.number)
                .or_insert(time);
            *last = (*last).max(time);
        }
        inner
            .history_orders
            .insert(history_order.id.clone(), history_order.clone());
        Ok(())
    }

    async fn on_history_orders_synchronized(
        &self,
        instance: &InstanceIndex,
        _synchronization_id: &str,
    ) -> ListenerResult {
        self.inner.lock().orders_finished.insert(instance.number, true);
        Ok(())
    }

    async fn on_deal_added(&self, instance: &InstanceIndex, deal: &Deal) -> ListenerResult {
        let mut inner = self.inner.lock();
        let last = inner.last_deal_time.entry(instance.number).or_insert(deal.time);
        *last = (*last).max(deal.time);
        inner.deals.insert(deal.id.clone(), deal.clone());
        Ok(())
    }

    async fn on_deals_synchronized(
        &self,
        instance: &InstanceIndex,
        _synchronization_id: &str,
    ) -> ListenerResult {
        self.inner.lock().deals_finished.insert(instance.number, true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn instance(number: u32) -> InstanceIndex {
        InstanceIndex::new("vint-hill", number, format!("ps-mpa-{number}"))
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).unwrap()
    }

    fn deal(id: &str, seconds: i64) -> Deal {
        Deal {
            id: id.to_string(),
            time: at(seconds),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_deals_ordered_by_time_and_deduplicated() {
        let storage = MemoryHistoryStorage::new();
        let instance = instance(0);

        storage.on_deal_added(&instance, &deal("3", 300)).await.unwrap();
        storage.on_deal_added(&instance, &deal("1", 100)).await.unwrap();
        let mut updated = deal("3", 300);
        updated.profit = dec!(-4.5);
        storage.on_deal_added(&instance, &updated).await.unwrap();

        let deals = storage.deals();
        assert_eq!(deals.len(), 2);
        assert_eq!(deals[0].id, "1");
        assert_eq!(deals[1].profit, dec!(-4.5));
        assert_eq!(storage.last_deal_time(Some(0)), Some(at(300)));
    }

    #[tokio::test]
    async fn test_last_times_tracked_per_replica() {
        let storage = MemoryHistoryStorage::new();

        storage.on_deal_added(&instance(0), &deal("1", 100)).await.unwrap();
        storage.on_deal_added(&instance(1), &deal("2", 200)).await.unwrap();
        storage
            .on_history_order_added(
                &instance(1),
                &Order {
                    id: "46214692".to_string(),
                    time: Some(at(50)),
                    done_time: Some(at(60)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(storage.last_deal_time(Some(0)), Some(at(100)));
        assert_eq!(storage.last_deal_time(None), Some(at(200)));
        assert_eq!(storage.last_history_order_time(Some(1)), Some(at(60)));
        assert_eq!(storage.last_history_order_time(Some(0)), None);
    }

    #[tokio::test]
    async fn test_finished_flags_reset_on_new_pass() {
        let storage = MemoryHistoryStorage::new();
        let instance = instance(0);

        storage
            .on_synchronization_started(&instance, &SynchronizationStart::full("s1"))
            .await
            .unwrap();
        storage.on_history_orders_synchronized(&instance, "s1").await.unwrap();
        storage.on_deals_synchronized(&instance, "s1").await.unwrap();
        assert!(storage.order_synchronization_finished());
        assert!(storage.deal_synchronization_finished());

        storage
            .on_synchronization_started(&instance, &SynchronizationStart::full("s2"))
            .await
            .unwrap();
        assert!(!storage.order_synchronization_finished());
        assert!(!storage.deal_synchronization_finished());
    }

    #[tokio::test]
    async fn test_clear() {
        let storage = Arc::new(MemoryHistoryStorage::new());
        storage.on_deal_added(&instance(0), &deal("1", 100)).await.unwrap();

        storage.clear().await;

        assert!(storage.deals().is_empty());
        assert_eq!(storage.last_deal_time(None), None);
    }
}
