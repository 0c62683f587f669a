//! Listener fan-out
//!
//! Events of one account are delivered by a single worker task in arrival order to
//! every listener registered for that account. A failing or panicking listener is
//! logged and skipped; delivery continues with the next listener and the next event.
//! The worker of an account ends once its last listener is removed.

use dashmap::DashMap;
use futures_util::FutureExt;
use log::{debug, error};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use termsync_core::{
    AccountInformation, AccountMetrics, Book, Candle, Deal, HealthStatus, InstanceIndex, Order,
    Position, SymbolPrice, SymbolSpecification, Tick,
};
use termsync_ports::{ListenerResult, SynchronizationListener, SynchronizationStart};
use tokio::sync::mpsc;

/// Synchronization event decoded from a packet
#[derive(Debug, Clone, PartialEq)]
pub enum SynchronizationEvent {
    Connected { replicas: u32 },
    HealthStatus(HealthStatus),
    Disconnected,
    BrokerConnectionStatusChanged(bool),
    SynchronizationStarted(SynchronizationStart),
    AccountInformationUpdated(AccountInformation),
    PositionsReplaced(Vec<Position>),
    PositionsSynchronized(String),
    PositionsUpdated {
        positions: Vec<Position>,
        removed_ids: Vec<String>,
    },
    PendingOrdersReplaced(Vec<Order>),
    PendingOrdersSynchronized(String),
    PendingOrdersUpdated {
        orders: Vec<Order>,
        completed_ids: Vec<String>,
    },
    HistoryOrderAdded(Order),
    HistoryOrdersSynchronized(String),
    DealAdded(Deal),
    DealsSynchronized(String),
    SymbolSpecificationsUpdated {
        specifications: Vec<SymbolSpecification>,
        removed_symbols: Vec<String>,
    },
    SymbolPricesUpdated {
        prices: Vec<SymbolPrice>,
        metrics: AccountMetrics,
    },
    CandlesUpdated {
        candles: Vec<Candle>,
        metrics: AccountMetrics,
    },
    TicksUpdated {
        ticks: Vec<Tick>,
        metrics: AccountMetrics,
    },
    BooksUpdated {
        books: Vec<Book>,
        metrics: AccountMetrics,
    },
    StreamClosed,
}

impl SynchronizationEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SynchronizationEvent::Connected { .. } => "connected",
            SynchronizationEvent::HealthStatus(_) => "healthStatus",
            SynchronizationEvent::Disconnected => "disconnected",
            SynchronizationEvent::BrokerConnectionStatusChanged(_) => "brokerConnectionStatusChanged",
            SynchronizationEvent::SynchronizationStarted(_) => "synchronizationStarted",
            SynchronizationEvent::AccountInformationUpdated(_) => "accountInformationUpdated",
            SynchronizationEvent::PositionsReplaced(_) => "positionsReplaced",
            SynchronizationEvent::PositionsSynchronized(_) => "positionsSynchronized",
            SynchronizationEvent::PositionsUpdated { .. } => "positionsUpdated",
            SynchronizationEvent::PendingOrdersReplaced(_) => "pendingOrdersReplaced",
            SynchronizationEvent::PendingOrdersSynchronized(_) => "pendingOrdersSynchronized",
            SynchronizationEvent::PendingOrdersUpdated { .. } => "pendingOrdersUpdated",
            SynchronizationEvent::HistoryOrderAdded(_) => "historyOrderAdded",
            SynchronizationEvent::HistoryOrdersSynchronized(_) => "historyOrdersSynchronized",
            SynchronizationEvent::DealAdded(_) => "dealAdded",
            SynchronizationEvent::DealsSynchronized(_) => "dealsSynchronized",
            SynchronizationEvent::SymbolSpecificationsUpdated { .. } => "symbolSpecificationsUpdated",
            SynchronizationEvent::SymbolPricesUpdated { .. } => "symbolPricesUpdated",
            SynchronizationEvent::CandlesUpdated { .. } => "candlesUpdated",
            SynchronizationEvent::TicksUpdated { .. } => "ticksUpdated",
            SynchronizationEvent::BooksUpdated { .. } => "booksUpdated",
            SynchronizationEvent::StreamClosed => "streamClosed",
        }
    }

    /// Invoke the matching callback of `listener`
    pub async fn deliver(
        &self,
        listener: &dyn SynchronizationListener,
        instance: &InstanceIndex,
    ) -> ListenerResult {
        match self {
            SynchronizationEvent::Connected { replicas } => {
                listener.on_connected(instance, *replicas).await
            }
            SynchronizationEvent::HealthStatus(status) => {
                listener.on_health_status(instance, status).await
            }
            SynchronizationEvent::Disconnected => listener.on_disconnected(instance).await,
            SynchronizationEvent::BrokerConnectionStatusChanged(connected) => {
                listener
                    .on_broker_connection_status_changed(instance, *connected)
                    .await
            }
            SynchronizationEvent::SynchronizationStarted(start) => {
                listener.on_synchronization_started(instance, start).await
            }
            SynchronizationEvent::AccountInformationUpdated(information) => {
                listener
                    .on_account_information_updated(instance, information)
                    .await
            }
            SynchronizationEvent::PositionsReplaced(positions) => {
                listener.on_positions_replaced(instance, positions).await
            }
            SynchronizationEvent::PositionsSynchronized(synchronization_id) => {
                listener
                    .on_positions_synchronized(instance, synchronization_id)
                    .await
            }
            SynchronizationEvent::PositionsUpdated {
                positions,
                removed_ids,
            } => {
                listener
                    .on_positions_updated(instance, positions, removed_ids)
                    .await
            }
            SynchronizationEvent::PendingOrdersReplaced(orders) => {
                listener.on_pending_orders_replaced(instance, orders).await
            }
            SynchronizationEvent::PendingOrdersSynchronized(synchronization_id) => {
                listener
                    .on_pending_orders_synchronized(instance, synchronization_id)
                    .await
            }
            SynchronizationEvent::PendingOrdersUpdated {
                orders,
                completed_ids,
            } => {
                listener
                    .on_pending_orders_updated(instance, orders, completed_ids)
                    .await
            }
            SynchronizationEvent::HistoryOrderAdded(order) => {
                listener.on_history_order_added(instance, order).await
            }
            SynchronizationEvent::HistoryOrdersSynchronized(synchronization_id) => {
                listener
                    .on_history_orders_synchronized(instance, synchronization_id)
                    .await
            }
            SynchronizationEvent::DealAdded(deal) => listener.on_deal_added(instance, deal).await,
            SynchronizationEvent::DealsSynchronized(synchronization_id) => {
                listener
                    .on_deals_synchronized(instance, synchronization_id)
                    .await
            }
            SynchronizationEvent::SymbolSpecificationsUpdated {
                specifications,
                removed_symbols,
            } => {
                listener
                    .on_symbol_specifications_updated(instance, specifications, removed_symbols)
                    .await
            }
            SynchronizationEvent::SymbolPricesUpdated { prices, metrics } => {
                listener
                    .on_symbol_prices_updated(instance, prices, metrics)
                    .await
            }
            SynchronizationEvent::CandlesUpdated { candles, metrics } => {
                listener.on_candles_updated(instance, candles, metrics).await
            }
            SynchronizationEvent::TicksUpdated { ticks, metrics } => {
                listener.on_ticks_updated(instance, ticks, metrics).await
            }
            SynchronizationEvent::BooksUpdated { books, metrics } => {
                listener.on_books_updated(instance, books, metrics).await
            }
            SynchronizationEvent::StreamClosed => listener.on_stream_closed(instance).await,
        }
    }
}

type Listeners = DashMap<String, Vec<Arc<dyn SynchronizationListener>>>;

pub struct ListenerFanout {
    listeners: Arc<Listeners>,
    queues: DashMap<String, mpsc::Sender<(InstanceIndex, SynchronizationEvent)>>,
    capacity: usize,
}

impl ListenerFanout {
    pub fn new(capacity: usize) -> Self {
        Self {
            listeners: Arc::new(DashMap::new()),
            queues: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn add_listener(&self, account_id: &str, listener: Arc<dyn SynchronizationListener>) {
        self.listeners
            .entry(account_id.to_string())
            .or_default()
            .push(listener);
    }

    pub fn remove_listener(&self, account_id: &str, listener: &Arc<dyn SynchronizationListener>) {
        let now_empty = match self.listeners.get_mut(account_id) {
            Some(mut listeners) => {
                listeners.retain(|registered| !Arc::ptr_eq(registered, listener));
                listeners.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.listeners.remove(account_id);
            self.queues.remove(account_id);
            debug!("{account_id}: last listener removed, event queue dropped");
        }
    }

    pub fn has_listeners(&self, account_id: &str) -> bool {
        self.listeners
            .get(account_id)
            .is_some_and(|listeners| !listeners.is_empty())
    }

    pub fn listener_count(&self, account_id: &str) -> usize {
        self.listeners
            .get(account_id)
            .map_or(0, |listeners| listeners.len())
    }

    /// Accounts with a running delivery worker
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Drop every listener and event queue
    pub fn clear(&self) {
        self.listeners.clear();
        self.queues.clear();
    }

    /// Queue an event behind earlier events of the same account. Events of an
    /// account without listeners are dropped.
    pub async fn enqueue(
        &self,
        account_id: &str,
        instance: InstanceIndex,
        event: SynchronizationEvent,
    ) {
        if !self.has_listeners(account_id) {
            debug!("{account_id}: no listeners, dropping {} event", event.name());
            return;
        }
        let sender = self.queue(account_id);
        if sender.send((instance, event)).await.is_err() {
            debug!("{account_id}: event queue closed, dropping event");
        }
    }

    fn queue(&self, account_id: &str) -> mpsc::Sender<(InstanceIndex, SynchronizationEvent)> {
        self.queues
            .entry(account_id.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(self.capacity);
                tokio::spawn(Self::run_queue(
                    account_id.to_string(),
                    self.listeners.clone(),
                    rx,
                ));
                tx
            })
            .clone()
    }

    async fn run_queue(
        account_id: String,
        listeners: Arc<Listeners>,
        mut rx: mpsc::Receiver<(InstanceIndex, SynchronizationEvent)>,
    ) {
        while let Some((instance, event)) = rx.recv().await {
            Self::dispatch(&account_id, &listeners, &instance, &event).await;
        }
    }

    async fn dispatch(
        account_id: &str,
        listeners: &Listeners,
        instance: &InstanceIndex,
        event: &SynchronizationEvent,
    ) {
        let snapshot: Vec<Arc<dyn SynchronizationListener>> = listeners
            .get(account_id)
            .map(|listeners| listeners.clone())
            .unwrap_or_default();

        for listener in snapshot {
            let delivery = AssertUnwindSafe(event.deliver(listener.as_ref(), instance));
            match delivery.catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(
                    "{account_id}:{instance}: failed to notify listener about {} event: {e}",
                    event.name()
                ),
                Err(_) => error!(
                    "{account_id}:{instance}: listener panicked on {} event",
                    event.name()
                ),
            }
        }
    }
}
