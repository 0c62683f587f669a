//! Terminal State Mirror
//!
//! Every replica of an account keeps its own view. A combined view receives every
//! incremental update and takes over the data sets of a replica once that replica
//! finishes a synchronization pass. Position, order and specification sets live in
//! the hash cache; the views only hold their hashes.

use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use termsync_cache::{CacheError, TerminalHashManager};
use termsync_core::{
    AccountInformation, AccountMetrics, AccountType, Book, Candle, InstanceIndex, Order, Position,
    SymbolPrice, SymbolSpecification, SynchronizationHashes, Tick,
};
use termsync_ports::{ListenerResult, SynchronizationListener, SynchronizationStart};
use tokio::sync::oneshot;

use crate::error::{Result, TerminalError};

type CacheResult<T> = std::result::Result<T, CacheError>;

/// Hashes of the data sets currently held by the combined view
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminalHashes {
    pub specifications_hash: Option<String>,
    pub positions_hash: Option<String>,
    pub orders_hash: Option<String>,
}

#[derive(Debug, Clone)]
struct ViewState {
    instance: InstanceIndex,
    connected: bool,
    connected_to_broker: bool,
    account_information: Option<AccountInformation>,
    specifications_hash: Option<String>,
    positions_hash: Option<String>,
    orders_hash: Option<String>,
    positions_initialized: bool,
    orders_initialized: bool,
    /// Whether a replace event is still expected in the running pass
    accept_positions: bool,
    accept_orders: bool,
    /// The next specifications packet starts a fresh snapshot
    specifications_reset: bool,
    /// A fresh specifications snapshot is being received and not yet promoted
    specifications_rebuilding: bool,
    /// A data set reported unchanged is no longer cached; the pass must be repeated
    /// without offering hashes
    requires_full_synchronization: bool,
    synchronization_id: Option<String>,
}

impl ViewState {
    fn new(instance: InstanceIndex) -> Self {
        Self {
            instance,
            connected: false,
            connected_to_broker: false,
            account_information: None,
            specifications_hash: None,
            positions_hash: None,
            orders_hash: None,
            positions_initialized: false,
            orders_initialized: false,
            accept_positions: true,
            accept_orders: true,
            specifications_reset: false,
            specifications_rebuilding: false,
            requires_full_synchronization: false,
            synchronization_id: None,
        }
    }

    fn apply_metrics(&mut self, metrics: &AccountMetrics) {
        if let Some(information) = self.account_information.as_mut() {
            information.apply_metrics(metrics);
        }
    }
}

fn specifications_hash(view: &mut ViewState) -> &mut Option<String> {
    &mut view.specifications_hash
}

fn positions_hash(view: &mut ViewState) -> &mut Option<String> {
    &mut view.positions_hash
}

fn orders_hash(view: &mut ViewState) -> &mut Option<String> {
    &mut view.orders_hash
}

struct Inner {
    instances: HashMap<InstanceIndex, ViewState>,
    combined: ViewState,
    prices: HashMap<String, SymbolPrice>,
    price_waiters: HashMap<String, Vec<oneshot::Sender<SymbolPrice>>>,
    closed: bool,
}

impl Inner {
    fn instance(&mut self, instance: &InstanceIndex) -> &mut ViewState {
        self.adopt_region(instance);
        self.instances
            .entry(instance.clone())
            .or_insert_with(|| ViewState::new(instance.clone()))
    }

    /// The combined view hashes with the ignored fields of its replicas' region
    fn adopt_region(&mut self, instance: &InstanceIndex) {
        if self.combined.instance.region != instance.region {
            self.combined.instance = InstanceIndex::combined(instance.region.clone());
        }
    }

    fn refresh_connectivity(&mut self) {
        self.combined.connected = self.instances.values().any(|state| state.connected);
        self.combined.connected_to_broker = self
            .instances
            .values()
            .any(|state| state.connected && state.connected_to_broker);
    }

    /// Specifications are owned by the broker server of the account
    fn server_name(&self, instance: &InstanceIndex) -> String {
        self.instances
            .get(instance)
            .and_then(|state| state.account_information.as_ref())
            .or(self.combined.account_information.as_ref())
            .map(|information| information.server.clone())
            .unwrap_or_default()
    }

    /// Run a cache change against the replica view and the combined view.
    /// `update` receives the reference holder and the current hash of the view.
    fn apply_to_views(
        &mut self,
        instance: &InstanceIndex,
        hash_of: fn(&mut ViewState) -> &mut Option<String>,
        mut update: impl FnMut(&InstanceIndex, Option<&str>) -> CacheResult<Option<String>>,
    ) -> CacheResult<()> {
        self.adopt_region(instance);
        let Inner {
            instances,
            combined,
            ..
        } = self;
        let state = instances
            .entry(instance.clone())
            .or_insert_with(|| ViewState::new(instance.clone()));
        for view in [state, combined] {
            let holder = view.instance.clone();
            let hash = hash_of(view);
            *hash = update(&holder, hash.as_deref())?;
        }
        Ok(())
    }
}

/// Point-in-time view of one account's terminal
pub struct TerminalState {
    account_id: String,
    account_type: AccountType,
    connection_id: String,
    hash_manager: Arc<TerminalHashManager>,
    inner: Mutex<Inner>,
}

impl TerminalState {
    pub fn new(
        account_id: impl Into<String>,
        account_type: AccountType,
        hash_manager: Arc<TerminalHashManager>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            account_type,
            connection_id: uuid::Uuid::new_v4().simple().to_string(),
            hash_manager,
            inner: Mutex::new(Inner {
                instances: HashMap::new(),
                combined: ViewState::new(InstanceIndex::combined("")),
                prices: HashMap::new(),
                price_waiters: HashMap::new(),
                closed: false,
            }),
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Holder id of the cache references of this state
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn connected(&self) -> bool {
        self.inner.lock().combined.connected
    }

    pub fn connected_to_broker(&self) -> bool {
        self.inner.lock().combined.connected_to_broker
    }

    /// True once positions and orders of some replica were fully synchronized
    pub fn synchronized(&self) -> bool {
        let inner = self.inner.lock();
        inner.combined.positions_initialized && inner.combined.orders_initialized
    }

    pub fn account_information(&self) -> Option<AccountInformation> {
        self.inner.lock().combined.account_information.clone()
    }

    pub fn instances(&self) -> Vec<InstanceIndex> {
        let mut instances: Vec<InstanceIndex> = self.inner.lock().instances.keys().cloned().collect();
        instances.sort();
        instances
    }

    pub fn positions(&self) -> Vec<Position> {
        let hash = self.inner.lock().combined.positions_hash.clone();
        let mut positions: Vec<Position> = hash
            .and_then(|hash| self.hash_manager.get_positions_by_hash(&hash))
            .map(|items| items.into_values().collect())
            .unwrap_or_default();
        positions.sort_by(|a, b| a.id.cmp(&b.id));
        positions
    }

    pub fn position(&self, id: &str) -> Option<Position> {
        let hash = self.inner.lock().combined.positions_hash.clone()?;
        self.hash_manager
            .get_positions_by_hash(&hash)?
            .remove(id)
    }

    pub fn orders(&self) -> Vec<Order> {
        let hash = self.inner.lock().combined.orders_hash.clone();
        let mut orders: Vec<Order> = hash
            .and_then(|hash| self.hash_manager.get_orders_by_hash(&hash))
            .map(|items| items.into_values().collect())
            .unwrap_or_default();
        orders.sort_by(|a, b| a.id.cmp(&b.id));
        orders
    }

    pub fn order(&self, id: &str) -> Option<Order> {
        let hash = self.inner.lock().combined.orders_hash.clone()?;
        self.hash_manager.get_orders_by_hash(&hash)?.remove(id)
    }

    pub fn specifications(&self) -> Vec<SymbolSpecification> {
        let hash = self.inner.lock().combined.specifications_hash.clone();
        let mut specifications: Vec<SymbolSpecification> = hash
            .and_then(|hash| self.hash_manager.get_specifications_by_hash(&hash))
            .map(|items| items.into_values().collect())
            .unwrap_or_default();
        specifications.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        specifications
    }

    pub fn specification(&self, symbol: &str) -> Option<SymbolSpecification> {
        let hash = self.inner.lock().combined.specifications_hash.clone()?;
        self.hash_manager
            .get_specifications_by_hash(&hash)?
            .remove(symbol)
    }

    pub fn price(&self, symbol: &str) -> Option<SymbolPrice> {
        self.inner.lock().prices.get(symbol).cloned()
    }

    pub fn prices(&self) -> Vec<SymbolPrice> {
        let mut prices: Vec<SymbolPrice> = self.inner.lock().prices.values().cloned().collect();
        prices.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        prices
    }

    /// Hashes currently held by the combined view
    pub fn current_hashes(&self) -> TerminalHashes {
        let inner = self.inner.lock();
        TerminalHashes {
            specifications_hash: inner.combined.specifications_hash.clone(),
            positions_hash: inner.combined.positions_hash.clone(),
            orders_hash: inner.combined.orders_hash.clone(),
        }
    }

    /// Recently used hashes to offer the server with a synchronize request, so that
    /// unchanged data sets are not resent
    pub fn get_hashes(&self) -> SynchronizationHashes {
        let server = self
            .account_information()
            .map(|information| information.server)
            .unwrap_or_default();
        SynchronizationHashes {
            specifications_hashes: self
                .hash_manager
                .get_last_used_specification_hashes(&server),
            positions_hashes: self
                .hash_manager
                .get_last_used_position_hashes(&self.account_id),
            orders_hashes: self.hash_manager.get_last_used_order_hashes(&self.account_id),
        }
    }

    /// Wait until a price for `symbol` is known. Every waiter of a symbol is released
    /// by the same price update.
    pub async fn wait_for_price(&self, symbol: &str, timeout: Duration) -> Result<SymbolPrice> {
        let receiver = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(TerminalError::Closed);
            }
            if let Some(price) = inner.prices.get(symbol) {
                return Ok(price.clone());
            }
            let (tx, rx) = oneshot::channel();
            let waiters = inner.price_waiters.entry(symbol.to_string()).or_default();
            waiters.retain(|waiter| !waiter.is_closed());
            waiters.push(tx);
            rx
        };

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(price)) => Ok(price),
            Ok(Err(_)) => Err(TerminalError::Cancelled),
            Err(_) => Err(TerminalError::Timeout(format!("price of {symbol}"))),
        }
    }

    /// Release every cache reference and cancel pending price waits
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.price_waiters.clear();
        inner.instances.clear();
        self.hash_manager
            .remove_all_connection_references(&self.connection_id);
        debug!("{}: terminal state closed", self.account_id);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Whether the last pass of a replica referred to data no longer cached
    pub fn requires_full_synchronization(&self, instance: &InstanceIndex) -> bool {
        self.inner
            .lock()
            .instances
            .get(instance)
            .is_some_and(|state| state.requires_full_synchronization)
    }

    /// Reference the cached data set of an unchanged hash. `false` if the hash is
    /// not cached anymore.
    fn reference_unchanged(
        &self,
        state: &mut ViewState,
        hash: Option<&String>,
        add: impl Fn(&str) -> CacheResult<()>,
        slot: fn(&mut ViewState) -> &mut Option<String>,
    ) -> CacheResult<bool> {
        let Some(hash) = hash else {
            return Ok(true);
        };
        match add(hash) {
            Ok(()) => {
                *slot(state) = Some(hash.clone());
                Ok(true)
            }
            Err(CacheError::HashNotFound(_)) => {
                *slot(state) = None;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn apply_metrics(&self, instance: &InstanceIndex, metrics: &AccountMetrics) {
        if metrics.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.instance(instance).apply_metrics(metrics);
        inner.combined.apply_metrics(metrics);
    }
}

#[async_trait]
impl SynchronizationListener for TerminalState {
    async fn on_connected(&self, instance: &InstanceIndex, _replicas: u32) -> ListenerResult {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        inner.instance(instance).connected = true;
        inner.refresh_connectivity();
        Ok(())
    }

    async fn on_disconnected(&self, instance: &InstanceIndex) -> ListenerResult {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.instances.get_mut(instance) {
            state.connected = false;
            state.connected_to_broker = false;
        }
        inner.refresh_connectivity();
        Ok(())
    }

    async fn on_broker_connection_status_changed(
        &self,
        instance: &InstanceIndex,
        connected: bool,
    ) -> ListenerResult {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        inner.instance(instance).connected_to_broker = connected;
        inner.refresh_connectivity();
        Ok(())
    }

    async fn on_synchronization_started(
        &self,
        instance: &InstanceIndex,
        start: &SynchronizationStart,
    ) -> ListenerResult {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        let state = inner.instance(instance);
        state.synchronization_id = start.synchronization_id.clone();
        state.positions_initialized = false;
        state.orders_initialized = false;
        state.accept_positions = start.positions_updated;
        state.accept_orders = start.orders_updated;
        state.specifications_reset = start.specifications_updated;
        state.specifications_rebuilding = false;

        let manager = &self.hash_manager;
        let connection_id = self.connection_id.as_str();
        let mut missing = Vec::new();
        if !start.specifications_updated
            && !self.reference_unchanged(
                state,
                start.specifications_hash.as_ref(),
                |hash| manager.add_specification_reference(hash, connection_id, instance),
                specifications_hash,
            )?
        {
            missing.push("specifications");
        }
        if !start.positions_updated
            && !self.reference_unchanged(
                state,
                start.positions_hash.as_ref(),
                |hash| manager.add_position_reference(hash, connection_id, instance),
                positions_hash,
            )?
        {
            missing.push("positions");
        }
        if !start.orders_updated
            && !self.reference_unchanged(
                state,
                start.orders_hash.as_ref(),
                |hash| manager.add_order_reference(hash, connection_id, instance),
                orders_hash,
            )?
        {
            missing.push("orders");
        }
        state.requires_full_synchronization = !missing.is_empty();
        if state.requires_full_synchronization {
            warn!(
                "{}:{instance}: cached {} of synchronization {:?} no longer available, a full pass is required",
                self.account_id,
                missing.join(", "),
                start.synchronization_id
            );
        }
        debug!(
            "{}:{instance}: synchronization {:?} started, updated: specifications={} positions={} orders={}",
            self.account_id,
            start.synchronization_id,
            start.specifications_updated,
            start.positions_updated,
            start.orders_updated
        );
        Ok(())
    }

    async fn on_account_information_updated(
        &self,
        instance: &InstanceIndex,
        account_information: &AccountInformation,
    ) -> ListenerResult {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        inner.instance(instance).account_information = Some(account_information.clone());
        inner.combined.account_information = Some(account_information.clone());
        Ok(())
    }

    async fn on_positions_replaced(
        &self,
        instance: &InstanceIndex,
        positions: &[Position],
    ) -> ListenerResult {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        let state = inner.instance(instance);
        if !state.accept_positions {
            debug!(
                "{}:{instance}: positions unchanged in this pass, ignoring replacement",
                self.account_id
            );
            return Ok(());
        }
        state.accept_positions = false;
        state.positions_hash = self.hash_manager.record_positions(
            &self.account_id,
            self.account_type,
            &self.connection_id,
            instance,
            positions.to_vec(),
        )?;
        Ok(())
    }

    async fn on_positions_synchronized(
        &self,
        instance: &InstanceIndex,
        _synchronization_id: &str,
    ) -> ListenerResult {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        let state = inner.instance(instance);
        if state.requires_full_synchronization {
            debug!(
                "{}:{instance}: positions of an incomplete pass are not promoted",
                self.account_id
            );
            return Ok(());
        }
        state.positions_initialized = true;
        let hash = state.positions_hash.clone();

        let combined = inner.combined.instance.clone();
        match &hash {
            Some(hash) => {
                self.hash_manager
                    .add_position_reference(hash, &self.connection_id, &combined)?
            }
            None => self
                .hash_manager
                .remove_position_reference(&self.connection_id, &combined),
        }
        inner.combined.positions_hash = hash;
        inner.combined.positions_initialized = true;
        Ok(())
    }

    async fn on_positions_updated(
        &self,
        instance: &InstanceIndex,
        updated: &[Position],
        removed_ids: &[String],
    ) -> ListenerResult {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        inner.apply_to_views(instance, positions_hash, |holder, parent| match parent {
            Some(parent) => self.hash_manager.update_positions(
                &self.account_id,
                self.account_type,
                &self.connection_id,
                holder,
                updated.to_vec(),
                removed_ids.to_vec(),
                parent,
            ),
            None => self.hash_manager.record_positions(
                &self.account_id,
                self.account_type,
                &self.connection_id,
                holder,
                updated.to_vec(),
            ),
        })?;
        Ok(())
    }

    async fn on_pending_orders_replaced(
        &self,
        instance: &InstanceIndex,
        orders: &[Order],
    ) -> ListenerResult {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        let state = inner.instance(instance);
        if !state.accept_orders {
            debug!(
                "{}:{instance}: orders unchanged in this pass, ignoring replacement",
                self.account_id
            );
            return Ok(());
        }
        state.accept_orders = false;
        state.orders_hash = self.hash_manager.record_orders(
            &self.account_id,
            self.account_type,
            &self.connection_id,
            instance,
            orders.to_vec(),
        )?;
        Ok(())
    }

    /// End of the pass: the combined view takes over orders and specifications
    async fn on_pending_orders_synchronized(
        &self,
        instance: &InstanceIndex,
        _synchronization_id: &str,
    ) -> ListenerResult {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        let state = inner.instance(instance);
        if state.requires_full_synchronization {
            debug!(
                "{}:{instance}: orders of an incomplete pass are not promoted",
                self.account_id
            );
            return Ok(());
        }
        state.positions_initialized = true;
        state.orders_initialized = true;
        state.specifications_rebuilding = false;
        let orders = state.orders_hash.clone();
        let specifications = state.specifications_hash.clone();

        let combined = inner.combined.instance.clone();
        match &orders {
            Some(hash) => self
                .hash_manager
                .add_order_reference(hash, &self.connection_id, &combined)?,
            None => self
                .hash_manager
                .remove_order_reference(&self.connection_id, &combined),
        }
        inner.combined.orders_hash = orders;
        inner.combined.orders_initialized = true;

        if let Some(hash) = specifications {
            self.hash_manager
                .add_specification_reference(&hash, &self.connection_id, &combined)?;
            inner.combined.specifications_hash = Some(hash);
        }
        Ok(())
    }

    async fn on_pending_orders_updated(
        &self,
        instance: &InstanceIndex,
        updated: &[Order],
        completed_ids: &[String],
    ) -> ListenerResult {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        inner.apply_to_views(instance, orders_hash, |holder, parent| match parent {
            Some(parent) => self.hash_manager.update_orders(
                &self.account_id,
                self.account_type,
                &self.connection_id,
                holder,
                updated.to_vec(),
                completed_ids.to_vec(),
                parent,
            ),
            None => self.hash_manager.record_orders(
                &self.account_id,
                self.account_type,
                &self.connection_id,
                holder,
                updated.to_vec(),
            ),
        })?;
        Ok(())
    }

    async fn on_symbol_specifications_updated(
        &self,
        instance: &InstanceIndex,
        specifications: &[SymbolSpecification],
        removed_symbols: &[String],
    ) -> ListenerResult {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        let server = inner.server_name(instance);
        let state = inner.instance(instance);
        if state.specifications_reset {
            state.specifications_reset = false;
            state.specifications_rebuilding = true;
            state.specifications_hash = None;
        }

        let update = |holder: &InstanceIndex, parent: Option<&str>| match parent {
            Some(parent) => self.hash_manager.update_specifications(
                &server,
                self.account_type,
                &self.connection_id,
                holder,
                specifications.to_vec(),
                removed_symbols.to_vec(),
                parent,
            ),
            None => self.hash_manager.record_specifications(
                &server,
                self.account_type,
                &self.connection_id,
                holder,
                specifications.to_vec(),
            ),
        };
        // The combined view keeps the previous snapshot until the pass is promoted
        if state.specifications_rebuilding {
            let holder = state.instance.clone();
            state.specifications_hash = update(&holder, state.specifications_hash.as_deref())?;
        } else {
            inner.apply_to_views(instance, specifications_hash, update)?;
        }
        Ok(())
    }

    async fn on_symbol_prices_updated(
        &self,
        instance: &InstanceIndex,
        prices: &[SymbolPrice],
        metrics: &AccountMetrics,
    ) -> ListenerResult {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Ok(());
            }
            for price in prices {
                let newer = inner
                    .prices
                    .get(&price.symbol)
                    .is_none_or(|current| price.supersedes(current));
                if !newer {
                    continue;
                }
                inner.prices.insert(price.symbol.clone(), price.clone());
                if let Some(waiters) = inner.price_waiters.remove(&price.symbol) {
                    for waiter in waiters {
                        let _ = waiter.send(price.clone());
                    }
                }
            }
        }
        self.apply_metrics(instance, metrics);
        Ok(())
    }

    async fn on_candles_updated(
        &self,
        instance: &InstanceIndex,
        _candles: &[Candle],
        metrics: &AccountMetrics,
    ) -> ListenerResult {
        self.apply_metrics(instance, metrics);
        Ok(())
    }

    async fn on_ticks_updated(
        &self,
        instance: &InstanceIndex,
        _ticks: &[Tick],
        metrics: &AccountMetrics,
    ) -> ListenerResult {
        self.apply_metrics(instance, metrics);
        Ok(())
    }

    async fn on_books_updated(
        &self,
        instance: &InstanceIndex,
        _books: &[Book],
        metrics: &AccountMetrics,
    ) -> ListenerResult {
        self.apply_metrics(instance, metrics);
        Ok(())
    }

    async fn on_stream_closed(&self, instance: &InstanceIndex) -> ListenerResult {
        let mut inner = self.inner.lock();
        if inner.instances.remove(instance).is_some() {
            self.hash_manager
                .remove_connection_references(&self.connection_id, instance);
            debug!("{}:{instance}: replica state released", self.account_id);
        }
        inner.refresh_connectivity();
        if inner.instances.is_empty() && !inner.closed {
            warn!("{}: no replica streams left", self.account_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;
    use termsync_cache::{HashCacheConfig, StaticIgnoredFieldsProvider};

    fn manager() -> Arc<TerminalHashManager> {
        Arc::new(TerminalHashManager::new(
            HashCacheConfig::default(),
            Arc::new(StaticIgnoredFieldsProvider::default()),
        ))
    }

    fn instance() -> InstanceIndex {
        InstanceIndex::new("vint-hill", 0, "ps-mpa-0")
    }

    fn position(id: &str, profit: rust_decimal::Decimal) -> Position {
        Position {
            id: id.to_string(),
            symbol: "EURUSD".to_string(),
            volume: dec!(0.1),
            profit,
            ..Default::default()
        }
    }

    fn price(symbol: &str, seconds: i64) -> SymbolPrice {
        SymbolPrice {
            symbol: symbol.to_string(),
            bid: dec!(1.0841),
            ask: dec!(1.0843),
            time: Utc.timestamp_opt(seconds, 0).unwrap(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_position_replace_then_update() {
        let state = TerminalState::new("accountId", AccountType::CloudG2, manager());
        let instance = instance();

        state
            .on_positions_replaced(&instance, &[position("1", dec!(0))])
            .await
            .unwrap();
        state.on_positions_synchronized(&instance, "s1").await.unwrap();
        state
            .on_positions_updated(&instance, &[position("1", dec!(10))], &[])
            .await
            .unwrap();

        let positions = state.positions();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].profit, dec!(10));

        state
            .on_positions_updated(&instance, &[], &["1".to_string()])
            .await
            .unwrap();
        assert!(state.positions().is_empty());
        assert!(state.position("1").is_none());
    }

    #[tokio::test]
    async fn test_unchanged_pass_reuses_cached_positions() {
        let manager = manager();
        let first = TerminalState::new("accountId", AccountType::CloudG2, manager.clone());
        let instance = instance();
        first
            .on_positions_replaced(&instance, &[position("1", dec!(5)), position("2", dec!(7))])
            .await
            .unwrap();
        first.on_positions_synchronized(&instance, "s1").await.unwrap();
        let hash = first.current_hashes().positions_hash.unwrap();

        let second = TerminalState::new("accountId", AccountType::CloudG2, manager.clone());
        second
            .on_synchronization_started(
                &instance,
                &SynchronizationStart {
                    synchronization_id: Some("s2".to_string()),
                    specifications_updated: true,
                    positions_updated: false,
                    orders_updated: true,
                    positions_hash: Some(hash.clone()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        // A replacement inside an unchanged pass is ignored
        second
            .on_positions_replaced(&instance, &[position("3", dec!(1))])
            .await
            .unwrap();
        second.on_positions_synchronized(&instance, "s2").await.unwrap();

        assert_eq!(second.positions(), first.positions());
        assert_eq!(second.current_hashes().positions_hash, Some(hash.clone()));
        assert_eq!(manager.positions_tree().reference_count(&hash), 4);
    }

    #[tokio::test]
    async fn test_orders_and_specifications_promoted_at_end_of_pass() {
        let state = TerminalState::new("accountId", AccountType::CloudG1, manager());
        let instance = instance();
        state
            .on_account_information_updated(
                &instance,
                &AccountInformation {
                    server: "ICMarketsSC-Demo".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        state
            .on_synchronization_started(&instance, &SynchronizationStart::full("s1"))
            .await
            .unwrap();
        state
            .on_symbol_specifications_updated(
                &instance,
                &[SymbolSpecification {
                    symbol: "EURUSD".to_string(),
                    digits: 5,
                    ..Default::default()
                }],
                &[],
            )
            .await
            .unwrap();
        state
            .on_pending_orders_replaced(
                &instance,
                &[Order {
                    id: "46871284".to_string(),
                    symbol: "AUDNZD".to_string(),
                    ..Default::default()
                }],
            )
            .await
            .unwrap();
        assert!(state.orders().is_empty());
        assert!(!state.synchronized());

        state.on_positions_synchronized(&instance, "s1").await.unwrap();
        state
            .on_pending_orders_synchronized(&instance, "s1")
            .await
            .unwrap();

        assert!(state.synchronized());
        assert_eq!(state.orders()[0].id, "46871284");
        assert_eq!(state.specification("EURUSD").unwrap().digits, 5);
        let hashes = state.get_hashes();
        assert_eq!(
            hashes.specifications_hashes.first(),
            state.current_hashes().specifications_hash.as_ref()
        );
        assert_eq!(
            hashes.orders_hashes.first(),
            state.current_hashes().orders_hash.as_ref()
        );
    }

    #[tokio::test]
    async fn test_specification_removal_applies_to_combined_view() {
        let state = TerminalState::new("accountId", AccountType::CloudG2, manager());
        let instance = instance();
        let specification = |symbol: &str| SymbolSpecification {
            symbol: symbol.to_string(),
            ..Default::default()
        };

        state
            .on_symbol_specifications_updated(
                &instance,
                &[specification("EURUSD"), specification("GBPUSD")],
                &[],
            )
            .await
            .unwrap();
        state
            .on_symbol_specifications_updated(&instance, &[], &["EURUSD".to_string()])
            .await
            .unwrap();

        let symbols: Vec<String> = state
            .specifications()
            .into_iter()
            .map(|specification| specification.symbol)
            .collect();
        assert_eq!(symbols, vec!["GBPUSD"]);
    }

    #[tokio::test]
    async fn test_unchanged_pass_with_uncached_hash_is_not_promoted() {
        let _ = env_logger::try_init();
        let state = TerminalState::new("accountId", AccountType::CloudG2, manager());
        let instance = instance();
        state
            .on_synchronization_started(
                &instance,
                &SynchronizationStart {
                    synchronization_id: Some("s1".to_string()),
                    specifications_updated: true,
                    positions_updated: false,
                    orders_updated: true,
                    positions_hash: Some("collected".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        state
            .on_pending_orders_replaced(
                &instance,
                &[Order {
                    id: "46871284".to_string(),
                    ..Default::default()
                }],
            )
            .await
            .unwrap();
        state.on_positions_synchronized(&instance, "s1").await.unwrap();
        state
            .on_pending_orders_synchronized(&instance, "s1")
            .await
            .unwrap();

        assert!(state.requires_full_synchronization(&instance));
        assert!(!state.synchronized());
        assert!(state.orders().is_empty());

        // The repeated pass resends everything
        state
            .on_synchronization_started(&instance, &SynchronizationStart::full("s2"))
            .await
            .unwrap();
        assert!(!state.requires_full_synchronization(&instance));
        state
            .on_positions_replaced(&instance, &[position("1", dec!(3))])
            .await
            .unwrap();
        state.on_positions_synchronized(&instance, "s2").await.unwrap();
        state
            .on_pending_orders_synchronized(&instance, "s2")
            .await
            .unwrap();

        assert!(state.synchronized());
        assert_eq!(state.positions().len(), 1);
    }

    #[tokio::test]
    async fn test_resent_specifications_replace_combined_view_at_promotion() {
        let state = TerminalState::new("accountId", AccountType::CloudG2, manager());
        let instance = instance();
        let specification = |symbol: &str| SymbolSpecification {
            symbol: symbol.to_string(),
            ..Default::default()
        };
        let symbols = |state: &TerminalState| -> Vec<String> {
            state
                .specifications()
                .into_iter()
                .map(|specification| specification.symbol)
                .collect()
        };

        state
            .on_synchronization_started(&instance, &SynchronizationStart::full("s1"))
            .await
            .unwrap();
        state
            .on_symbol_specifications_updated(
                &instance,
                &[specification("EURUSD"), specification("GBPUSD")],
                &[],
            )
            .await
            .unwrap();
        state.on_positions_synchronized(&instance, "s1").await.unwrap();
        state
            .on_pending_orders_synchronized(&instance, "s1")
            .await
            .unwrap();
        assert_eq!(symbols(&state), vec!["EURUSD", "GBPUSD"]);

        state
            .on_synchronization_started(&instance, &SynchronizationStart::full("s2"))
            .await
            .unwrap();
        state
            .on_symbol_specifications_updated(&instance, &[specification("USDJPY")], &[])
            .await
            .unwrap();
        state
            .on_symbol_specifications_updated(&instance, &[specification("GBPUSD")], &[])
            .await
            .unwrap();
        assert_eq!(
            symbols(&state),
            vec!["EURUSD", "GBPUSD"],
            "previous snapshot stays visible while the new one is received"
        );

        state.on_positions_synchronized(&instance, "s2").await.unwrap();
        state
            .on_pending_orders_synchronized(&instance, "s2")
            .await
            .unwrap();
        assert_eq!(symbols(&state), vec!["GBPUSD", "USDJPY"]);

        // Incremental changes after the pass reach the combined view right away
        state
            .on_symbol_specifications_updated(&instance, &[], &["USDJPY".to_string()])
            .await
            .unwrap();
        assert_eq!(symbols(&state), vec!["GBPUSD"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_price_released_by_update() {
        let state = Arc::new(TerminalState::new("accountId", AccountType::CloudG2, manager()));

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let state = state.clone();
                tokio::spawn(async move {
                    state
                        .wait_for_price("EURUSD", Duration::from_secs(5))
                        .await
                })
            })
            .collect();
        tokio::time::sleep(Duration::from_secs(1)).await;
        state
            .on_symbol_prices_updated(
                &instance(),
                &[price("EURUSD", 100)],
                &AccountMetrics::default(),
            )
            .await
            .unwrap();

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().unwrap().symbol, "EURUSD");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_price_times_out() {
        let state = TerminalState::new("accountId", AccountType::CloudG2, manager());

        let result = state.wait_for_price("GBPUSD", Duration::from_secs(5)).await;

        assert!(matches!(result, Err(TerminalError::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_price_waits() {
        let state = Arc::new(TerminalState::new("accountId", AccountType::CloudG2, manager()));
        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.wait_for_price("EURUSD", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        state.close();

        assert_eq!(waiter.await.unwrap(), Err(TerminalError::Cancelled));
        assert_eq!(
            state.wait_for_price("EURUSD", Duration::from_secs(1)).await,
            Err(TerminalError::Closed)
        );
    }

    #[tokio::test]
    async fn test_stale_price_does_not_replace_newer() {
        let state = TerminalState::new("accountId", AccountType::CloudG2, manager());
        let instance = instance();
        let mut newer = price("EURUSD", 200);
        newer.bid = dec!(1.1);

        state
            .on_symbol_prices_updated(&instance, &[newer], &AccountMetrics::default())
            .await
            .unwrap();
        state
            .on_symbol_prices_updated(&instance, &[price("EURUSD", 100)], &AccountMetrics::default())
            .await
            .unwrap();

        assert_eq!(state.price("EURUSD").unwrap().bid, dec!(1.1));
    }

    #[tokio::test]
    async fn test_price_metrics_update_account_information() {
        let state = TerminalState::new("accountId", AccountType::CloudG2, manager());
        let instance = instance();
        state
            .on_account_information_updated(
                &instance,
                &AccountInformation {
                    balance: dec!(1000),
                    equity: dec!(1000),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        state
            .on_candles_updated(
                &instance,
                &[],
                &AccountMetrics {
                    equity: Some(dec!(1012.5)),
                    margin_level: Some(dec!(540)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let information = state.account_information().unwrap();
        assert_eq!(information.equity, dec!(1012.5));
        assert_eq!(information.margin_level, Some(dec!(540)));
        assert_eq!(information.balance, dec!(1000));
    }

    #[tokio::test]
    async fn test_connectivity_follows_replicas() {
        let state = TerminalState::new("accountId", AccountType::CloudG2, manager());
        let first = instance();
        let second = InstanceIndex::new("vint-hill", 1, "ps-mpa-1");

        state.on_connected(&first, 2).await.unwrap();
        state.on_connected(&second, 2).await.unwrap();
        state
            .on_broker_connection_status_changed(&second, true)
            .await
            .unwrap();
        assert!(state.connected_to_broker());

        state.on_disconnected(&second).await.unwrap();
        assert!(state.connected());
        assert!(!state.connected_to_broker());

        state.on_stream_closed(&first).await.unwrap();
        assert!(!state.connected());
        assert_eq!(state.instances(), vec![second]);
    }

    #[tokio::test]
    async fn test_stream_closed_releases_replica_references() {
        let manager = manager();
        let state = TerminalState::new("accountId", AccountType::CloudG2, manager.clone());
        let instance = instance();
        state
            .on_positions_replaced(&instance, &[position("1", dec!(1))])
            .await
            .unwrap();
        state.on_positions_synchronized(&instance, "s1").await.unwrap();
        let hash = state.current_hashes().positions_hash.unwrap();
        assert_eq!(manager.positions_tree().reference_count(&hash), 2);

        state.on_stream_closed(&instance).await.unwrap();
        assert_eq!(manager.positions_tree().reference_count(&hash), 1);
        assert_eq!(state.positions().len(), 1);

        state.close();
        assert_eq!(manager.positions_tree().reference_count(&hash), 0);
    }
}
