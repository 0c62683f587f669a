//! Terminal hash manager
//!
//! Facade over the three reference trees. Specifications are shared by every account
//! of a broker server and are owned by the server name; positions and orders are
//! owned by the account id.

use log::{debug, info};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use termsync_core::{AccountType, InstanceIndex, Order, Position, SymbolSpecification};
use termsync_ports::{IgnoredFieldsProvider, ProviderError};
use tokio::task::JoinHandle;

use crate::config::HashCacheConfig;
use crate::error::Result;
use crate::ignored_fields::IgnoredFieldsCache;
use crate::reference_tree::{ReferenceKey, ReferenceTree, TreeOptions};

pub struct TerminalHashManager {
    config: HashCacheConfig,
    ignored_fields: IgnoredFieldsCache,
    specifications: ReferenceTree<SymbolSpecification>,
    positions: ReferenceTree<Position>,
    orders: ReferenceTree<Order>,
    jobs: Mutex<Vec<JoinHandle<()>>>,
}

impl TerminalHashManager {
    pub fn new(config: HashCacheConfig, provider: Arc<dyn IgnoredFieldsProvider>) -> Self {
        let options = TreeOptions {
            fuzzy_search: false,
            keep_hash_trees: config.keep_hash_trees,
            retention: config.retention(),
            last_used_limit: config.last_used_hashes_limit,
            share_across_owners: false,
        };
        let specification_options = TreeOptions {
            fuzzy_search: config.use_fuzzy_search,
            share_across_owners: true,
            ..options.clone()
        };

        Self {
            ignored_fields: IgnoredFieldsCache::new(provider),
            specifications: ReferenceTree::new("specifications", specification_options),
            positions: ReferenceTree::new("positions", options.clone()),
            orders: ReferenceTree::new("orders", options),
            jobs: Mutex::new(Vec::new()),
            config,
        }
    }

    pub fn config(&self) -> &HashCacheConfig {
        &self.config
    }

    /// Start the periodic garbage collection and ignored-field refresh jobs.
    /// The jobs hold a weak handle and end when the manager is dropped.
    pub fn start(self: &Arc<Self>) {
        let mut jobs = self.jobs.lock();
        if !jobs.is_empty() {
            return;
        }

        let weak = Arc::downgrade(self);
        let period = self.config.garbage_collection_interval();
        jobs.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.collect_garbage();
            }
        }));

        let weak = Arc::downgrade(self);
        let period = self.config.ignored_fields_refresh_interval();
        jobs.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.ignored_fields.refresh_all().await;
            }
        }));
        info!("hash cache jobs started");
    }

    pub fn stop(&self) {
        for job in self.jobs.lock().drain(..) {
            job.abort();
        }
    }

    /// Load the ignored field lists of a region unless already cached
    pub async fn ensure_ignored_field_lists(&self, region: &str) -> std::result::Result<(), ProviderError> {
        if self.ignored_fields.is_loaded(region) {
            return Ok(());
        }
        self.ignored_fields.refresh(region).await
    }

    pub async fn refresh_ignored_field_lists(&self, region: &str) -> std::result::Result<(), ProviderError> {
        self.ignored_fields.refresh(region).await
    }

    fn key(connection_id: &str, instance: &InstanceIndex) -> ReferenceKey {
        ReferenceKey::new(connection_id, instance.clone())
    }

    // Specifications

    pub fn record_specifications(
        &self,
        server_name: &str,
        account_type: AccountType,
        connection_id: &str,
        instance: &InstanceIndex,
        specifications: Vec<SymbolSpecification>,
    ) -> Result<Option<String>> {
        let ignored = self.ignored_fields.fields(&instance.region, account_type);
        self.specifications.record_items(
            server_name,
            Self::key(connection_id, instance),
            specifications,
            &ignored.specification,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update_specifications(
        &self,
        server_name: &str,
        account_type: AccountType,
        connection_id: &str,
        instance: &InstanceIndex,
        specifications: Vec<SymbolSpecification>,
        removed_symbols: Vec<String>,
        parent_hash: &str,
    ) -> Result<Option<String>> {
        let ignored = self.ignored_fields.fields(&instance.region, account_type);
        self.specifications.update_items(
            server_name,
            Self::key(connection_id, instance),
            parent_hash,
            specifications,
            removed_symbols,
            &ignored.specification,
        )
    }

    pub fn get_specifications_by_hash(
        &self,
        hash: &str,
    ) -> Option<HashMap<String, SymbolSpecification>> {
        self.specifications.get_items_by_hash(hash)
    }

    pub fn get_specifications_hashes_by_hash(&self, hash: &str) -> Option<HashMap<String, String>> {
        self.specifications.get_hashes_by_hash(hash)
    }

    pub fn get_last_used_specification_hashes(&self, server_name: &str) -> Vec<String> {
        self.specifications.last_used_hashes(server_name)
    }

    pub fn add_specification_reference(
        &self,
        hash: &str,
        connection_id: &str,
        instance: &InstanceIndex,
    ) -> Result<()> {
        self.specifications
            .add_reference(hash, Self::key(connection_id, instance))
    }

    pub fn remove_specification_reference(&self, connection_id: &str, instance: &InstanceIndex) {
        self.specifications
            .remove_reference(&Self::key(connection_id, instance));
    }

    // Positions

    pub fn record_positions(
        &self,
        account_id: &str,
        account_type: AccountType,
        connection_id: &str,
        instance: &InstanceIndex,
        positions: Vec<Position>,
    ) -> Result<Option<String>> {
        let ignored = self.ignored_fields.fields(&instance.region, account_type);
        self.positions.record_items(
            account_id,
            Self::key(connection_id, instance),
            positions,
            &ignored.position,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update_positions(
        &self,
        account_id: &str,
        account_type: AccountType,
        connection_id: &str,
        instance: &InstanceIndex,
        positions: Vec<Position>,
        removed_ids: Vec<String>,
        parent_hash: &str,
    ) -> Result<Option<String>> {
        let ignored = self.ignored_fields.fields(&instance.region, account_type);
        self.positions.update_items(
            account_id,
            Self::key(connection_id, instance),
            parent_hash,
            positions,
            removed_ids,
            &ignored.position,
        )
    }

    pub fn get_positions_by_hash(&self, hash: &str) -> Option<HashMap<String, Position>> {
        self.positions.get_items_by_hash(hash)
    }

    pub fn get_positions_hashes_by_hash(&self, hash: &str) -> Option<HashMap<String, String>> {
        self.positions.get_hashes_by_hash(hash)
    }

    pub fn get_removed_positions_by_hash(&self, hash: &str) -> Option<Vec<String>> {
        self.positions.get_removed_ids_by_hash(hash)
    }

    pub fn get_last_used_position_hashes(&self, account_id: &str) -> Vec<String> {
        self.positions.last_used_hashes(account_id)
    }

    pub fn add_position_reference(
        &self,
        hash: &str,
        connection_id: &str,
        instance: &InstanceIndex,
    ) -> Result<()> {
        self.positions
            .add_reference(hash, Self::key(connection_id, instance))
    }

    pub fn remove_position_reference(&self, connection_id: &str, instance: &InstanceIndex) {
        self.positions
            .remove_reference(&Self::key(connection_id, instance));
    }

    // Orders

    pub fn record_orders(
        &self,
        account_id: &str,
        account_type: AccountType,
        connection_id: &str,
        instance: &InstanceIndex,
        orders: Vec<Order>,
    ) -> Result<Option<String>> {
        let ignored = self.ignored_fields.fields(&instance.region, account_type);
        self.orders.record_items(
            account_id,
            Self::key(connection_id, instance),
            orders,
            &ignored.order,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update_orders(
        &self,
        account_id: &str,
        account_type: AccountType,
        connection_id: &str,
        instance: &InstanceIndex,
        orders: Vec<Order>,
        completed_ids: Vec<String>,
        parent_hash: &str,
    ) -> Result<Option<String>> {
        let ignored = self.ignored_fields.fields(&instance.region, account_type);
        self.orders.update_items(
            account_id,
            Self::key(connection_id, instance),
            parent_hash,
            orders,
            completed_ids,
            &ignored.order,
        )
    }

    pub fn get_orders_by_hash(&self, hash: &str) -> Option<HashMap<String, Order>> {
        self.orders.get_items_by_hash(hash)
    }

    pub fn get_orders_hashes_by_hash(&self, hash: &str) -> Option<HashMap<String, String>> {
        self.orders.get_hashes_by_hash(hash)
    }

    pub fn get_completed_orders_by_hash(&self, hash: &str) -> Option<Vec<String>> {
        self.orders.get_removed_ids_by_hash(hash)
    }

    pub fn get_last_used_order_hashes(&self, account_id: &str) -> Vec<String> {
        self.orders.last_used_hashes(account_id)
    }

    pub fn add_order_reference(
        &self,
        hash: &str,
        connection_id: &str,
        instance: &InstanceIndex,
    ) -> Result<()> {
        self.orders
            .add_reference(hash, Self::key(connection_id, instance))
    }

    pub fn remove_order_reference(&self, connection_id: &str, instance: &InstanceIndex) {
        self.orders
            .remove_reference(&Self::key(connection_id, instance));
    }

    // Lifecycle

    /// Release the three references held by one replica of a connection
    pub fn remove_connection_references(&self, connection_id: &str, instance: &InstanceIndex) {
        let key = Self::key(connection_id, instance);
        self.specifications.remove_reference(&key);
        self.positions.remove_reference(&key);
        self.orders.remove_reference(&key);
    }

    /// Release every reference held by a connection, across all replicas
    pub fn remove_all_connection_references(&self, connection_id: &str) {
        self.specifications
            .remove_connection_references(connection_id);
        self.positions.remove_connection_references(connection_id);
        self.orders.remove_connection_references(connection_id);
    }

    /// One garbage collection sweep over all trees
    pub fn collect_garbage(&self) -> usize {
        let removed = self.specifications.collect_garbage()
            + self.positions.collect_garbage()
            + self.orders.collect_garbage();
        if removed > 0 {
            debug!("hash cache garbage collection removed {removed} nodes");
        }
        removed
    }

    pub fn specifications_tree(&self) -> &ReferenceTree<SymbolSpecification> {
        &self.specifications
    }

    pub fn positions_tree(&self) -> &ReferenceTree<Position> {
        &self.positions
    }

    pub fn orders_tree(&self) -> &ReferenceTree<Order> {
        &self.orders
    }
}

impl Drop for TerminalHashManager {
    fn drop(&mut self) {
        self.stop();
    }
}
