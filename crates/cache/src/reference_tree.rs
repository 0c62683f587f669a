//! Reference tree
//!
//! Arena of immutable, content-addressed nodes for one data set category.
//! A root node holds a full snapshot; a diff node holds the items upserted and the
//! ids removed relative to its parent. Materializing a hash folds the parent chain
//! from the root forward.
//!
//! Nodes are kept alive by references `(connection, instance) -> hash`. An unreferenced
//! node without children is collected once it has been idle for the retention window;
//! an unreferenced node with a single child is folded into that child.

use log::{debug, trace};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use termsync_core::InstanceIndex;
use tokio::time::Instant;

use crate::error::{CacheError, Result};
use crate::hashing::{HashItem, ItemHash, combine, hash_item};

/// Share of items that may differ for a fuzzy base match (1 / N)
const FUZZY_DIFFERENCE_RATIO: usize = 10;

/// Holder of a hash: one replica of one connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReferenceKey {
    pub connection_id: String,
    pub instance: InstanceIndex,
}

impl ReferenceKey {
    pub fn new(connection_id: impl Into<String>, instance: InstanceIndex) -> Self {
        Self {
            connection_id: connection_id.into(),
            instance,
        }
    }
}

/// Behaviour switches of a tree
#[derive(Debug, Clone)]
pub struct TreeOptions {
    pub fuzzy_search: bool,
    pub keep_hash_trees: bool,
    pub retention: Duration,
    pub last_used_limit: usize,
    /// Offer hashes of other owners once the owner's own hashes are exhausted
    pub share_across_owners: bool,
}

#[derive(Debug)]
struct StoredItem<T> {
    hash: ItemHash,
    item: Arc<T>,
}

impl<T> Clone for StoredItem<T> {
    fn clone(&self) -> Self {
        Self {
            hash: self.hash,
            item: Arc::clone(&self.item),
        }
    }
}

#[derive(Debug)]
struct HashNode<T> {
    /// Server name (specifications) or account id (positions, orders)
    owner: String,
    parent_hash: Option<String>,
    child_hashes: HashSet<String>,
    items: HashMap<String, StoredItem<T>>,
    removed_ids: HashSet<String>,
    references: HashSet<ReferenceKey>,
    last_updated: Instant,
}

impl<T> HashNode<T> {
    fn new(
        owner: &str,
        parent_hash: Option<String>,
        items: HashMap<String, StoredItem<T>>,
        removed_ids: HashSet<String>,
        now: Instant,
    ) -> Self {
        Self {
            owner: owner.to_string(),
            parent_hash,
            child_hashes: HashSet::new(),
            items,
            removed_ids,
            references: HashSet::new(),
            last_updated: now,
        }
    }

    fn is_expired(&self, now: Instant, retention: Duration) -> bool {
        self.references.is_empty() && now.saturating_duration_since(self.last_updated) >= retention
    }
}

struct TreeState<T> {
    nodes: HashMap<String, HashNode<T>>,
    references: HashMap<ReferenceKey, String>,
}

impl<T> TreeState<T> {
    /// Node and its ancestors, newest first. `None` if the hash is unknown.
    fn chain(&self, hash: &str) -> Option<Vec<&HashNode<T>>> {
        let mut chain = Vec::new();
        let mut next = Some(hash);
        while let Some(current) = next {
            let node = self.nodes.get(current)?;
            chain.push(node);
            next = node.parent_hash.as_deref();
        }
        Some(chain)
    }

    fn fold<V>(&self, hash: &str, pick: impl Fn(&StoredItem<T>) -> V) -> Option<HashMap<String, V>> {
        let chain = self.chain(hash)?;
        let mut result = HashMap::new();
        for node in chain.iter().rev() {
            for id in &node.removed_ids {
                result.remove(id);
            }
            for (id, stored) in &node.items {
                result.insert(id.clone(), pick(stored));
            }
        }
        Some(result)
    }

    fn insert_node(&mut self, hash: &str, node: HashNode<T>) {
        if let Some(parent) = node.parent_hash.as_ref().and_then(|p| self.nodes.get_mut(p)) {
            parent.child_hashes.insert(hash.to_string());
        }
        self.nodes.insert(hash.to_string(), node);
    }

    fn set_reference(&mut self, hash: &str, key: ReferenceKey, now: Instant) {
        let moved = self
            .references
            .get(&key)
            .is_some_and(|previous| previous != hash);
        if moved {
            self.clear_reference(&key, now);
        }
        if let Some(node) = self.nodes.get_mut(hash) {
            node.references.insert(key.clone());
            node.last_updated = now;
            self.references.insert(key, hash.to_string());
        }
    }

    fn clear_reference(&mut self, key: &ReferenceKey, now: Instant) {
        if let Some(hash) = self.references.remove(key) {
            if let Some(node) = self.nodes.get_mut(&hash) {
                node.references.remove(key);
                node.last_updated = now;
            }
        }
    }

    fn last_used(
        &self,
        owner: &str,
        limit: usize,
        share_across_owners: bool,
        usable: impl Fn(&HashNode<T>) -> bool,
    ) -> Vec<String> {
        let own = self
            .nodes
            .iter()
            .filter(|(_, n)| n.owner == owner && usable(n))
            .collect();
        let mut hashes = by_recency(own);
        hashes.truncate(limit);

        if share_across_owners && hashes.len() < limit {
            let others = self
                .nodes
                .iter()
                .filter(|(_, n)| n.owner != owner && usable(n))
                .collect();
            let remaining = limit - hashes.len();
            hashes.extend(by_recency(others).into_iter().take(remaining));
        }
        hashes
    }

    /// Find a recently used tree of the same owner that differs from `items` in only a
    /// few entries and describe `items` as a diff on top of it.
    fn fuzzy_child(
        &self,
        owner: &str,
        target_hash: &str,
        items: &HashMap<String, StoredItem<T>>,
        limit: usize,
        now: Instant,
    ) -> Option<HashNode<T>> {
        for candidate in self.last_used(owner, limit, false, |_| true) {
            let Some(base) = self.fold(&candidate, |stored| stored.hash) else {
                continue;
            };

            let changed: HashMap<String, StoredItem<T>> = items
                .iter()
                .filter(|(id, stored)| base.get(*id) != Some(&stored.hash))
                .map(|(id, stored)| (id.clone(), stored.clone()))
                .collect();
            let removed: HashSet<String> = base
                .keys()
                .filter(|id| !items.contains_key(*id))
                .cloned()
                .collect();

            let differences = changed.len() + removed.len();
            if differences * FUZZY_DIFFERENCE_RATIO > items.len().max(base.len()) {
                continue;
            }

            // Only accept the base if the resulting content hashes to the requested state
            let mut merged = base;
            for id in &removed {
                merged.remove(id);
            }
            for (id, stored) in &changed {
                merged.insert(id.clone(), stored.hash);
            }
            if combine(merged.values()).as_deref() != Some(target_hash) {
                debug!("fuzzy base {candidate} rejected for {target_hash}: hash mismatch");
                continue;
            }

            trace!("fuzzy base {candidate} reused for {target_hash} ({differences} differences)");
            return Some(HashNode::new(owner, Some(candidate), changed, removed, now));
        }
        None
    }

    /// Merge an unreferenced node into its only child and unlink it
    fn fold_into_child(&mut self, hash: &str) {
        let Some(node) = self.nodes.remove(hash) else {
            return;
        };
        let Some(child_hash) = node.child_hashes.iter().next().cloned() else {
            self.nodes.insert(hash.to_string(), node);
            return;
        };
        let grandparent = node.parent_hash.clone();

        if let Some(child) = self.nodes.get_mut(&child_hash) {
            let mut items = node.items;
            for id in &child.removed_ids {
                items.remove(id);
            }
            items.extend(child.items.drain());

            let mut removed = if grandparent.is_some() {
                node.removed_ids
            } else {
                HashSet::new()
            };
            if grandparent.is_some() {
                removed.extend(child.removed_ids.drain());
            }
            removed.retain(|id| !items.contains_key(id));

            child.items = items;
            child.removed_ids = removed;
            child.parent_hash = grandparent.clone();
        }

        if let Some(parent) = grandparent.as_ref().and_then(|g| self.nodes.get_mut(g)) {
            parent.child_hashes.remove(hash);
            parent.child_hashes.insert(child_hash);
        }
    }
}

fn by_recency<T>(mut nodes: Vec<(&String, &HashNode<T>)>) -> Vec<String> {
    nodes.sort_by(|a, b| {
        b.1.last_updated
            .cmp(&a.1.last_updated)
            .then_with(|| a.0.cmp(b.0))
    });
    nodes.into_iter().map(|(hash, _)| hash.clone()).collect()
}

/// Content-addressed store for one category of items
pub struct ReferenceTree<T> {
    category: &'static str,
    options: TreeOptions,
    state: Mutex<TreeState<T>>,
}

impl<T: HashItem> ReferenceTree<T> {
    pub fn new(category: &'static str, options: TreeOptions) -> Self {
        Self {
            category,
            options,
            state: Mutex::new(TreeState {
                nodes: HashMap::new(),
                references: HashMap::new(),
            }),
        }
    }

    pub fn category(&self) -> &'static str {
        self.category
    }

    fn hash_items(
        &self,
        items: Vec<T>,
        ignored: &[String],
    ) -> Result<HashMap<String, StoredItem<T>>> {
        let mut stored = HashMap::with_capacity(items.len());
        for item in items {
            let hash = hash_item(&item, ignored)?;
            stored.insert(
                item.item_id().to_string(),
                StoredItem {
                    hash,
                    item: Arc::new(item),
                },
            );
        }
        Ok(stored)
    }

    /// Store a full snapshot and point `key` at it.
    ///
    /// Returns the snapshot hash, `None` for an empty snapshot (which also drops the
    /// key's reference).
    pub fn record_items(
        &self,
        owner: &str,
        key: ReferenceKey,
        items: Vec<T>,
        ignored: &[String],
    ) -> Result<Option<String>> {
        let stored = self.hash_items(items, ignored)?;
        let now = Instant::now();
        let mut state = self.state.lock();

        let Some(hash) = combine(stored.values().map(|s| &s.hash)) else {
            state.clear_reference(&key, now);
            return Ok(None);
        };

        if !state.nodes.contains_key(&hash) {
            let fuzzy = if self.options.fuzzy_search {
                state.fuzzy_child(owner, &hash, &stored, self.options.last_used_limit, now)
            } else {
                None
            };
            let node =
                fuzzy.unwrap_or_else(|| HashNode::new(owner, None, stored, HashSet::new(), now));
            trace!("{}: recorded {hash} for {owner}", self.category);
            state.insert_node(&hash, node);
        }

        state.set_reference(&hash, key, now);
        Ok(Some(hash))
    }

    /// Apply upserts and removals on top of `parent_hash` and point `key` at the result.
    ///
    /// Reuses an existing node when the resulting state is already known. Fails with
    /// [`CacheError::ParentNotFound`] if the parent is unknown.
    pub fn update_items(
        &self,
        owner: &str,
        key: ReferenceKey,
        parent_hash: &str,
        items: Vec<T>,
        removed_ids: Vec<String>,
        ignored: &[String],
    ) -> Result<Option<String>> {
        let mut upserts = self.hash_items(items, ignored)?;
        let now = Instant::now();
        let mut state = self.state.lock();

        let parent = state
            .fold(parent_hash, |stored| stored.hash)
            .ok_or_else(|| CacheError::ParentNotFound(parent_hash.to_string()))?;

        // Removal wins over an upsert of the same id
        for id in &removed_ids {
            upserts.remove(id);
        }
        let removed: HashSet<String> = removed_ids
            .into_iter()
            .filter(|id| parent.contains_key(id))
            .collect();
        upserts.retain(|id, stored| parent.get(id) != Some(&stored.hash));

        let mut next = parent;
        for id in &removed {
            next.remove(id);
        }
        for (id, stored) in &upserts {
            next.insert(id.clone(), stored.hash);
        }

        let Some(hash) = combine(next.values()) else {
            state.clear_reference(&key, now);
            return Ok(None);
        };

        if hash != parent_hash && !state.nodes.contains_key(&hash) {
            trace!(
                "{}: {parent_hash} -> {hash} ({} upserted, {} removed)",
                self.category,
                upserts.len(),
                removed.len()
            );
            let node = HashNode::new(owner, Some(parent_hash.to_string()), upserts, removed, now);
            state.insert_node(&hash, node);
        }

        state.set_reference(&hash, key, now);
        Ok(Some(hash))
    }

    /// Materialized items of a hash, keyed by id
    pub fn get_items_by_hash(&self, hash: &str) -> Option<HashMap<String, T>> {
        self.state
            .lock()
            .fold(hash, |stored| stored.item.as_ref().clone())
    }

    /// Materialized item hashes of a hash, keyed by id
    pub fn get_hashes_by_hash(&self, hash: &str) -> Option<HashMap<String, String>> {
        self.state.lock().fold(hash, |stored| stored.hash.to_hex())
    }

    /// Ids removed by the diff node `hash` relative to its parent
    pub fn get_removed_ids_by_hash(&self, hash: &str) -> Option<Vec<String>> {
        let state = self.state.lock();
        let node = state.nodes.get(hash)?;
        let mut ids: Vec<String> = node.removed_ids.iter().cloned().collect();
        ids.sort();
        Some(ids)
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.state.lock().nodes.contains_key(hash)
    }

    pub fn node_count(&self) -> usize {
        self.state.lock().nodes.len()
    }

    pub fn parent_of(&self, hash: &str) -> Option<String> {
        self.state
            .lock()
            .nodes
            .get(hash)
            .and_then(|node| node.parent_hash.clone())
    }

    /// Number of holders pointing directly at `hash`
    pub fn reference_count(&self, hash: &str) -> usize {
        self.state
            .lock()
            .nodes
            .get(hash)
            .map_or(0, |node| node.references.len())
    }

    /// Hash currently held by `key`
    pub fn reference_of(&self, key: &ReferenceKey) -> Option<String> {
        self.state.lock().references.get(key).cloned()
    }

    /// Point `key` at an existing hash, releasing whatever it held before
    pub fn add_reference(&self, hash: &str, key: ReferenceKey) -> Result<()> {
        let mut state = self.state.lock();
        if !state.nodes.contains_key(hash) {
            return Err(CacheError::HashNotFound(hash.to_string()));
        }
        state.set_reference(hash, key, Instant::now());
        Ok(())
    }

    pub fn remove_reference(&self, key: &ReferenceKey) {
        self.state.lock().clear_reference(key, Instant::now());
    }

    /// Release every reference held by one connection
    pub fn remove_connection_references(&self, connection_id: &str) {
        let mut state = self.state.lock();
        let keys: Vec<ReferenceKey> = state
            .references
            .keys()
            .filter(|key| key.connection_id == connection_id)
            .cloned()
            .collect();
        let now = Instant::now();
        for key in keys {
            state.clear_reference(&key, now);
        }
    }

    /// Recently used hashes of `owner`, most recent first. Nodes due for collection
    /// are left out, the server may answer with one after it is gone.
    pub fn last_used_hashes(&self, owner: &str) -> Vec<String> {
        let now = Instant::now();
        let retention = self.options.retention;
        let keep_all = self.options.keep_hash_trees;
        self.state.lock().last_used(
            owner,
            self.options.last_used_limit,
            self.options.share_across_owners,
            |node| keep_all || !node.is_expired(now, retention),
        )
    }

    /// Delete expired unreferenced leaves (repeatedly, so dead chains unwind) and fold
    /// expired single-child nodes into their child. Returns the number of nodes removed.
    pub fn collect_garbage(&self) -> usize {
        if self.options.keep_hash_trees {
            return 0;
        }

        let now = Instant::now();
        let retention = self.options.retention;
        let mut state = self.state.lock();
        let mut removed = 0;

        loop {
            let expired: Vec<String> = state
                .nodes
                .iter()
                .filter(|(_, n)| n.child_hashes.is_empty() && n.is_expired(now, retention))
                .map(|(hash, _)| hash.clone())
                .collect();
            if expired.is_empty() {
                break;
            }
            for hash in expired {
                if let Some(node) = state.nodes.remove(&hash) {
                    if let Some(parent) =
                        node.parent_hash.as_ref().and_then(|p| state.nodes.get_mut(p))
                    {
                        parent.child_hashes.remove(&hash);
                    }
                    removed += 1;
                }
            }
        }

        loop {
            let foldable = state
                .nodes
                .iter()
                .find(|(_, n)| n.child_hashes.len() == 1 && n.is_expired(now, retention))
                .map(|(hash, _)| hash.clone());
            let Some(hash) = foldable else {
                break;
            };
            state.fold_into_child(&hash);
            removed += 1;
        }

        if removed > 0 {
            debug!(
                "{}: collected {removed} hash nodes, {} remaining",
                self.category,
                state.nodes.len()
            );
        }
        removed
    }
}
