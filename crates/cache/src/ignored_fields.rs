//! Hashing ignored-field lists, cached per region

use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use termsync_core::AccountType;
use termsync_ports::{HashingIgnoredFieldLists, IgnoredFields, IgnoredFieldsProvider, ProviderError};

/// Provider answering every region with the same lists.
///
/// The default lists are empty, so no field is excluded from identity.
#[derive(Debug, Clone, Default)]
pub struct StaticIgnoredFieldsProvider {
    lists: HashingIgnoredFieldLists,
}

impl StaticIgnoredFieldsProvider {
    pub fn new(lists: HashingIgnoredFieldLists) -> Self {
        Self { lists }
    }
}

#[async_trait]
impl IgnoredFieldsProvider for StaticIgnoredFieldsProvider {
    async fn hashing_ignored_field_lists(
        &self,
        _region: &str,
    ) -> Result<HashingIgnoredFieldLists, ProviderError> {
        Ok(self.lists.clone())
    }
}

/// Last fetched lists of every region seen so far
pub struct IgnoredFieldsCache {
    provider: Arc<dyn IgnoredFieldsProvider>,
    regions: RwLock<HashMap<String, HashingIgnoredFieldLists>>,
    empty: IgnoredFields,
}

impl IgnoredFieldsCache {
    pub fn new(provider: Arc<dyn IgnoredFieldsProvider>) -> Self {
        Self {
            provider,
            regions: RwLock::new(HashMap::new()),
            empty: IgnoredFields::default(),
        }
    }

    /// Fetch the lists of `region` from the provider and cache them
    pub async fn refresh(&self, region: &str) -> Result<(), ProviderError> {
        let lists = self.provider.hashing_ignored_field_lists(region).await?;
        debug!("refreshed hashing ignored field lists for region {region}");
        self.regions.write().insert(region.to_string(), lists);
        Ok(())
    }

    /// Refresh every cached region, keeping the previous lists of regions that fail
    pub async fn refresh_all(&self) {
        let regions: Vec<String> = self.regions.read().keys().cloned().collect();
        for region in regions {
            if let Err(e) = self.refresh(&region).await {
                warn!("failed to refresh hashing ignored field lists for region {region}: {e}");
            }
        }
    }

    pub fn is_loaded(&self, region: &str) -> bool {
        self.regions.read().contains_key(region)
    }

    /// Lists of a region and account type. Empty when the region was never loaded.
    pub fn fields(&self, region: &str, account_type: AccountType) -> IgnoredFields {
        self.regions
            .read()
            .get(region)
            .map(|lists| lists.for_account_type(account_type).clone())
            .unwrap_or_else(|| self.empty.clone())
    }
}
