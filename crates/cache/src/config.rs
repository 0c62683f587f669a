//! Hash cache configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashCacheConfig {
    /// Reuse a near-identical specification tree as the base of a new snapshot
    #[serde(default = "default_use_fuzzy_search")]
    pub use_fuzzy_search: bool,

    /// Disable garbage collection entirely (debugging aid)
    #[serde(default)]
    pub keep_hash_trees: bool,

    #[serde(default = "default_garbage_collection_interval")]
    pub garbage_collection_interval_in_seconds: u64,

    /// How long an unreferenced node survives before collection
    #[serde(default = "default_retention")]
    pub retention_in_seconds: u64,

    #[serde(default = "default_ignored_fields_refresh_interval")]
    pub ignored_fields_refresh_interval_in_seconds: u64,

    /// Maximum number of hashes offered to the server per data set
    #[serde(default = "default_last_used_hashes_limit")]
    pub last_used_hashes_limit: usize,
}

fn default_use_fuzzy_search() -> bool {
    true
}

fn default_garbage_collection_interval() -> u64 {
    60
}

fn default_retention() -> u64 {
    300
}

fn default_ignored_fields_refresh_interval() -> u64 {
    3600
}

fn default_last_used_hashes_limit() -> usize {
    20
}

impl Default for HashCacheConfig {
    fn default() -> Self {
        Self {
            use_fuzzy_search: default_use_fuzzy_search(),
            keep_hash_trees: false,
            garbage_collection_interval_in_seconds: default_garbage_collection_interval(),
            retention_in_seconds: default_retention(),
            ignored_fields_refresh_interval_in_seconds: default_ignored_fields_refresh_interval(),
            last_used_hashes_limit: default_last_used_hashes_limit(),
        }
    }
}

impl HashCacheConfig {
    pub fn garbage_collection_interval(&self) -> Duration {
        Duration::from_secs(self.garbage_collection_interval_in_seconds.max(1))
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_in_seconds)
    }

    pub fn ignored_fields_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.ignored_fields_refresh_interval_in_seconds.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: HashCacheConfig =
            serde_json::from_str(r#"{"keep_hash_trees": true}"#).unwrap();

        assert!(config.keep_hash_trees);
        assert!(config.use_fuzzy_search);
        assert_eq!(config.retention(), Duration::from_secs(300));
        assert_eq!(config.last_used_hashes_limit, 20);
    }
}
