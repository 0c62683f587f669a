//! Termsync Hash Cache
//!
//! Shared, content-addressed store of specification / position / order snapshots.
//! Identical data sets seen by different connections resolve to the same hash and
//! are stored once; incremental updates are stored as diffs against a parent hash.
//!
//! ## Lifetime
//!
//! Nodes live while a `(connection, instance)` reference points at them or at a
//! descendant. Released nodes are collected lazily by a periodic sweep.

pub mod config;
pub mod error;
pub mod hashing;
pub mod ignored_fields;
pub mod manager;
pub mod reference_tree;

pub use config::HashCacheConfig;
pub use error::{CacheError, Result};
pub use hashing::{HashItem, ItemHash};
pub use ignored_fields::{IgnoredFieldsCache, StaticIgnoredFieldsProvider};
pub use manager::TerminalHashManager;
pub use reference_tree::{ReferenceKey, ReferenceTree, TreeOptions};
