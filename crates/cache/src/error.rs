//! Error types for the hash cache

use termsync_ports::{ListenerError, ProviderError};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// An update referenced a parent the cache does not hold.
    /// Not retryable: the caller must record a full snapshot instead.
    #[error("Parent hash not found: {0}")]
    ParentNotFound(String),

    #[error("Hash not found: {0}")]
    HashNotFound(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Ignored field lists unavailable: {0}")]
    Provider(#[from] ProviderError),
}

pub type Result<T> = std::result::Result<T, CacheError>;

impl From<CacheError> for ListenerError {
    fn from(e: CacheError) -> Self {
        ListenerError::Cache(e.to_string())
    }
}
