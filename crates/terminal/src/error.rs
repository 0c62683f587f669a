//! Terminal errors
//!
//! Cache and throttler faults are translated at this boundary; consumers only see
//! rejected wait calls.

use termsync_cache::CacheError;
use termsync_gateway::RouterError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TerminalError {
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Wait cancelled, the connection was closed")]
    Cancelled,

    #[error("Connection is closed")]
    Closed,

    #[error("Hash cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Router error: {0}")]
    Router(#[from] RouterError),
}

pub type Result<T> = std::result::Result<T, TerminalError>;
