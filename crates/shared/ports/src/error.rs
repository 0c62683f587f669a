use thiserror::Error;

/// Failure raised by a synchronization listener while handling an event.
///
/// The fan-out logs these and keeps delivering to the remaining listeners.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ListenerError {
    #[error("Listener failed: {0}")]
    Failed(String),

    #[error("Hash cache error: {0}")]
    Cache(String),

    #[error("History storage error: {0}")]
    Storage(String),
}

/// Failure of an external collaborator (ignored field lists, etc.)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),
}

pub type ListenerResult = std::result::Result<(), ListenerError>;
