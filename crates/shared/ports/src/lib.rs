//! Termsync Ports
//!
//! Port definitions (traits) for the terminal mirror.
//! These define the boundaries between the synchronization engine and its consumers
//! and collaborators.

mod error;
mod history;
mod ignored_fields;
mod listener;
mod packet_logger;

pub use error::{ListenerError, ListenerResult, ProviderError};
pub use history::HistoryStorage;
pub use ignored_fields::{HashingIgnoredFieldLists, IgnoredFields, IgnoredFieldsProvider};
pub use listener::{ReconnectListener, SynchronizationListener, SynchronizationStart};
pub use packet_logger::PacketLogger;
