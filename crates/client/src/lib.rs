//! Termsync Client
//!
//! Entry point of the terminal mirror. A `TerminalSyncClient` is built from a
//! `ClientConfig` and owns every component:
//!
//! ```text
//!   TerminalSyncClient
//!     ├── PacketRouter ────────── Transport (WebSocket / in-process)
//!     ├── TerminalHashManager ─── IgnoredFieldsProvider
//!     └── ConnectionRegistry
//!           └── StreamingConnection per account
//! ```

pub mod client;
pub mod config;
pub mod error;

pub use client::{ClientBuilder, TerminalSyncClient};
pub use config::{
    ClientConfig, ConfigError, ServerConfig, load_config, load_config_from_str,
    load_default_config,
};
pub use error::{ClientError, Result};

// Re-export the types consumers work with
pub use termsync_core::{AccountType, InstanceIndex};
pub use termsync_ports::{HistoryStorage, SynchronizationListener};
pub use termsync_terminal::{
    ConnectionStatus, MemoryHistoryStorage, StreamingConnectionInstance, TerminalError,
    TerminalState,
};
