//! Termsync Terminal
//!
//! Account-level side of the mirror:
//! - `TerminalState`: per-replica and combined views of account, positions, orders,
//!   specifications and prices, backed by the hash cache
//! - `MemoryHistoryStorage`: in-process order and deal history
//! - `StreamingConnection`: binds an account to the router and drives synchronization
//! - `ConnectionRegistry`: shares one connection per account between consumers
//!
//! ```text
//!   ConnectionRegistry ──► StreamingConnection ──► PacketRouter
//!          │                    │       │
//!          ▼                    ▼       ▼
//!   StreamingConnection   TerminalState  HistoryStorage
//!        Instance               │
//!                               ▼
//!                       TerminalHashManager
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod history;
pub mod registry;
pub mod state;

pub use config::ConnectionConfig;
pub use connection::{ConnectionStatus, StreamingConnection};
pub use error::{Result, TerminalError};
pub use history::MemoryHistoryStorage;
pub use registry::{ConnectionRegistry, StreamingConnectionInstance};
pub use state::{TerminalHashes, TerminalState};
