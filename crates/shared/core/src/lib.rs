//! Termsync Core Domain
//!
//! Pure domain types for the terminal mirror.
//! This crate contains no async, no I/O, and is 100% unit testable.
//!
//! - `entities`: terminal state records (account, positions, orders, specifications, quotes)
//! - `identifiers`: instance indices and account types
//! - `packets`: inbound synchronization packets as they arrive on the wire
//! - `requests`: outbound subscribe / synchronize / unsubscribe requests

pub mod entities;
pub mod identifiers;
pub mod packets;
pub mod requests;
pub mod values;

// Re-export commonly used types at crate root
pub use entities::{
    AccountInformation, AccountMetrics, Book, BookEntry, BookEntryType, Candle, Deal, DealType,
    HealthStatus, Order, OrderState, OrderType, Position, PositionType, SymbolPrice,
    SymbolSpecification, Tick,
};
pub use identifiers::{AccountType, IdentifierError, InstanceIndex};
pub use packets::{PacketPayload, SynchronizationPacket};
pub use requests::{OutboundRequest, RequestBody, SynchronizationHashes, SynchronizeRequest};
pub use values::{Price, Symbol, Timestamp, Volume};
