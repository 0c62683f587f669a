//! Termsync Gateway
//!
//! Streaming side of the terminal mirror. Provides:
//! - Transport abstraction (in-process channels and WebSocket JSON frames)
//! - Packet router: channel sharding, sequence ordering, request correlation,
//!   reconnection and subscription loops
//! - Synchronization throttler bounding concurrent full synchronizations per channel
//! - Per-account sequential event queues feeding the listener fan-out
//!
//! ## Architecture
//!
//! ```text
//!   Streaming server (one or more replicas per region)
//!         │
//!    ┌────▼────┐   requests: subscribe / synchronize / unsubscribe
//!    │Channels │◄──────────────────────────────┐
//!    └────┬────┘                               │
//!         │ packets                      ┌─────┴─────┐
//!    ┌────▼────┐    ┌──────────┐         │ Throttler │
//!    │ Orderer ├───►│  Router  ├────────►│ (per chan)│
//!    └─────────┘    └────┬─────┘         └───────────┘
//!                        │ events, one queue per account
//!                   ┌────▼─────┐
//!                   │ Fan-out  │──► SynchronizationListener
//!                   └──────────┘
//! ```

pub mod config;
pub mod error;
pub mod fanout;
pub mod orderer;
pub mod router;
pub mod subscription;
pub mod throttler;
pub mod transport;

pub use config::{RouterConfig, ThrottlerConfig};
pub use error::{Result, RouterError, ThrottleError, TransportError};
pub use fanout::{ListenerFanout, SynchronizationEvent};
pub use orderer::{OrderingTimeout, PacketOrderer};
pub use router::PacketRouter;
pub use subscription::{Backoff, SubscriptionManager};
pub use throttler::SynchronizationThrottler;
pub use transport::{
    ChannelConnection, ChannelSender, Transport, TransportEvent,
    channel::{ChannelServer, ChannelTransport, ServerConnection, ServerSender},
    websocket::WebSocketTransport,
};
