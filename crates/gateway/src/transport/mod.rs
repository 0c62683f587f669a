//! Transport abstraction layer
//!
//! A transport opens physical channels to one instance number of a region. Every
//! channel carries JSON messages both ways: outbound requests and inbound packets or
//! replies. The router owns ordering, correlation and reconnection on top of it.

pub mod channel;
pub mod websocket;

use crate::error::TransportError;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

/// Inbound side of a physical channel
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A JSON message from the server
    Message(Value),

    /// The channel was lost; no further events follow
    Closed(String),
}

/// Outbound side of a physical channel
#[derive(Debug, Clone)]
pub struct ChannelSender {
    tx: mpsc::Sender<Value>,
}

impl ChannelSender {
    pub fn new(tx: mpsc::Sender<Value>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, message: Value) -> Result<(), TransportError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// An open physical channel
pub struct ChannelConnection {
    pub sender: ChannelSender,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Opens physical channels
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect a new channel to `instance_number` of `region`
    async fn connect(
        &self,
        region: &str,
        instance_number: u32,
    ) -> Result<ChannelConnection, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Ensure the trait is object-safe
    fn _assert_transport_object_safe(_: &dyn Transport) {}

    #[tokio::test]
    async fn test_sender_reports_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        let sender = ChannelSender::new(tx);
        drop(rx);

        assert!(sender.is_closed());
        assert_eq!(
            sender.send(Value::Null).await,
            Err(TransportError::ChannelClosed)
        );
    }
}
