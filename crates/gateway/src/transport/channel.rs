//! Tokio channel-based transport for single-process mode
//!
//! Each `connect` hands the server side of the new channel to a `ChannelServer`, so
//! tests and embedded servers can read requests and push packets in-process.

use crate::error::TransportError;
use crate::transport::{ChannelConnection, ChannelSender, Transport, TransportEvent};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use termsync_core::SynchronizationPacket;
use tokio::sync::mpsc;

const CHANNEL_CAPACITY: usize = 1024;

/// Client side: opens in-process channels
#[derive(Clone)]
pub struct ChannelTransport {
    connections: mpsc::UnboundedSender<ServerConnection>,
    available: Arc<AtomicBool>,
}

impl ChannelTransport {
    /// Create a transport and the server accepting its channels
    pub fn pair() -> (Self, ChannelServer) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                connections: tx,
                available: Arc::new(AtomicBool::new(true)),
            },
            ChannelServer { rx },
        )
    }

    /// Make subsequent connects fail (or succeed again)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn connect(
        &self,
        region: &str,
        instance_number: u32,
    ) -> Result<ChannelConnection, TransportError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(TransportError::Connection("server unavailable".to_string()));
        }

        let (request_tx, request_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let server_side = ServerConnection {
            region: region.to_string(),
            instance_number,
            requests: request_rx,
            sender: ServerSender { events: event_tx },
        };
        self.connections
            .send(server_side)
            .map_err(|_| TransportError::Connection("server stopped".to_string()))?;

        Ok(ChannelConnection {
            sender: ChannelSender::new(request_tx),
            events: event_rx,
        })
    }
}

/// Server side: accepts channels opened by a `ChannelTransport`
pub struct ChannelServer {
    rx: mpsc::UnboundedReceiver<ServerConnection>,
}

impl ChannelServer {
    /// Wait for the next channel
    pub async fn accept(&mut self) -> Option<ServerConnection> {
        self.rx.recv().await
    }
}

/// Server end of one channel
pub struct ServerConnection {
    pub region: String,
    pub instance_number: u32,
    requests: mpsc::Receiver<Value>,
    sender: ServerSender,
}

impl ServerConnection {
    /// Receive the next request sent by the client
    pub async fn next_request(&mut self) -> Option<Value> {
        self.requests.recv().await
    }

    /// Receive a request without waiting
    pub fn try_next_request(&mut self) -> Option<Value> {
        self.requests.try_recv().ok()
    }

    /// Handle pushing messages to the client
    pub fn sender(&self) -> ServerSender {
        self.sender.clone()
    }
}

/// Pushes packets and replies to the client end of a channel
#[derive(Clone)]
pub struct ServerSender {
    events: mpsc::Sender<TransportEvent>,
}

impl ServerSender {
    pub async fn send(&self, message: Value) -> Result<(), TransportError> {
        self.events
            .send(TransportEvent::Message(message))
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }

    pub async fn send_packet(&self, packet: &SynchronizationPacket) -> Result<(), TransportError> {
        self.send(serde_json::to_value(packet)?).await
    }

    /// Acknowledge a request
    pub async fn respond(&self, request_id: &str) -> Result<(), TransportError> {
        self.send(json!({"type": "response", "requestId": request_id}))
            .await
    }

    /// Drop the channel as a network failure would
    pub async fn close(&self, reason: &str) {
        let _ = self
            .events
            .send(TransportEvent::Closed(reason.to_string()))
            .await;
    }
}
