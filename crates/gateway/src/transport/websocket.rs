//! WebSocket JSON transport
//!
//! One WebSocket per channel; every text frame is one JSON message.

use crate::error::TransportError;
use crate::transport::{ChannelConnection, ChannelSender, Transport, TransportEvent};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, trace, warn};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

pub struct WebSocketTransport {
    url: Url,
    token: Option<String>,
    client_id: String,
}

impl WebSocketTransport {
    pub fn new(url: Url, token: Option<String>) -> Self {
        Self {
            url,
            token,
            client_id: uuid::Uuid::new_v4().simple().to_string(),
        }
    }

    /// Endpoint of one instance of a region
    pub fn endpoint(&self, region: &str, instance_number: u32) -> Url {
        let mut url = self.url.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("region", region)
                .append_pair("instance", &instance_number.to_string())
                .append_pair("clientId", &self.client_id);
            if let Some(token) = &self.token {
                query.append_pair("auth-token", token);
            }
        }
        url
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(
        &self,
        region: &str,
        instance_number: u32,
    ) -> Result<ChannelConnection, TransportError> {
        let endpoint = self.endpoint(region, instance_number);
        let (ws_stream, _) = connect_async(endpoint.as_str())
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();
        debug!("connected websocket channel to {region}:{instance_number}");

        let (request_tx, mut request_rx) = mpsc::channel::<Value>(32);
        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(1024);

        let write_events = event_tx.clone();
        tokio::spawn(async move {
            while let Some(request) = request_rx.recv().await {
                let json = match serde_json::to_string(&request) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("failed to serialize request: {e}");
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json.into())).await {
                    let _ = write_events.send(TransportEvent::Closed(e.to_string())).await;
                    break;
                }
            }
            let _ = write.close().await;
        });

        tokio::spawn(async move {
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<Value>(&text) {
                        Ok(value) => {
                            if event_tx.send(TransportEvent::Message(value)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!("dropping malformed frame: {e}"),
                    },
                    Ok(Message::Close(frame)) => {
                        let reason = frame
                            .map(|frame| frame.reason.to_string())
                            .unwrap_or_else(|| "closed by server".to_string());
                        let _ = event_tx.send(TransportEvent::Closed(reason)).await;
                        return;
                    }
                    Ok(Message::Ping(data)) => trace!("received ping: {data:?}"),
                    Ok(_) => {}
                    Err(e) => {
                        let _ = event_tx.send(TransportEvent::Closed(e.to_string())).await;
                        return;
                    }
                }
            }
            let _ = event_tx
                .send(TransportEvent::Closed("stream ended".to_string()))
                .await;
        });

        Ok(ChannelConnection {
            sender: ChannelSender::new(request_tx),
            events: event_rx,
        })
    }
}
