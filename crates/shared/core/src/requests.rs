use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Request sent from the client to the streaming server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundRequest {
    pub account_id: String,

    /// Correlates the server `response` / `processingError` reply
    pub request_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_index: Option<u32>,

    #[serde(flatten)]
    pub body: RequestBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RequestBody {
    Subscribe,
    Synchronize(SynchronizeRequest),
    Unsubscribe,
}

/// Hashes of the data sets the client may already hold, most relevant first.
/// The server answers with an index into these lists when a set is unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SynchronizationHashes {
    pub specifications_hashes: Vec<String>,
    pub positions_hashes: Vec<String>,
    pub orders_hashes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynchronizeRequest {
    pub synchronization_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// History orders after this time are requested
    pub starting_history_order_time: DateTime<Utc>,

    /// Deals after this time are requested
    pub starting_deal_time: DateTime<Utc>,

    #[serde(flatten)]
    pub hashes: SynchronizationHashes,

    // Legacy single-hash fields understood by older servers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specifications_md5: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub positions_md5: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orders_md5: Option<String>,
}

impl OutboundRequest {
    pub fn subscribe(account_id: impl Into<String>, request_id: impl Into<String>, instance: u32) -> Self {
        Self {
            account_id: account_id.into(),
            request_id: request_id.into(),
            application: None,
            instance_index: Some(instance),
            body: RequestBody::Subscribe,
        }
    }

    pub fn unsubscribe(account_id: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            request_id: request_id.into(),
            application: None,
            instance_index: None,
            body: RequestBody::Unsubscribe,
        }
    }

    pub fn synchronize(
        account_id: impl Into<String>,
        request_id: impl Into<String>,
        instance: u32,
        request: SynchronizeRequest,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            request_id: request_id.into(),
            application: None,
            instance_index: Some(instance),
            body: RequestBody::Synchronize(request),
        }
    }

    pub fn with_application(mut self, application: impl Into<String>) -> Self {
        self.application = Some(application.into());
        self
    }

    pub fn type_name(&self) -> &'static str {
        match self.body {
            RequestBody::Subscribe => "subscribe",
            RequestBody::Synchronize(_) => "synchronize",
            RequestBody::Unsubscribe => "unsubscribe",
        }
    }
}
