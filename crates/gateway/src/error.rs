//! Error types for the gateway crate

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

/// Transport-level errors, including typed `processingError` replies of the server
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Timeout waiting for response")]
    Timeout,

    /// Rate limit hit; the request may be repeated after `recommended_retry_time`
    #[error("Too many requests: {message}")]
    TooManyRequests {
        message: String,
        recommended_retry_time: DateTime<Utc>,
        metadata: Value,
    },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Validation failed: {message}")]
    Validation { message: String, details: Value },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Server error {error}: {message}")]
    Server { error: String, message: String },
}

impl TransportError {
    /// Map a `processingError` reply to a typed error
    pub fn from_processing_error(reply: &Value) -> Self {
        let error = reply
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("InternalError")
            .to_string();
        let message = reply
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        match error.as_str() {
            "TooManyRequestsError" => {
                let metadata = reply.get("metadata").cloned().unwrap_or(Value::Null);
                let recommended_retry_time = metadata
                    .get("recommendedRetryTime")
                    .and_then(Value::as_str)
                    .and_then(|time| time.parse::<DateTime<Utc>>().ok())
                    .unwrap_or_else(Utc::now);
                TransportError::TooManyRequests {
                    message,
                    recommended_retry_time,
                    metadata,
                }
            }
            "UnauthorizedError" => TransportError::Unauthorized(message),
            "ValidationError" => TransportError::Validation {
                message,
                details: reply.get("details").cloned().unwrap_or(Value::Null),
            },
            "NotFoundError" => TransportError::NotFound(message),
            _ => TransportError::Server { error, message },
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        TransportError::Serialization(e.to_string())
    }
}

/// Synchronization admission failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ThrottleError {
    #[error("Synchronization request timed out in the queue")]
    QueueTimeout,

    #[error("Synchronization request cancelled")]
    Cancelled,

    #[error("Synchronization request superseded by a newer one")]
    Superseded,
}

/// Router-level errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RouterError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Throttling error: {0}")]
    Throttle(#[from] ThrottleError),

    #[error("Router closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, RouterError>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_too_many_requests_mapping() {
        let reply = json!({
            "type": "processingError",
            "requestId": "r1",
            "error": "TooManyRequestsError",
            "message": "subscription limit reached",
            "metadata": {
                "recommendedRetryTime": "2026-01-01T00:00:10Z",
                "type": "LIMIT_ACCOUNT_SUBSCRIPTIONS_PER_SERVER"
            }
        });

        match TransportError::from_processing_error(&reply) {
            TransportError::TooManyRequests {
                recommended_retry_time,
                metadata,
                ..
            } => {
                assert_eq!(recommended_retry_time.to_rfc3339(), "2026-01-01T00:00:10+00:00");
                assert_eq!(metadata["type"], "LIMIT_ACCOUNT_SUBSCRIPTIONS_PER_SERVER");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_other_errors_mapping() {
        let unauthorized = json!({"error": "UnauthorizedError", "message": "bad token"});
        assert_eq!(
            TransportError::from_processing_error(&unauthorized),
            TransportError::Unauthorized("bad token".to_string())
        );

        let unknown = json!({"error": "NotSynchronizedError", "message": "later"});
        assert!(matches!(
            TransportError::from_processing_error(&unknown),
            TransportError::Server { .. }
        ));
    }
}
