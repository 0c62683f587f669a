//! Router and throttler configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Region served by the transport channels of this router
    #[serde(default = "default_region")]
    pub region: String,

    /// How long a sequence gap may stay open before buffered packets are flushed
    #[serde(default = "default_packet_ordering_timeout")]
    pub packet_ordering_timeout_in_seconds: u64,

    /// Maximum number of out-of-order packets buffered per instance
    #[serde(default = "default_wait_list_size_limit")]
    pub wait_list_size_limit: usize,

    #[serde(default = "default_max_accounts_per_channel")]
    pub max_accounts_per_channel: usize,

    #[serde(default = "default_reconnect_min_delay")]
    pub reconnect_min_delay_in_seconds: u64,

    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_in_seconds: u64,

    #[serde(default = "default_subscribe_min_delay")]
    pub subscribe_min_delay_in_seconds: u64,

    #[serde(default = "default_subscribe_max_delay")]
    pub subscribe_max_delay_in_seconds: u64,

    /// Minimum interval between unsubscribe requests for the same account
    #[serde(default = "default_unsubscribe_throttling_interval")]
    pub unsubscribe_throttling_interval_in_seconds: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_in_seconds: u64,

    /// An instance silent for this long is treated as disconnected
    #[serde(default = "default_status_timeout")]
    pub status_timeout_in_seconds: u64,

    /// Bound of the per-account event queue
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
}

fn default_region() -> String {
    "vint-hill".to_string()
}

fn default_packet_ordering_timeout() -> u64 {
    60
}

fn default_wait_list_size_limit() -> usize {
    100
}

fn default_max_accounts_per_channel() -> usize {
    100
}

fn default_reconnect_min_delay() -> u64 {
    1
}

fn default_reconnect_max_delay() -> u64 {
    30
}

fn default_subscribe_min_delay() -> u64 {
    1
}

fn default_subscribe_max_delay() -> u64 {
    600
}

fn default_unsubscribe_throttling_interval() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    60
}

fn default_status_timeout() -> u64 {
    60
}

fn default_event_queue_capacity() -> usize {
    10_000
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            packet_ordering_timeout_in_seconds: default_packet_ordering_timeout(),
            wait_list_size_limit: default_wait_list_size_limit(),
            max_accounts_per_channel: default_max_accounts_per_channel(),
            reconnect_min_delay_in_seconds: default_reconnect_min_delay(),
            reconnect_max_delay_in_seconds: default_reconnect_max_delay(),
            subscribe_min_delay_in_seconds: default_subscribe_min_delay(),
            subscribe_max_delay_in_seconds: default_subscribe_max_delay(),
            unsubscribe_throttling_interval_in_seconds: default_unsubscribe_throttling_interval(),
            request_timeout_in_seconds: default_request_timeout(),
            status_timeout_in_seconds: default_status_timeout(),
            event_queue_capacity: default_event_queue_capacity(),
        }
    }
}

impl RouterConfig {
    pub fn packet_ordering_timeout(&self) -> Duration {
        Duration::from_secs(self.packet_ordering_timeout_in_seconds)
    }

    pub fn reconnect_delays(&self) -> (Duration, Duration) {
        (
            Duration::from_secs(self.reconnect_min_delay_in_seconds),
            Duration::from_secs(self.reconnect_max_delay_in_seconds),
        )
    }

    pub fn subscribe_delays(&self) -> (Duration, Duration) {
        (
            Duration::from_secs(self.subscribe_min_delay_in_seconds),
            Duration::from_secs(self.subscribe_max_delay_in_seconds),
        )
    }

    pub fn unsubscribe_throttling_interval(&self) -> Duration {
        Duration::from_secs(self.unsubscribe_throttling_interval_in_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_in_seconds)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_secs(self.status_timeout_in_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottlerConfig {
    /// Ceiling of concurrently running synchronizations per transport channel
    #[serde(default = "default_max_concurrent_synchronizations")]
    pub max_concurrent_synchronizations: usize,

    #[serde(default = "default_queue_timeout")]
    pub queue_timeout_in_seconds: u64,

    /// An active slot without progress for this long is freed
    #[serde(default = "default_synchronization_timeout")]
    pub synchronization_timeout_in_seconds: u64,
}

fn default_max_concurrent_synchronizations() -> usize {
    15
}

fn default_queue_timeout() -> u64 {
    300
}

fn default_synchronization_timeout() -> u64 {
    10
}

impl Default for ThrottlerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_synchronizations: default_max_concurrent_synchronizations(),
            queue_timeout_in_seconds: default_queue_timeout(),
            synchronization_timeout_in_seconds: default_synchronization_timeout(),
        }
    }
}

impl ThrottlerConfig {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_timeout_in_seconds)
    }

    pub fn synchronization_timeout(&self) -> Duration {
        Duration::from_secs(self.synchronization_timeout_in_seconds)
    }
}
