//! Streaming connection configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Replica numbers each account is subscribed on
    #[serde(default = "default_instance_numbers")]
    pub instance_numbers: Vec<u32>,

    #[serde(default = "default_retry_min_delay")]
    pub synchronization_retry_min_delay_in_seconds: u64,

    #[serde(default = "default_retry_max_delay")]
    pub synchronization_retry_max_delay_in_seconds: u64,
}

fn default_instance_numbers() -> Vec<u32> {
    vec![0]
}

fn default_retry_min_delay() -> u64 {
    1
}

fn default_retry_max_delay() -> u64 {
    300
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            instance_numbers: default_instance_numbers(),
            synchronization_retry_min_delay_in_seconds: default_retry_min_delay(),
            synchronization_retry_max_delay_in_seconds: default_retry_max_delay(),
        }
    }
}

impl ConnectionConfig {
    /// Bounds of the backoff between failed synchronize attempts
    pub fn synchronization_retry_delays(&self) -> (Duration, Duration) {
        let min = Duration::from_secs(self.synchronization_retry_min_delay_in_seconds);
        let max = Duration::from_secs(self.synchronization_retry_max_delay_in_seconds);
        (min, max.max(min))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: ConnectionConfig = serde_json::from_str("{}").unwrap();

        assert_eq!(config.instance_numbers, vec![0]);
        assert_eq!(
            config.synchronization_retry_delays(),
            (Duration::from_secs(1), Duration::from_secs(300))
        );
    }

    #[test]
    fn test_max_delay_never_below_min() {
        let config = ConnectionConfig {
            synchronization_retry_min_delay_in_seconds: 10,
            synchronization_retry_max_delay_in_seconds: 5,
            ..Default::default()
        };
        assert_eq!(
            config.synchronization_retry_delays(),
            (Duration::from_secs(10), Duration::from_secs(10))
        );
    }
}
