use std::path::Path;
use thiserror::Error;

use super::types::ClientConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Invalid server url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Load client configuration from a JSON file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<ClientConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    load_config_from_str(&content)
}

/// Load configuration from a JSON string
pub fn load_config_from_str(json: &str) -> Result<ClientConfig, ConfigError> {
    let config: ClientConfig = serde_json::from_str(json)?;
    config.validate()?;
    Ok(config)
}

/// Load the default embedded configuration
pub fn load_default_config() -> Result<ClientConfig, ConfigError> {
    let default_config = include_str!("client_config.json");
    load_config_from_str(default_config)
}

impl ClientConfig {
    /// Streaming server endpoint as a parsed url
    pub fn server_url(&self) -> Result<url::Url, ConfigError> {
        Ok(url::Url::parse(&self.server.url)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.application.is_empty() {
            return Err(ConfigError::Invalid("application must not be empty".to_string()));
        }
        if self.router.region.is_empty() {
            return Err(ConfigError::Invalid("router.region must not be empty".to_string()));
        }
        if self.connection.instance_numbers.is_empty() {
            return Err(ConfigError::Invalid(
                "connection.instance_numbers must name at least one replica".to_string(),
            ));
        }
        if self.throttler.max_concurrent_synchronizations == 0 {
            return Err(ConfigError::Invalid(
                "throttler.max_concurrent_synchronizations must be positive".to_string(),
            ));
        }
        self.server_url()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_default_config() {
        let config = load_default_config().unwrap();
        assert_eq!(config.application, "MetaApi");
        assert_eq!(config.router.region, "vint-hill");
        assert_eq!(config.connection.instance_numbers, vec![0, 1]);
        assert_eq!(config.throttler.max_concurrent_synchronizations, 15);
    }

    #[test]
    fn test_missing_sections_take_defaults() {
        let config = load_config_from_str(r#"{"router": {"region": "new-york"}}"#).unwrap();

        assert_eq!(config.router.region, "new-york");
        assert_eq!(config.router.packet_ordering_timeout_in_seconds, 60);
        assert!(config.cache.use_fuzzy_search);
        assert_eq!(config.connection.instance_numbers, vec![0]);
        assert!(config.server.token.is_none());
    }

    #[test]
    fn test_invalid_configs_rejected() {
        assert!(matches!(
            load_config_from_str(r#"{"connection": {"instance_numbers": []}}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            load_config_from_str(r#"{"server": {"url": "not a url"}}"#),
            Err(ConfigError::InvalidUrl(_))
        ));
        assert!(matches!(
            load_config_from_str("{"),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            load_config("/nonexistent/termsync.json"),
            Err(ConfigError::IoError(_))
        ));
    }
}
