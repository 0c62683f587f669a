use serde::{Deserialize, Serialize};
use termsync_cache::HashCacheConfig;
use termsync_gateway::{RouterConfig, ThrottlerConfig};
use termsync_terminal::ConnectionConfig;

/// Streaming server endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_url")]
    pub url: String,

    #[serde(default)]
    pub token: Option<String>,
}

fn default_url() -> String {
    "wss://mt-client-api-v1.agiliumtrade.agiliumtrade.ai/ws".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            token: None,
        }
    }
}

/// Complete engine configuration, one section per component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Application the connections are opened for
    #[serde(default = "default_application")]
    pub application: String,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub router: RouterConfig,

    #[serde(default)]
    pub throttler: ThrottlerConfig,

    #[serde(default)]
    pub cache: HashCacheConfig,

    #[serde(default)]
    pub connection: ConnectionConfig,
}

fn default_application() -> String {
    "MetaApi".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            application: default_application(),
            server: ServerConfig::default(),
            router: RouterConfig::default(),
            throttler: ThrottlerConfig::default(),
            cache: HashCacheConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }
}
