//! Terminal synchronization engine
//!
//! Owns the packet router, the shared hash cache and the connection registry of one
//! process. Nothing is global: every resource is released by `close()`.

use chrono::{DateTime, Utc};
use log::info;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use termsync_cache::{StaticIgnoredFieldsProvider, TerminalHashManager};
use termsync_core::AccountType;
use termsync_gateway::{PacketRouter, Transport, WebSocketTransport};
use termsync_ports::{HistoryStorage, IgnoredFieldsProvider, PacketLogger};
use termsync_terminal::{ConnectionRegistry, StreamingConnectionInstance};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};

/// Assembles a `TerminalSyncClient`. Without a transport the WebSocket endpoint of the
/// configuration is used; without a provider no field is ignored when hashing.
pub struct ClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    ignored_fields_provider: Option<Arc<dyn IgnoredFieldsProvider>>,
    packet_logger: Option<Arc<dyn PacketLogger>>,
}

impl ClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            transport: None,
            ignored_fields_provider: None,
            packet_logger: None,
        }
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn ignored_fields_provider(mut self, provider: Arc<dyn IgnoredFieldsProvider>) -> Self {
        self.ignored_fields_provider = Some(provider);
        self
    }

    pub fn packet_logger(mut self, packet_logger: Arc<dyn PacketLogger>) -> Self {
        self.packet_logger = Some(packet_logger);
        self
    }

    /// Validate the configuration and start the background jobs. Must run inside a
    /// tokio runtime.
    pub fn build(self) -> Result<TerminalSyncClient> {
        let config = self.config;
        config.validate()?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(WebSocketTransport::new(
                config.server_url()?,
                config.server.token.clone(),
            )),
        };
        let provider: Arc<dyn IgnoredFieldsProvider> = match self.ignored_fields_provider {
            Some(provider) => provider,
            None => Arc::new(StaticIgnoredFieldsProvider::default()),
        };

        let mut router = PacketRouter::new(config.router.clone(), config.throttler.clone(), transport)
            .with_application(config.application.clone());
        if let Some(packet_logger) = self.packet_logger {
            router = router.with_packet_logger(packet_logger);
        }
        let router = Arc::new(router);
        let hash_manager = Arc::new(TerminalHashManager::new(config.cache.clone(), provider));
        let registry = ConnectionRegistry::new(
            router.clone(),
            hash_manager.clone(),
            config.connection.clone(),
            config.application.clone(),
        );

        router.start();
        hash_manager.start();
        info!(
            "terminal sync client started for {} in region {}",
            config.application, config.router.region
        );
        Ok(TerminalSyncClient {
            config,
            router,
            hash_manager,
            registry,
            closed: AtomicBool::new(false),
        })
    }
}

pub struct TerminalSyncClient {
    config: ClientConfig,
    router: Arc<PacketRouter>,
    hash_manager: Arc<TerminalHashManager>,
    registry: Arc<ConnectionRegistry>,
    closed: AtomicBool,
}

impl TerminalSyncClient {
    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<PacketRouter> {
        &self.router
    }

    pub fn hash_manager(&self) -> &Arc<TerminalHashManager> {
        &self.hash_manager
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Handle on the account's shared connection with in-memory history
    pub async fn connect(
        &self,
        account_id: &str,
        account_type: AccountType,
    ) -> Result<StreamingConnectionInstance> {
        self.connect_with_history(account_id, account_type, None, None)
            .await
    }

    /// Handle on the account's shared connection. History only applies when this call
    /// creates the connection; deals and orders before `history_start_time` are not
    /// requested on the first synchronization.
    pub async fn connect_with_history(
        &self,
        account_id: &str,
        account_type: AccountType,
        history_storage: Option<Arc<dyn HistoryStorage>>,
        history_start_time: Option<DateTime<Utc>>,
    ) -> Result<StreamingConnectionInstance> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        Ok(self
            .registry
            .connect(account_id, account_type, history_storage, history_start_time)
            .await?)
    }

    /// Tear down the account's connection for every consumer
    pub async fn remove_account(&self, account_id: &str) {
        self.registry.remove(account_id).await;
    }

    /// Close every connection, stop the router and the cache jobs
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.registry.close_all().await;
        self.router.close();
        self.hash_manager.stop();
        info!("terminal sync client closed");
    }
}
