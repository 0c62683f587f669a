//! Connection Registry
//!
//! One streaming connection per (account, application). Consumers get their own
//! `StreamingConnectionInstance` handle; the shared connection lives until the last
//! handle is closed or the account is removed.

use chrono::{DateTime, Utc};
use log::{debug, info};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use termsync_cache::TerminalHashManager;
use termsync_core::AccountType;
use termsync_gateway::PacketRouter;
use termsync_ports::{HistoryStorage, SynchronizationListener};

use crate::config::ConnectionConfig;
use crate::connection::{ConnectionStatus, StreamingConnection};
use crate::error::Result;
use crate::history::MemoryHistoryStorage;
use crate::state::TerminalState;

struct Entry {
    connection: Arc<StreamingConnection>,
    handles: HashSet<String>,
}

pub struct ConnectionRegistry {
    router: Arc<PacketRouter>,
    hash_manager: Arc<TerminalHashManager>,
    config: ConnectionConfig,
    application: String,
    connections: Mutex<HashMap<String, Entry>>,
    me: Weak<Self>,
}

impl ConnectionRegistry {
    pub fn new(
        router: Arc<PacketRouter>,
        hash_manager: Arc<TerminalHashManager>,
        config: ConnectionConfig,
        application: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            router,
            hash_manager,
            config,
            application: application.into(),
            connections: Mutex::new(HashMap::new()),
            me: me.clone(),
        })
    }

    fn key(&self, account_id: &str) -> String {
        format!("{account_id}:{}", self.application)
    }

    /// Handle on the account's connection, creating and connecting it on first use.
    /// Storage and start time only apply when the connection is created.
    pub async fn connect(
        &self,
        account_id: &str,
        account_type: AccountType,
        history_storage: Option<Arc<dyn HistoryStorage>>,
        history_start_time: Option<DateTime<Utc>>,
    ) -> Result<StreamingConnectionInstance> {
        let key = self.key(account_id);
        let handle_id = uuid::Uuid::new_v4().simple().to_string();

        let (connection, created) = {
            let mut connections = self.connections.lock();
            match connections.get_mut(&key) {
                Some(entry) => {
                    entry.handles.insert(handle_id.clone());
                    (entry.connection.clone(), false)
                }
                None => {
                    let terminal_state = Arc::new(TerminalState::new(
                        account_id,
                        account_type,
                        self.hash_manager.clone(),
                    ));
                    let history_storage = history_storage.unwrap_or_else(|| {
                        Arc::new(MemoryHistoryStorage::new()) as Arc<dyn HistoryStorage>
                    });
                    let connection = StreamingConnection::new(
                        account_id,
                        self.router.clone(),
                        self.hash_manager.clone(),
                        terminal_state,
                        history_storage,
                        history_start_time,
                        self.config.clone(),
                    );
                    connections.insert(
                        key.clone(),
                        Entry {
                            connection: connection.clone(),
                            handles: HashSet::from([handle_id.clone()]),
                        },
                    );
                    (connection, true)
                }
            }
        };

        if created {
            if let Err(e) = connection.connect().await {
                self.connections.lock().remove(&key);
                return Err(e);
            }
            info!("{account_id}: connection created for {}", self.application);
        }

        Ok(StreamingConnectionInstance {
            id: handle_id,
            key,
            connection,
            registry: self.me.clone(),
            listeners: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Close the account's connection regardless of open handles
    pub async fn remove(&self, account_id: &str) {
        let entry = self.connections.lock().remove(&self.key(account_id));
        if let Some(entry) = entry {
            entry.connection.close().await;
            info!("{account_id}: connection removed");
        }
    }

    pub fn connection(&self, account_id: &str) -> Option<Arc<StreamingConnection>> {
        self.connections
            .lock()
            .get(&self.key(account_id))
            .map(|entry| entry.connection.clone())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub async fn close_all(&self) {
        let entries: Vec<Entry> = self.connections.lock().drain().map(|(_, entry)| entry).collect();
        for entry in entries {
            entry.connection.close().await;
        }
    }

    /// Drop a handle; the last one closes the shared connection
    async fn release(&self, key: &str, handle_id: &str) {
        let last = {
            let mut connections = self.connections.lock();
            let Some(entry) = connections.get_mut(key) else {
                return;
            };
            entry.handles.remove(handle_id);
            if entry.handles.is_empty() {
                connections.remove(key)
            } else {
                None
            }
        };
        match last {
            Some(entry) => entry.connection.close().await,
            None => debug!("{key}: handle {handle_id} released"),
        }
    }
}

/// One consumer's view of a shared streaming connection
pub struct StreamingConnectionInstance {
    id: String,
    key: String,
    connection: Arc<StreamingConnection>,
    registry: Weak<ConnectionRegistry>,
    listeners: Mutex<Vec<Arc<dyn SynchronizationListener>>>,
    closed: AtomicBool,
}

impl StreamingConnectionInstance {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn account_id(&self) -> &str {
        self.connection.account_id()
    }

    pub fn connection(&self) -> &Arc<StreamingConnection> {
        &self.connection
    }

    pub fn terminal_state(&self) -> &Arc<TerminalState> {
        self.connection.terminal_state()
    }

    pub fn history_storage(&self) -> &Arc<dyn HistoryStorage> {
        self.connection.history_storage()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn is_synchronized(&self) -> bool {
        self.connection.is_synchronized()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.connection.is_closed()
    }

    /// Listeners added here are removed when this handle closes
    pub fn add_synchronization_listener(&self, listener: Arc<dyn SynchronizationListener>) {
        self.connection.add_synchronization_listener(listener.clone());
        self.listeners.lock().push(listener);
    }

    pub fn remove_synchronization_listener(&self, listener: &Arc<dyn SynchronizationListener>) {
        self.connection.remove_synchronization_listener(listener);
        self.listeners
            .lock()
            .retain(|registered| !Arc::ptr_eq(registered, listener));
    }

    pub async fn wait_synchronized(&self, timeout: Duration) -> Result<()> {
        self.connection.wait_synchronized(timeout).await
    }

    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        self.connection.wait_connected(timeout).await
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let listeners: Vec<_> = self.listeners.lock().drain(..).collect();
        for listener in &listeners {
            self.connection.remove_synchronization_listener(listener);
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.release(&self.key, &self.id).await;
        }
    }
}
