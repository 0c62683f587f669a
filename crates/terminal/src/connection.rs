//! Streaming Connection
//!
//! Binds one account to the packet router. Owns the terminal state of the account,
//! feeds its history storage and drives a synchronize request for every replica
//! stream that authenticates.
//!
//! ```text
//!   Created ──connect──► Synchronizing ──history done──► Synchronized
//!                              ▲                               │
//!                              └────────── disconnect ─────────┘
//!   any ──close──► Closed
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use termsync_cache::TerminalHashManager;
use termsync_core::{InstanceIndex, SynchronizeRequest};
use termsync_gateway::{Backoff, PacketRouter};
use termsync_ports::{
    HistoryStorage, ListenerResult, ReconnectListener, SynchronizationListener,
    SynchronizationStart,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::ConnectionConfig;
use crate::error::{Result, TerminalError};
use crate::state::TerminalState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Created,
    Synchronizing,
    Synchronized,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Progress {
    status: ConnectionStatus,
    connected: bool,
}

/// Synchronization progress of one replica stream
#[derive(Debug, Default)]
struct ReplicaSync {
    connected: bool,
    generation: u64,
    synchronization_id: Option<String>,
    orders_finished: bool,
    deals_finished: bool,
    /// The finished pass referred to data no longer cached
    incomplete: bool,
    task: Option<JoinHandle<()>>,
}

impl ReplicaSync {
    fn is_finished(&self) -> bool {
        self.synchronization_id.is_some() && self.orders_finished && self.deals_finished
    }

    fn is_synchronized(&self) -> bool {
        self.is_finished() && !self.incomplete
    }

    fn reset(&mut self) {
        self.synchronization_id = None;
        self.orders_finished = false;
        self.deals_finished = false;
        self.incomplete = false;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// How a requested synchronization pass ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassOutcome {
    Finished,
    /// Finished, but must be repeated without offering cached hashes
    Incomplete,
    /// The throttler slot expired before the pass finished
    Stalled,
    /// The replica reconnected, went away or the connection closed
    Superseded,
}

fn synchronization_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Shared streaming connection of one account
pub struct StreamingConnection {
    account_id: String,
    router: Arc<PacketRouter>,
    hash_manager: Arc<TerminalHashManager>,
    terminal_state: Arc<TerminalState>,
    history_storage: Arc<dyn HistoryStorage>,
    history_start_time: Option<DateTime<Utc>>,
    config: ConnectionConfig,
    progress: watch::Sender<Progress>,
    /// Bumped on every change of the replica table
    replica_changes: watch::Sender<u64>,
    replicas: Mutex<HashMap<u32, ReplicaSync>>,
    generations: AtomicU64,
    subscribed: AtomicBool,
    me: Weak<Self>,
}

impl StreamingConnection {
    pub fn new(
        account_id: impl Into<String>,
        router: Arc<PacketRouter>,
        hash_manager: Arc<TerminalHashManager>,
        terminal_state: Arc<TerminalState>,
        history_storage: Arc<dyn HistoryStorage>,
        history_start_time: Option<DateTime<Utc>>,
        config: ConnectionConfig,
    ) -> Arc<Self> {
        let (progress, _) = watch::channel(Progress {
            status: ConnectionStatus::Created,
            connected: false,
        });
        let (replica_changes, _) = watch::channel(0);
        Arc::new_cyclic(|me| Self {
            account_id: account_id.into(),
            router,
            hash_manager,
            terminal_state,
            history_storage,
            history_start_time,
            config,
            progress,
            replica_changes,
            replicas: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
            subscribed: AtomicBool::new(false),
            me: me.clone(),
        })
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn terminal_state(&self) -> &Arc<TerminalState> {
        &self.terminal_state
    }

    pub fn history_storage(&self) -> &Arc<dyn HistoryStorage> {
        &self.history_storage
    }

    pub fn status(&self) -> ConnectionStatus {
        self.progress.borrow().status
    }

    pub fn is_connected(&self) -> bool {
        self.progress.borrow().connected
    }

    pub fn is_synchronized(&self) -> bool {
        self.status() == ConnectionStatus::Synchronized
    }

    pub fn is_closed(&self) -> bool {
        self.status() == ConnectionStatus::Closed
    }

    /// True between a successful `connect` and `close`
    pub fn subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst) && !self.is_closed()
    }

    /// Register with the router and subscribe every configured replica. Calling it
    /// again is a no-op.
    pub async fn connect(&self) -> Result<()> {
        if self.is_closed() {
            return Err(TerminalError::Closed);
        }
        if self.subscribed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let me = self.me.upgrade().ok_or(TerminalError::Closed)?;
        self.set_status(ConnectionStatus::Synchronizing);

        // Mirror first so history and completion tracking observe an updated state
        self.router
            .add_synchronization_listener(&self.account_id, self.terminal_state.clone());
        self.router.add_synchronization_listener(
            &self.account_id,
            self.history_storage.clone().as_listener(),
        );
        self.router
            .add_synchronization_listener(&self.account_id, me.clone());
        self.router.add_reconnect_listener(me, &self.account_id);

        if let Err(e) = self
            .hash_manager
            .ensure_ignored_field_lists(self.router.region())
            .await
        {
            warn!(
                "{}: failed to load ignored field lists for {}: {e}",
                self.account_id,
                self.router.region()
            );
        }

        for instance_number in &self.config.instance_numbers {
            self.router.ensure_subscribe(&self.account_id, *instance_number);
        }
        info!("{}: streaming connection opened", self.account_id);
        Ok(())
    }

    pub fn add_synchronization_listener(&self, listener: Arc<dyn SynchronizationListener>) {
        self.router
            .add_synchronization_listener(&self.account_id, listener);
    }

    pub fn remove_synchronization_listener(&self, listener: &Arc<dyn SynchronizationListener>) {
        self.router
            .remove_synchronization_listener(&self.account_id, listener);
    }

    /// Wait until some replica completed a synchronization pass
    pub async fn wait_synchronized(&self, timeout: Duration) -> Result<()> {
        self.wait_for(timeout, "synchronization", |progress| {
            progress.status == ConnectionStatus::Synchronized
        })
        .await
    }

    /// Wait until some replica stream is authenticated
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        self.wait_for(timeout, "connection", |progress| progress.connected)
            .await
    }

    async fn wait_for(
        &self,
        timeout: Duration,
        what: &str,
        ready: impl Fn(&Progress) -> bool,
    ) -> Result<()> {
        let mut progress = self.progress.subscribe();
        if progress.borrow().status == ConnectionStatus::Closed {
            return Err(TerminalError::Closed);
        }
        let waited = tokio::time::timeout(
            timeout,
            progress.wait_for(|progress| ready(progress) || progress.status == ConnectionStatus::Closed),
        )
        .await;
        match waited {
            Ok(Ok(progress)) if progress.status == ConnectionStatus::Closed => {
                Err(TerminalError::Cancelled)
            }
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(TerminalError::Cancelled),
            Err(_) => Err(TerminalError::Timeout(format!(
                "{what} of account {}",
                self.account_id
            ))),
        }
    }

    /// Tear down the connection: cancel waiters, unregister from the router,
    /// unsubscribe every replica and release the cache references of the state
    pub async fn close(&self) {
        if self.is_closed() {
            return;
        }
        self.progress.send_modify(|progress| {
            progress.status = ConnectionStatus::Closed;
            progress.connected = false;
        });
        for (_, mut replica) in self.replicas.lock().drain() {
            replica.reset();
        }
        self.replica_changes.send_modify(|changes| *changes += 1);

        if self.subscribed.load(Ordering::SeqCst) {
            let state: Arc<dyn SynchronizationListener> = self.terminal_state.clone();
            self.router
                .remove_synchronization_listener(&self.account_id, &state);
            let history = self.history_storage.clone().as_listener();
            self.router
                .remove_synchronization_listener(&self.account_id, &history);
            if let Some(me) = self.me.upgrade() {
                let listener: Arc<dyn SynchronizationListener> = me.clone();
                self.router
                    .remove_synchronization_listener(&self.account_id, &listener);
                let reconnect: Arc<dyn ReconnectListener> = me;
                self.router.remove_reconnect_listener(&reconnect);
            }
            self.router.unsubscribe(&self.account_id).await;
        }
        self.terminal_state.close();
        info!("{}: streaming connection closed", self.account_id);
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.progress.send_if_modified(|progress| {
            if progress.status == ConnectionStatus::Closed || progress.status == status {
                return false;
            }
            progress.status = status;
            true
        });
    }

    /// Recompute status and connectivity from the replica table
    fn refresh_progress(&self) {
        self.replica_changes.send_modify(|changes| *changes += 1);
        let (connected, synchronized) = {
            let replicas = self.replicas.lock();
            (
                replicas.values().any(|replica| replica.connected),
                replicas.values().any(ReplicaSync::is_synchronized),
            )
        };
        self.progress.send_if_modified(|progress| {
            if progress.status == ConnectionStatus::Closed {
                return false;
            }
            let status = if synchronized {
                ConnectionStatus::Synchronized
            } else if progress.status == ConnectionStatus::Created {
                ConnectionStatus::Created
            } else {
                ConnectionStatus::Synchronizing
            };
            let next = Progress { status, connected };
            let changed = *progress != next;
            *progress = next;
            changed
        });
    }

    fn is_current(&self, instance_number: u32, generation: u64) -> bool {
        !self.is_closed()
            && self
                .replicas
                .lock()
                .get(&instance_number)
                .is_some_and(|replica| replica.connected && replica.generation == generation)
    }

    /// Request synchronization of one replica until a pass finishes or the replica
    /// goes away. A pass whose throttler slot expires is requested again, and a pass
    /// that referred to data no longer cached is repeated without offering hashes.
    async fn synchronize_loop(self: Arc<Self>, instance: InstanceIndex, generation: u64) {
        let (min, max) = self.config.synchronization_retry_delays();
        let mut backoff = Backoff::new(min, max);
        let mut offer_hashes = true;
        while self.is_current(instance.number, generation) {
            let synchronization_id = synchronization_id();
            if let Err(e) = self
                .synchronize(&instance, generation, &synchronization_id, offer_hashes)
                .await
            {
                warn!(
                    "{}:{instance}: synchronization request failed: {e}",
                    self.account_id
                );
                tokio::time::sleep(backoff.next_delay()).await;
                continue;
            }

            match self.await_pass(&instance, generation, &synchronization_id).await {
                PassOutcome::Finished | PassOutcome::Superseded => return,
                PassOutcome::Incomplete => {
                    info!(
                        "{}:{instance}: repeating synchronization {synchronization_id} without cached hashes",
                        self.account_id
                    );
                    offer_hashes = false;
                }
                PassOutcome::Stalled => {
                    warn!(
                        "{}:{instance}: synchronization {synchronization_id} stalled, requesting a new one",
                        self.account_id
                    );
                    tokio::time::sleep(backoff.next_delay()).await;
                }
            }
        }
    }

    fn pass_outcome(
        &self,
        instance_number: u32,
        generation: u64,
        synchronization_id: &str,
    ) -> Option<PassOutcome> {
        if self.is_closed() {
            return Some(PassOutcome::Superseded);
        }
        let replicas = self.replicas.lock();
        let Some(replica) = replicas.get(&instance_number).filter(|replica| {
            replica.connected
                && replica.generation == generation
                && replica.synchronization_id.as_deref() == Some(synchronization_id)
        }) else {
            return Some(PassOutcome::Superseded);
        };
        if !replica.is_finished() {
            None
        } else if replica.incomplete {
            Some(PassOutcome::Incomplete)
        } else {
            Some(PassOutcome::Finished)
        }
    }

    /// Wait for a requested pass to end. The pass is stalled once it is unfinished and
    /// its throttler slot is gone after a whole synchronization timeout without
    /// progress.
    async fn await_pass(
        &self,
        instance: &InstanceIndex,
        generation: u64,
        synchronization_id: &str,
    ) -> PassOutcome {
        let mut changes = self.replica_changes.subscribe();
        loop {
            if let Some(outcome) = self.pass_outcome(instance.number, generation, synchronization_id) {
                return outcome;
            }
            let Some(throttler) = self.router.throttler_for(&self.account_id, instance.number) else {
                return PassOutcome::Stalled;
            };
            let timeout = throttler.config().synchronization_timeout();
            match tokio::time::timeout(timeout, changes.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return PassOutcome::Superseded,
                Err(_) => {
                    let active = throttler
                        .active_synchronization_ids()
                        .iter()
                        .any(|id| id == synchronization_id);
                    if !active
                        && self
                            .pass_outcome(instance.number, generation, synchronization_id)
                            .is_none()
                    {
                        throttler.remove_synchronization_id(synchronization_id);
                        return PassOutcome::Stalled;
                    }
                }
            }
        }
    }

    async fn synchronize(
        &self,
        instance: &InstanceIndex,
        generation: u64,
        synchronization_id: &str,
        offer_hashes: bool,
    ) -> Result<()> {
        {
            let mut replicas = self.replicas.lock();
            let Some(replica) = replicas
                .get_mut(&instance.number)
                .filter(|replica| replica.generation == generation)
            else {
                return Ok(());
            };
            replica.synchronization_id = Some(synchronization_id.to_string());
            replica.orders_finished = false;
            replica.deals_finished = false;
            replica.incomplete = false;
        }

        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        let starting_history_order_time = self
            .history_storage
            .last_history_order_time(Some(instance.number))
            .or(self.history_start_time)
            .unwrap_or(epoch);
        let starting_deal_time = self
            .history_storage
            .last_deal_time(Some(instance.number))
            .or(self.history_start_time)
            .unwrap_or(epoch);

        let (hashes, current) = if offer_hashes {
            (
                self.terminal_state.get_hashes(),
                self.terminal_state.current_hashes(),
            )
        } else {
            Default::default()
        };
        let request = SynchronizeRequest {
            synchronization_id: synchronization_id.to_string(),
            host: Some(instance.host.clone()),
            starting_history_order_time,
            starting_deal_time,
            hashes,
            specifications_md5: current.specifications_hash,
            positions_md5: current.positions_hash,
            orders_md5: current.orders_hash,
        };
        self.router
            .synchronize(&self.account_id, instance.number, request)
            .await?;
        Ok(())
    }

    /// Mark a history data set finished if it belongs to the running pass
    fn finish_history(
        &self,
        instance: &InstanceIndex,
        synchronization_id: &str,
        mark: impl FnOnce(&mut ReplicaSync),
    ) {
        let incomplete = self.terminal_state.requires_full_synchronization(instance);
        {
            let mut replicas = self.replicas.lock();
            let Some(replica) = replicas.get_mut(&instance.number) else {
                return;
            };
            if replica.synchronization_id.as_deref() != Some(synchronization_id) {
                debug!(
                    "{}:{instance}: ignoring completion of stale synchronization {synchronization_id}",
                    self.account_id
                );
                return;
            }
            mark(replica);
            replica.incomplete = incomplete;
        }
        self.refresh_progress();
    }
}

#[async_trait]
impl SynchronizationListener for StreamingConnection {
    async fn on_connected(&self, instance: &InstanceIndex, _replicas: u32) -> ListenerResult {
        if self.is_closed() {
            return Ok(());
        }
        let Some(me) = self.me.upgrade() else {
            return Ok(());
        };
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut replicas = self.replicas.lock();
            let replica = replicas.entry(instance.number).or_default();
            replica.reset();
            replica.connected = true;
            replica.generation = generation;
            replica.task = Some(tokio::spawn(me.synchronize_loop(instance.clone(), generation)));
        }
        self.refresh_progress();
        debug!("{}:{instance}: replica connected, synchronizing", self.account_id);
        Ok(())
    }

    async fn on_disconnected(&self, instance: &InstanceIndex) -> ListenerResult {
        if let Some(replica) = self.replicas.lock().get_mut(&instance.number) {
            replica.reset();
            replica.connected = false;
        }
        self.refresh_progress();
        Ok(())
    }

    async fn on_synchronization_started(
        &self,
        instance: &InstanceIndex,
        start: &SynchronizationStart,
    ) -> ListenerResult {
        if let Some(replica) = self.replicas.lock().get_mut(&instance.number)
            && start.synchronization_id.is_some()
            && replica.synchronization_id == start.synchronization_id
        {
            replica.orders_finished = false;
            replica.deals_finished = false;
            replica.incomplete = false;
        }
        self.refresh_progress();
        Ok(())
    }

    async fn on_history_orders_synchronized(
        &self,
        instance: &InstanceIndex,
        synchronization_id: &str,
    ) -> ListenerResult {
        self.finish_history(instance, synchronization_id, |replica| {
            replica.orders_finished = true
        });
        Ok(())
    }

    async fn on_deals_synchronized(
        &self,
        instance: &InstanceIndex,
        synchronization_id: &str,
    ) -> ListenerResult {
        self.finish_history(instance, synchronization_id, |replica| {
            replica.deals_finished = true
        });
        Ok(())
    }

    async fn on_stream_closed(&self, instance: &InstanceIndex) -> ListenerResult {
        if let Some(mut replica) = self.replicas.lock().remove(&instance.number) {
            replica.reset();
        }
        self.refresh_progress();
        Ok(())
    }
}

#[async_trait]
impl ReconnectListener for StreamingConnection {
    /// The channel was replaced; every pass running on it is void
    async fn on_reconnected(&self, region: &str, instance_number: u32) -> ListenerResult {
        if region != self.router.region() {
            return Ok(());
        }
        if let Some(replica) = self.replicas.lock().get_mut(&instance_number) {
            replica.reset();
            replica.connected = false;
        }
        self.refresh_progress();
        Ok(())
    }
}
