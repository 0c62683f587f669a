//! Packet Router
//!
//! Owns the transport channels of one region. Accounts are sharded over channels per
//! instance number; inbound packets are put back in sequence order, decoded into
//! synchronization events and queued per account for the listener fan-out.
//! Requests are correlated with their `response` / `processingError` replies by id.

use chrono::Utc;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use termsync_core::{
    InstanceIndex, OutboundRequest, PacketPayload, SynchronizationHashes, SynchronizationPacket,
    SynchronizeRequest,
};
use termsync_ports::{PacketLogger, ReconnectListener, SynchronizationListener, SynchronizationStart};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{RouterConfig, ThrottlerConfig};
use crate::error::{Result, TransportError};
use crate::fanout::{ListenerFanout, SynchronizationEvent};
use crate::orderer::PacketOrderer;
use crate::subscription::{Backoff, SubscriptionManager};
use crate::throttler::SynchronizationThrottler;
use crate::transport::{ChannelSender, Transport, TransportEvent};

/// Interval of the ordering timeout check
const ORDERING_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// One physical channel to an instance number of the region
struct Channel {
    id: u64,
    instance_number: u32,
    sender: Mutex<ChannelSender>,
    connected: AtomicBool,
    locked_until: Mutex<Option<Instant>>,
    accounts: Mutex<HashSet<String>>,
    throttler: Arc<SynchronizationThrottler>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Channel {
    fn sender(&self) -> ChannelSender {
        self.sender.lock().clone()
    }

    fn is_locked(&self) -> bool {
        self.locked_until
            .lock()
            .is_some_and(|until| Instant::now() < until)
    }

    fn lock_until(&self, until: Instant) {
        *self.locked_until.lock() = Some(until);
    }

    fn has_account(&self, account_id: &str) -> bool {
        self.accounts.lock().contains(account_id)
    }

    fn shutdown(&self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
        self.throttler.on_disconnect();
        self.throttler.stop();
    }
}

struct PendingRequest {
    channel_id: u64,
    tx: oneshot::Sender<std::result::Result<Value, TransportError>>,
}

/// A replica that authenticated and is expected to keep sending `status` packets
struct ConnectedInstance {
    account_id: String,
    instance: InstanceIndex,
    status_timer: JoinHandle<()>,
}

fn request_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn assignment_key(account_id: &str, instance_number: u32) -> String {
    format!("{account_id}:{instance_number}")
}

/// Resolve one data set of a `synchronizationStarted` packet against the hashes sent
/// with the synchronize request.
fn resolve_hash(
    hash_index: Option<usize>,
    updated: Option<bool>,
    hashes: &[String],
) -> (bool, Option<String>) {
    match hash_index.and_then(|index| hashes.get(index)) {
        Some(hash) => (false, Some(hash.clone())),
        None => (updated.unwrap_or(true), None),
    }
}

pub struct PacketRouter {
    config: RouterConfig,
    throttler_config: ThrottlerConfig,
    transport: Arc<dyn Transport>,
    packet_logger: Option<Arc<dyn PacketLogger>>,
    application: Option<String>,
    channels: Mutex<HashMap<u32, Vec<Arc<Channel>>>>,
    channel_creation: tokio::sync::Mutex<()>,
    next_channel_id: AtomicU64,
    assignments: DashMap<String, Arc<Channel>>,
    orderer: PacketOrderer,
    subscriptions: SubscriptionManager,
    fanout: ListenerFanout,
    reconnect_listeners: Mutex<Vec<(String, Arc<dyn ReconnectListener>)>>,
    pending: DashMap<String, PendingRequest>,
    synchronization_hashes: DashMap<String, SynchronizationHashes>,
    stream_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    connected_instances: DashMap<String, ConnectedInstance>,
    jobs: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl PacketRouter {
    pub fn new(
        config: RouterConfig,
        throttler_config: ThrottlerConfig,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            orderer: PacketOrderer::new(
                config.packet_ordering_timeout(),
                config.wait_list_size_limit,
            ),
            subscriptions: SubscriptionManager::new(config.unsubscribe_throttling_interval()),
            fanout: ListenerFanout::new(config.event_queue_capacity),
            config,
            throttler_config,
            transport,
            packet_logger: None,
            application: None,
            channels: Mutex::new(HashMap::new()),
            channel_creation: tokio::sync::Mutex::new(()),
            next_channel_id: AtomicU64::new(0),
            assignments: DashMap::new(),
            reconnect_listeners: Mutex::new(Vec::new()),
            pending: DashMap::new(),
            synchronization_hashes: DashMap::new(),
            stream_locks: DashMap::new(),
            connected_instances: DashMap::new(),
            jobs: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_packet_logger(mut self, packet_logger: Arc<dyn PacketLogger>) -> Self {
        self.packet_logger = Some(packet_logger);
        self
    }

    /// Application name attached to every outbound request
    pub fn with_application(mut self, application: impl Into<String>) -> Self {
        self.application = Some(application.into());
        self
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn region(&self) -> &str {
        &self.config.region
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Start the ordering timeout check
    pub fn start(self: &Arc<Self>) {
        let mut jobs = self.jobs.lock();
        if !jobs.is_empty() {
            return;
        }
        let weak = Arc::downgrade(self);
        jobs.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ORDERING_CHECK_INTERVAL);
            loop {
                ticker.tick().await;
                let Some(router) = weak.upgrade() else {
                    break;
                };
                router.check_ordering_timeouts().await;
            }
        }));
        info!("packet router for region {} started", self.config.region);
    }

    /// Tear down every channel, subscription loop and pending request
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for job in self.jobs.lock().drain(..) {
            job.abort();
        }
        self.subscriptions.cancel_all();

        let instances: Vec<String> = self
            .connected_instances
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for key in instances {
            self.release_instance(&key);
        }

        let request_ids: Vec<String> = self.pending.iter().map(|entry| entry.key().clone()).collect();
        for request_id in request_ids {
            if let Some((_, pending)) = self.pending.remove(&request_id) {
                let _ = pending.tx.send(Err(TransportError::ChannelClosed));
            }
        }

        let channels: Vec<Arc<Channel>> = self.channels.lock().drain().flat_map(|(_, c)| c).collect();
        for channel in channels {
            channel.shutdown();
        }
        self.assignments.clear();
        self.fanout.clear();
        info!("packet router for region {} closed", self.config.region);
    }

    // Listeners

    pub fn add_synchronization_listener(
        &self,
        account_id: &str,
        listener: Arc<dyn SynchronizationListener>,
    ) {
        self.fanout.add_listener(account_id, listener);
    }

    pub fn remove_synchronization_listener(
        &self,
        account_id: &str,
        listener: &Arc<dyn SynchronizationListener>,
    ) {
        self.fanout.remove_listener(account_id, listener);
    }

    pub fn listener_count(&self, account_id: &str) -> usize {
        self.fanout.listener_count(account_id)
    }

    /// Accounts with a running listener delivery task
    pub fn event_queue_count(&self) -> usize {
        self.fanout.queue_count()
    }

    pub fn add_reconnect_listener(&self, listener: Arc<dyn ReconnectListener>, account_id: &str) {
        self.reconnect_listeners
            .lock()
            .push((account_id.to_string(), listener));
    }

    pub fn remove_reconnect_listener(&self, listener: &Arc<dyn ReconnectListener>) {
        self.reconnect_listeners
            .lock()
            .retain(|(_, registered)| !Arc::ptr_eq(registered, listener));
    }

    // Channels

    async fn channel_for(
        self: &Arc<Self>,
        account_id: &str,
        instance_number: u32,
    ) -> std::result::Result<Arc<Channel>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::ChannelClosed);
        }
        let key = assignment_key(account_id, instance_number);
        if let Some(channel) = self.assignments.get(&key) {
            return Ok(channel.clone());
        }

        let _creation = self.channel_creation.lock().await;
        if let Some(channel) = self.assignments.get(&key) {
            return Ok(channel.clone());
        }

        let available = self.channels.lock().get(&instance_number).and_then(|channels| {
            channels
                .iter()
                .find(|channel| {
                    !channel.is_locked()
                        && channel.accounts.lock().len() < self.config.max_accounts_per_channel
                })
                .cloned()
        });
        let channel = match available {
            Some(channel) => channel,
            None => self.open_channel(instance_number).await?,
        };

        channel.accounts.lock().insert(account_id.to_string());
        self.assignments.insert(key, channel.clone());
        debug!(
            "{account_id}:{instance_number}: assigned to channel {}",
            channel.id
        );
        Ok(channel)
    }

    async fn open_channel(
        self: &Arc<Self>,
        instance_number: u32,
    ) -> std::result::Result<Arc<Channel>, TransportError> {
        let connection = self
            .transport
            .connect(&self.config.region, instance_number)
            .await?;
        let throttler = Arc::new(SynchronizationThrottler::new(self.throttler_config.clone()));
        throttler.start();

        let channel = Arc::new(Channel {
            id: self.next_channel_id.fetch_add(1, Ordering::SeqCst),
            instance_number,
            sender: Mutex::new(connection.sender),
            connected: AtomicBool::new(true),
            locked_until: Mutex::new(None),
            accounts: Mutex::new(HashSet::new()),
            throttler,
            reader: Mutex::new(None),
        });
        let reader = self.spawn_reader(channel.clone(), connection.events);
        *channel.reader.lock() = Some(reader);

        self.channels
            .lock()
            .entry(instance_number)
            .or_default()
            .push(channel.clone());
        info!(
            "opened channel {} to {}:{instance_number}",
            channel.id, self.config.region
        );
        Ok(channel)
    }

    fn spawn_reader(
        self: &Arc<Self>,
        channel: Arc<Channel>,
        events: mpsc::Receiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut events = events;
            loop {
                let event = events.recv().await;
                let Some(router) = weak.upgrade() else {
                    return;
                };
                match event {
                    Some(TransportEvent::Message(message)) => {
                        router.handle_message(&channel, message).await;
                    }
                    Some(TransportEvent::Closed(reason)) => {
                        if router.is_closed() {
                            return;
                        }
                        router.on_channel_lost(&channel, &reason).await;
                        match router.reconnect(&channel).await {
                            Some(reconnected) => events = reconnected,
                            None => return,
                        }
                    }
                    None => {
                        if router.is_closed() {
                            return;
                        }
                        router.on_channel_lost(&channel, "event stream ended").await;
                        match router.reconnect(&channel).await {
                            Some(reconnected) => events = reconnected,
                            None => return,
                        }
                    }
                }
            }
        })
    }

    async fn on_channel_lost(self: &Arc<Self>, channel: &Channel, reason: &str) {
        warn!(
            "channel {} to {}:{} lost: {reason}",
            channel.id, self.config.region, channel.instance_number
        );
        channel.connected.store(false, Ordering::SeqCst);
        channel.throttler.on_disconnect();

        let request_ids: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.channel_id == channel.id)
            .map(|entry| entry.key().clone())
            .collect();
        for request_id in request_ids {
            if let Some((_, pending)) = self.pending.remove(&request_id) {
                let _ = pending
                    .tx
                    .send(Err(TransportError::Connection(reason.to_string())));
            }
        }

        let lost: Vec<String> = self
            .connected_instances
            .iter()
            .filter(|entry| {
                entry.instance.number == channel.instance_number
                    && channel.has_account(&entry.account_id)
            })
            .map(|entry| entry.key().clone())
            .collect();
        for key in lost {
            if let Some(released) = self.release_instance(&key) {
                self.fanout
                    .enqueue(
                        &released.account_id,
                        released.instance,
                        SynchronizationEvent::Disconnected,
                    )
                    .await;
            }
        }
    }

    /// Reconnect with backoff; the new event stream once connected
    async fn reconnect(self: &Arc<Self>, channel: &Arc<Channel>) -> Option<mpsc::Receiver<TransportEvent>> {
        let (min, max) = self.config.reconnect_delays();
        let mut backoff = Backoff::new(min, max);
        loop {
            tokio::time::sleep(backoff.next_delay()).await;
            if self.is_closed() {
                return None;
            }
            match self
                .transport
                .connect(&self.config.region, channel.instance_number)
                .await
            {
                Ok(connection) => {
                    *channel.sender.lock() = connection.sender;
                    channel.connected.store(true, Ordering::SeqCst);
                    info!(
                        "channel {} to {}:{} reconnected",
                        channel.id, self.config.region, channel.instance_number
                    );
                    self.on_reconnected(channel).await;
                    return Some(connection.events);
                }
                Err(e) => warn!(
                    "failed to reconnect channel {} to {}:{}: {e}",
                    channel.id, self.config.region, channel.instance_number
                ),
            }
        }
    }

    async fn on_reconnected(self: &Arc<Self>, channel: &Channel) {
        let accounts: Vec<String> = channel.accounts.lock().iter().cloned().collect();
        for account_id in &accounts {
            self.ensure_subscribe(account_id, channel.instance_number);
        }

        let listeners: Vec<Arc<dyn ReconnectListener>> = self
            .reconnect_listeners
            .lock()
            .iter()
            .filter(|(account_id, _)| accounts.contains(account_id))
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            if let Err(e) = listener
                .on_reconnected(&self.config.region, channel.instance_number)
                .await
            {
                error!(
                    "failed to notify reconnect listener of {}:{}: {e}",
                    self.config.region, channel.instance_number
                );
            }
        }
    }

    // Requests

    /// Send a request for an account and wait for its reply
    pub async fn rpc_request(
        self: &Arc<Self>,
        account_id: &str,
        instance_number: u32,
        request: OutboundRequest,
        timeout: Option<Duration>,
    ) -> std::result::Result<Value, TransportError> {
        let channel = self.channel_for(account_id, instance_number).await?;
        self.request_on(&channel, request, timeout.unwrap_or(self.config.request_timeout()))
            .await
    }

    async fn request_on(
        &self,
        channel: &Channel,
        request: OutboundRequest,
        timeout: Duration,
    ) -> std::result::Result<Value, TransportError> {
        let request = match &self.application {
            Some(application) => request.with_application(application.clone()),
            None => request,
        };
        let request_id = request.request_id.clone();
        let message = serde_json::to_value(&request)?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            request_id.clone(),
            PendingRequest {
                channel_id: channel.id,
                tx,
            },
        );
        if let Err(e) = channel.sender().send(message).await {
            self.pending.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::ChannelClosed),
            Err(_) => {
                self.pending.remove(&request_id);
                Err(TransportError::Timeout)
            }
        }
    }

    fn complete_request(&self, reply: &Value, result: std::result::Result<Value, TransportError>) {
        let Some(request_id) = reply.get("requestId").and_then(Value::as_str) else {
            return;
        };
        match self.pending.remove(request_id) {
            Some((_, pending)) => {
                let _ = pending.tx.send(result);
            }
            None => debug!("reply to unknown request {request_id}"),
        }
    }

    // Subscriptions

    /// Keep subscribing `account_id` on `instance_number` until the server
    /// authenticates it. No-op when a subscribe loop is already running.
    pub fn ensure_subscribe(self: &Arc<Self>, account_id: &str, instance_number: u32) {
        if self.is_closed() {
            return;
        }
        let Some(mut handle) = self.subscriptions.begin(account_id, instance_number) else {
            return;
        };

        let weak = Arc::downgrade(self);
        let account_id = account_id.to_string();
        let (min, max) = self.config.subscribe_delays();
        tokio::spawn(async move {
            let mut backoff = Backoff::new(min, max);
            loop {
                if handle.is_cancelled() {
                    return;
                }
                let Some(router) = weak.upgrade() else {
                    return;
                };
                let request = OutboundRequest::subscribe(&account_id, request_id(), instance_number);
                let result = tokio::select! {
                    result = router.rpc_request(&account_id, instance_number, request, None) => result,
                    _ = handle.cancelled() => return,
                };

                let delay = match result {
                    Ok(_) => backoff.next_delay(),
                    Err(TransportError::TooManyRequests {
                        recommended_retry_time,
                        message,
                        ..
                    }) => {
                        warn!("{account_id}:{instance_number}: subscription rate limited: {message}");
                        router.unassign(&account_id, instance_number);
                        (recommended_retry_time - Utc::now())
                            .to_std()
                            .unwrap_or_default()
                            .max(min)
                    }
                    Err(TransportError::Unauthorized(message)) => {
                        error!("{account_id}:{instance_number}: subscription rejected: {message}");
                        router.subscriptions.complete(&account_id, instance_number);
                        return;
                    }
                    Err(e) => {
                        debug!("{account_id}:{instance_number}: subscribe attempt failed: {e}");
                        backoff.next_delay()
                    }
                };
                drop(router);

                if handle.sleep(delay).await {
                    return;
                }
            }
        });
    }

    pub fn is_subscribing(&self, account_id: &str, instance_number: u32) -> bool {
        self.subscriptions
            .is_subscribing(account_id, instance_number)
    }

    /// Move an account off a locked channel so its next request picks another one
    fn unassign(&self, account_id: &str, instance_number: u32) {
        let key = assignment_key(account_id, instance_number);
        let locked = self
            .assignments
            .get(&key)
            .is_some_and(|channel| channel.is_locked());
        if locked && let Some((_, channel)) = self.assignments.remove(&key) {
            channel.accounts.lock().remove(account_id);
        }
    }

    /// Stop streaming an account on every instance
    pub async fn unsubscribe(self: &Arc<Self>, account_id: &str) {
        self.subscriptions.cancel_account(account_id);
        self.orderer.clear_account(account_id);
        let prefix = format!("{account_id}:");
        self.stream_locks.retain(|stream_id, _| !stream_id.starts_with(&prefix));

        let released: Vec<ConnectedInstance> = self
            .connected_instances
            .iter()
            .filter(|entry| entry.account_id == account_id)
            .map(|entry| entry.key().clone())
            .collect::<Vec<_>>()
            .into_iter()
            .filter_map(|key| self.release_instance(&key))
            .collect();

        let keys: Vec<String> = self
            .assignments
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .map(|entry| entry.key().clone())
            .collect();
        let mut channels: Vec<Arc<Channel>> = Vec::new();
        for key in keys {
            if let Some((_, channel)) = self.assignments.remove(&key) {
                channel.accounts.lock().remove(account_id);
                for instance in released.iter().map(|r| &r.instance) {
                    if instance.number == channel.instance_number {
                        channel
                            .throttler
                            .remove_id_by_parameters(account_id, instance.number, &instance.host);
                    }
                }
                channels.push(channel);
            }
        }

        for channel in channels {
            let request = OutboundRequest::unsubscribe(account_id, request_id());
            match self
                .request_on(&channel, request, self.config.request_timeout())
                .await
            {
                Ok(_) | Err(TransportError::NotFound(_)) => {}
                Err(e) => debug!("{account_id}: unsubscribe request failed: {e}"),
            }
        }
        info!("{account_id}: unsubscribed");
    }

    // Synchronization

    /// Request a synchronization once the channel's throttler grants a slot.
    /// The hashes of the request are kept to resolve the `synchronizationStarted`
    /// reply.
    pub async fn synchronize(
        self: &Arc<Self>,
        account_id: &str,
        instance_number: u32,
        request: SynchronizeRequest,
    ) -> Result<()> {
        let channel = self.channel_for(account_id, instance_number).await?;
        let synchronization_id = request.synchronization_id.clone();
        let host = request.host.clone().unwrap_or_default();

        channel
            .throttler
            .schedule_synchronize(account_id, instance_number, &host, &synchronization_id)
            .await?;
        self.synchronization_hashes
            .insert(synchronization_id.clone(), request.hashes.clone());

        let outbound = OutboundRequest::synchronize(account_id, request_id(), instance_number, request);
        match self
            .request_on(&channel, outbound, self.config.request_timeout())
            .await
        {
            Ok(_) => {
                debug!("{account_id}:{instance_number}: synchronization {synchronization_id} requested");
                Ok(())
            }
            Err(e) => {
                channel.throttler.remove_synchronization_id(&synchronization_id);
                self.synchronization_hashes.remove(&synchronization_id);
                Err(e.into())
            }
        }
    }

    /// Throttlers of the channels serving `instance_number`
    pub fn throttlers(&self, instance_number: u32) -> Vec<Arc<SynchronizationThrottler>> {
        self.channels
            .lock()
            .get(&instance_number)
            .map(|channels| channels.iter().map(|c| c.throttler.clone()).collect())
            .unwrap_or_default()
    }

    /// Throttler of the channel an account is assigned to
    pub fn throttler_for(
        &self,
        account_id: &str,
        instance_number: u32,
    ) -> Option<Arc<SynchronizationThrottler>> {
        self.assignments
            .get(&assignment_key(account_id, instance_number))
            .map(|channel| channel.throttler.clone())
    }

    pub fn channel_count(&self, instance_number: u32) -> usize {
        self.channels
            .lock()
            .get(&instance_number)
            .map_or(0, |channels| channels.len())
    }

    pub fn assigned_channel(&self, account_id: &str, instance_number: u32) -> Option<u64> {
        self.assignments
            .get(&assignment_key(account_id, instance_number))
            .map(|channel| channel.id)
    }

    pub fn is_channel_connected(&self, account_id: &str, instance_number: u32) -> bool {
        self.assignments
            .get(&assignment_key(account_id, instance_number))
            .is_some_and(|channel| channel.connected.load(Ordering::SeqCst))
    }

    // Inbound

    async fn handle_message(self: &Arc<Self>, channel: &Channel, message: Value) {
        match message.get("type").and_then(Value::as_str) {
            Some("response") => self.complete_request(&message, Ok(message.clone())),
            Some("processingError") => {
                let error = TransportError::from_processing_error(&message);
                if let TransportError::TooManyRequests {
                    recommended_retry_time,
                    ..
                } = &error
                {
                    let wait = (*recommended_retry_time - Utc::now())
                        .to_std()
                        .unwrap_or_default();
                    channel.lock_until(Instant::now() + wait);
                    warn!(
                        "channel {} locked for {wait:?} after a rate limit reply",
                        channel.id
                    );
                }
                self.complete_request(&message, Err(error));
            }
            _ => match serde_json::from_value::<SynchronizationPacket>(message) {
                Ok(mut packet) => {
                    packet.received_at = Some(Utc::now());
                    if self.is_stray(&packet.account_id) {
                        self.on_stray_packet(channel, &packet).await;
                        return;
                    }
                    self.queue_packet(packet).await;
                }
                Err(e) => warn!("dropping malformed packet: {e}"),
            },
        }
    }

    /// A packet for an account nobody listens to and nobody subscribes
    fn is_stray(&self, account_id: &str) -> bool {
        !self.fanout.has_listeners(account_id) && !self.subscriptions.is_account_subscribing(account_id)
    }

    async fn on_stray_packet(&self, channel: &Channel, packet: &SynchronizationPacket) {
        debug!(
            "{}: dropping {} packet of an unsubscribed account",
            packet.stream_id(),
            packet.type_name()
        );
        if self.subscriptions.should_unsubscribe(&packet.account_id) {
            let request = OutboundRequest::unsubscribe(&packet.account_id, request_id());
            let message = match serde_json::to_value(&request) {
                Ok(message) => message,
                Err(e) => {
                    warn!("failed to serialize unsubscribe request: {e}");
                    return;
                }
            };
            if let Err(e) = channel.sender().send(message).await {
                debug!("{}: unsubscribe request failed: {e}", packet.account_id);
            }
        }
    }

    /// Dispatch of one stream is serialized between the reader and the timeout flush
    fn stream_lock(&self, stream_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.stream_locks
            .entry(stream_id.to_string())
            .or_default()
            .clone()
    }

    /// Restore sequence order and dispatch every packet that became ready
    pub async fn queue_packet(self: &Arc<Self>, packet: SynchronizationPacket) {
        let lock = self.stream_lock(&packet.stream_id());
        let _dispatch = lock.lock().await;
        for ready in self.orderer.restore_order(packet) {
            self.process_packet(ready).await;
        }
    }

    async fn check_ordering_timeouts(self: &Arc<Self>) {
        for stream_id in self.orderer.expired_streams() {
            let lock = self.stream_lock(&stream_id);
            let _dispatch = lock.lock().await;
            let Some(timeout) = self.orderer.flush_expired(&stream_id) else {
                continue;
            };
            for packet in timeout.packets {
                self.process_packet(packet).await;
            }
            if timeout.resynchronize {
                warn!(
                    "{}:{}: packets out of order, resynchronizing",
                    timeout.account_id, timeout.instance_number
                );
                self.ensure_subscribe(&timeout.account_id, timeout.instance_number);
            }
        }
    }

    async fn process_packet(self: &Arc<Self>, packet: SynchronizationPacket) {
        if let Some(logger) = &self.packet_logger {
            logger.log_packet(&packet);
        }

        let account_id = packet.account_id.clone();
        let instance = packet.instance(&self.config.region);
        let stream_id = packet.stream_id();
        if let Some(synchronization_id) = &packet.synchronization_id
            && let Some(throttler) = self.throttler_for(&account_id, instance.number)
        {
            throttler.update_synchronization_id(synchronization_id);
        }

        let metrics = packet.account_metrics().unwrap_or_default();
        let synchronization_id = packet.synchronization_id.clone();
        let mut events = Vec::new();
        match packet.payload {
            PacketPayload::Authenticated { replicas, .. } => {
                self.subscriptions.complete(&account_id, instance.number);
                self.touch_instance(&stream_id, &account_id, &instance);
                events.push(SynchronizationEvent::Connected {
                    replicas: replicas.unwrap_or(1),
                });
            }
            PacketPayload::Disconnected => {
                self.release_instance(&stream_id);
                events.push(SynchronizationEvent::Disconnected);
                events.push(SynchronizationEvent::StreamClosed);
                self.resubscribe_later(&account_id, instance.number);
            }
            PacketPayload::Status {
                connected,
                health_status,
            } => {
                self.touch_instance(&stream_id, &account_id, &instance);
                events.push(SynchronizationEvent::BrokerConnectionStatusChanged(connected));
                if let Some(status) = health_status {
                    events.push(SynchronizationEvent::HealthStatus(status));
                }
            }
            PacketPayload::SynchronizationStarted {
                specifications_hash_index,
                positions_hash_index,
                orders_hash_index,
                specifications_updated,
                positions_updated,
                orders_updated,
            } => {
                let hashes = synchronization_id
                    .as_deref()
                    .and_then(|id| self.synchronization_hashes.remove(id))
                    .map(|(_, hashes)| hashes)
                    .unwrap_or_default();
                let (specifications_updated, specifications_hash) = resolve_hash(
                    specifications_hash_index,
                    specifications_updated,
                    &hashes.specifications_hashes,
                );
                let (positions_updated, positions_hash) =
                    resolve_hash(positions_hash_index, positions_updated, &hashes.positions_hashes);
                let (orders_updated, orders_hash) =
                    resolve_hash(orders_hash_index, orders_updated, &hashes.orders_hashes);
                events.push(SynchronizationEvent::SynchronizationStarted(SynchronizationStart {
                    synchronization_id: synchronization_id.clone(),
                    specifications_updated,
                    positions_updated,
                    orders_updated,
                    specifications_hash,
                    positions_hash,
                    orders_hash,
                }));
                // Unchanged data sets are not resent, so their pass ends here
                if let Some(id) = &synchronization_id {
                    if !positions_updated {
                        events.push(SynchronizationEvent::PositionsSynchronized(id.clone()));
                    }
                    if !orders_updated {
                        events.push(SynchronizationEvent::PendingOrdersSynchronized(id.clone()));
                    }
                }
            }
            PacketPayload::AccountInformation {
                account_information,
            } => {
                if let Some(information) = account_information {
                    events.push(SynchronizationEvent::AccountInformationUpdated(information));
                }
            }
            PacketPayload::Positions { positions } => {
                events.push(SynchronizationEvent::PositionsReplaced(positions));
                if let Some(id) = &synchronization_id {
                    events.push(SynchronizationEvent::PositionsSynchronized(id.clone()));
                }
            }
            PacketPayload::Orders { orders } => {
                events.push(SynchronizationEvent::PendingOrdersReplaced(orders));
                if let Some(id) = &synchronization_id {
                    events.push(SynchronizationEvent::PendingOrdersSynchronized(id.clone()));
                }
            }
            PacketPayload::Specifications {
                specifications,
                removed_symbols,
            } => {
                events.push(SynchronizationEvent::SymbolSpecificationsUpdated {
                    specifications,
                    removed_symbols,
                });
            }
            PacketPayload::Update {
                account_information,
                updated_positions,
                removed_position_ids,
                updated_orders,
                completed_order_ids,
                history_orders,
                deals,
            } => {
                if let Some(information) = account_information {
                    events.push(SynchronizationEvent::AccountInformationUpdated(information));
                }
                if !updated_positions.is_empty() || !removed_position_ids.is_empty() {
                    events.push(SynchronizationEvent::PositionsUpdated {
                        positions: updated_positions,
                        removed_ids: removed_position_ids,
                    });
                }
                if !updated_orders.is_empty() || !completed_order_ids.is_empty() {
                    events.push(SynchronizationEvent::PendingOrdersUpdated {
                        orders: updated_orders,
                        completed_ids: completed_order_ids,
                    });
                }
                events.extend(history_orders.into_iter().map(SynchronizationEvent::HistoryOrderAdded));
                events.extend(deals.into_iter().map(SynchronizationEvent::DealAdded));
            }
            PacketPayload::Prices {
                prices,
                candles,
                ticks,
                books,
                ..
            } => {
                if !prices.is_empty() || !metrics.is_empty() {
                    events.push(SynchronizationEvent::SymbolPricesUpdated { prices, metrics });
                }
                if !candles.is_empty() {
                    events.push(SynchronizationEvent::CandlesUpdated { candles, metrics });
                }
                if !ticks.is_empty() {
                    events.push(SynchronizationEvent::TicksUpdated { ticks, metrics });
                }
                if !books.is_empty() {
                    events.push(SynchronizationEvent::BooksUpdated { books, metrics });
                }
            }
            PacketPayload::HistoryOrders { history_orders } => {
                events.extend(history_orders.into_iter().map(SynchronizationEvent::HistoryOrderAdded));
            }
            PacketPayload::Deals { deals } => {
                events.extend(deals.into_iter().map(SynchronizationEvent::DealAdded));
            }
            PacketPayload::OrderSynchronizationFinished => {
                if let Some(id) = &synchronization_id {
                    events.push(SynchronizationEvent::HistoryOrdersSynchronized(id.clone()));
                }
            }
            PacketPayload::DealSynchronizationFinished => {
                if let Some(id) = &synchronization_id {
                    if let Some(throttler) = self.throttler_for(&account_id, instance.number) {
                        throttler.remove_synchronization_id(id);
                    }
                    events.push(SynchronizationEvent::DealsSynchronized(id.clone()));
                }
            }
        }

        for event in events {
            self.fanout
                .enqueue(&account_id, instance.clone(), event)
                .await;
        }
    }

    // Status heartbeat

    /// (Re)start the status timer of a replica
    fn touch_instance(self: &Arc<Self>, stream_id: &str, account_id: &str, instance: &InstanceIndex) {
        let weak = Arc::downgrade(self);
        let timeout = self.config.status_timeout();
        let key = stream_id.to_string();
        let status_timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(router) = weak.upgrade() {
                router.on_status_timeout(&key).await;
            }
        });

        let previous = self.connected_instances.insert(
            stream_id.to_string(),
            ConnectedInstance {
                account_id: account_id.to_string(),
                instance: instance.clone(),
                status_timer,
            },
        );
        if let Some(previous) = previous {
            previous.status_timer.abort();
        }
    }

    fn release_instance(&self, stream_id: &str) -> Option<ConnectedInstance> {
        let (_, released) = self.connected_instances.remove(stream_id)?;
        released.status_timer.abort();
        Some(released)
    }

    async fn on_status_timeout(self: &Arc<Self>, stream_id: &str) {
        let Some((_, timed_out)) = self.connected_instances.remove(stream_id) else {
            return;
        };
        warn!(
            "{}:{}: no status packets for {:?}, treating the replica as disconnected",
            timed_out.account_id,
            timed_out.instance,
            self.config.status_timeout()
        );
        self.fanout
            .enqueue(
                &timed_out.account_id,
                timed_out.instance.clone(),
                SynchronizationEvent::Disconnected,
            )
            .await;
        self.fanout
            .enqueue(
                &timed_out.account_id,
                timed_out.instance.clone(),
                SynchronizationEvent::StreamClosed,
            )
            .await;
        if self.fanout.has_listeners(&timed_out.account_id) {
            self.ensure_subscribe(&timed_out.account_id, timed_out.instance.number);
        }
    }

    /// The server dropped a replica: subscribe again after a short random pause
    fn resubscribe_later(self: &Arc<Self>, account_id: &str, instance_number: u32) {
        let weak = Arc::downgrade(self);
        let account_id = account_id.to_string();
        let delay = Duration::from_millis(rand::thread_rng().gen_range(1000..=5000));
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(router) = weak.upgrade()
                && router.fanout.has_listeners(&account_id)
            {
                router.ensure_subscribe(&account_id, instance_number);
            }
        });
    }
}

impl Drop for PacketRouter {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_hash() {
        let hashes = vec!["h0".to_string(), "h1".to_string()];

        assert_eq!(resolve_hash(Some(1), None, &hashes), (false, Some("h1".to_string())));
        assert_eq!(resolve_hash(Some(5), None, &hashes), (true, None));
        assert_eq!(resolve_hash(None, Some(false), &hashes), (false, None));
        assert_eq!(resolve_hash(None, None, &hashes), (true, None));
    }
}
