//! Synchronization Throttler
//!
//! Admission control for full-state synchronizations on one transport channel.
//! At most `max_concurrent_synchronizations` synchronizations are active at a time;
//! further requests wait in a FIFO queue. The most recent request per
//! `(account, instance, host)` supersedes older ones.

use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::ThrottlerConfig;
use crate::error::ThrottleError;

/// Interval of the expiry sweep
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SlotKey {
    account_id: String,
    instance_number: u32,
    host: String,
}

impl SlotKey {
    fn new(account_id: &str, instance_number: u32, host: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            instance_number,
            host: host.to_string(),
        }
    }
}

#[derive(Debug)]
struct ActiveSlot {
    key: SlotKey,
    synchronization_id: String,
    last_updated: Instant,
}

struct QueuedRequest {
    key: SlotKey,
    synchronization_id: String,
    queued_at: Instant,
    waiter: oneshot::Sender<Result<(), ThrottleError>>,
}

#[derive(Default)]
struct ThrottlerState {
    active: Vec<ActiveSlot>,
    queue: VecDeque<QueuedRequest>,
}

impl ThrottlerState {
    /// Drop the active slot and queued request of `key`
    fn supersede(&mut self, key: &SlotKey) {
        self.active.retain(|slot| &slot.key != key);
        let mut kept = VecDeque::with_capacity(self.queue.len());
        for request in self.queue.drain(..) {
            if &request.key == key {
                let _ = request.waiter.send(Err(ThrottleError::Superseded));
            } else {
                kept.push_back(request);
            }
        }
        self.queue = kept;
    }

    /// Promote queued requests while slots are free
    fn advance(&mut self, max: usize) {
        while self.active.len() < max {
            let Some(request) = self.queue.pop_front() else {
                break;
            };
            if request.waiter.is_closed() {
                continue;
            }
            self.active.push(ActiveSlot {
                key: request.key,
                synchronization_id: request.synchronization_id,
                last_updated: Instant::now(),
            });
            if request.waiter.send(Ok(())).is_err() {
                self.active.pop();
            }
        }
    }
}

pub struct SynchronizationThrottler {
    config: ThrottlerConfig,
    state: Mutex<ThrottlerState>,
    job: Mutex<Option<JoinHandle<()>>>,
}

impl SynchronizationThrottler {
    pub fn new(config: ThrottlerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ThrottlerState::default()),
            job: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ThrottlerConfig {
        &self.config
    }

    /// Start the sweep freeing stuck slots and stale queued requests
    pub fn start(self: &Arc<Self>) {
        let mut job = self.job.lock();
        if job.is_some() {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        *job = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let Some(throttler) = weak.upgrade() else {
                    break;
                };
                throttler.sweep();
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(job) = self.job.lock().take() {
            job.abort();
        }
    }

    /// Wait until a synchronization slot is granted for the request.
    ///
    /// Returns once the synchronize call may be sent. The slot stays active until
    /// the synchronization finishes, is removed or expires.
    pub async fn schedule_synchronize(
        &self,
        account_id: &str,
        instance_number: u32,
        host: &str,
        synchronization_id: &str,
    ) -> Result<(), ThrottleError> {
        let key = SlotKey::new(account_id, instance_number, host);
        let max = self.config.max_concurrent_synchronizations;

        let mut rx = {
            let mut state = self.state.lock();
            state.supersede(&key);
            if state.active.len() < max && state.queue.is_empty() {
                state.active.push(ActiveSlot {
                    key,
                    synchronization_id: synchronization_id.to_string(),
                    last_updated: Instant::now(),
                });
                return Ok(());
            }

            let (tx, rx) = oneshot::channel();
            state.queue.push_back(QueuedRequest {
                key,
                synchronization_id: synchronization_id.to_string(),
                queued_at: Instant::now(),
                waiter: tx,
            });
            state.advance(max);
            debug!(
                "{account_id}:{instance_number}: synchronization {synchronization_id} queued, {} waiting",
                state.queue.len()
            );
            rx
        };

        match tokio::time::timeout(self.config.queue_timeout(), &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ThrottleError::Cancelled),
            Err(_) => {
                self.state
                    .lock()
                    .queue
                    .retain(|request| request.synchronization_id != synchronization_id);
                // Promoted between the timeout and the removal
                if let Ok(result) = rx.try_recv() {
                    return result;
                }
                warn!(
                    "{account_id}:{instance_number}: synchronization {synchronization_id} timed out in the queue"
                );
                Err(ThrottleError::QueueTimeout)
            }
        }
    }

    /// Record progress of an active synchronization
    pub fn update_synchronization_id(&self, synchronization_id: &str) {
        let mut state = self.state.lock();
        if let Some(slot) = state
            .active
            .iter_mut()
            .find(|slot| slot.synchronization_id == synchronization_id)
        {
            slot.last_updated = Instant::now();
        }
    }

    /// Free the slot of a finished or abandoned synchronization
    pub fn remove_synchronization_id(&self, synchronization_id: &str) {
        let mut state = self.state.lock();
        state
            .active
            .retain(|slot| slot.synchronization_id != synchronization_id);
        let mut kept = VecDeque::with_capacity(state.queue.len());
        for request in state.queue.drain(..) {
            if request.synchronization_id == synchronization_id {
                let _ = request.waiter.send(Err(ThrottleError::Cancelled));
            } else {
                kept.push_back(request);
            }
        }
        state.queue = kept;
        state.advance(self.config.max_concurrent_synchronizations);
    }

    /// Free the slot and queued request of one replica of an account
    pub fn remove_id_by_parameters(&self, account_id: &str, instance_number: u32, host: &str) {
        let key = SlotKey::new(account_id, instance_number, host);
        let mut state = self.state.lock();
        state.supersede(&key);
        state.advance(self.config.max_concurrent_synchronizations);
    }

    /// The channel was lost: cancel everything
    pub fn on_disconnect(&self) {
        let mut state = self.state.lock();
        state.active.clear();
        for request in state.queue.drain(..) {
            let _ = request.waiter.send(Err(ThrottleError::Cancelled));
        }
    }

    /// Accounts with an active synchronization
    pub fn synchronizing_accounts(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut seen = HashSet::new();
        state
            .active
            .iter()
            .filter(|slot| seen.insert(slot.key.account_id.clone()))
            .map(|slot| slot.key.account_id.clone())
            .collect()
    }

    pub fn active_synchronization_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .active
            .iter()
            .map(|slot| slot.synchronization_id.clone())
            .collect()
    }

    pub fn is_synchronization_available(&self) -> bool {
        self.state.lock().active.len() < self.config.max_concurrent_synchronizations
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// One expiry pass
    pub fn sweep(&self) {
        let now = Instant::now();
        let synchronization_timeout = self.config.synchronization_timeout();
        let queue_timeout = self.config.queue_timeout();
        let mut state = self.state.lock();

        state.active.retain(|slot| {
            let alive = now.duration_since(slot.last_updated) < synchronization_timeout;
            if !alive {
                info!(
                    "{}:{}: synchronization {} made no progress, freeing its slot",
                    slot.key.account_id, slot.key.instance_number, slot.synchronization_id
                );
            }
            alive
        });

        let mut kept = VecDeque::with_capacity(state.queue.len());
        for request in state.queue.drain(..) {
            if request.waiter.is_closed() {
                continue;
            }
            if now.duration_since(request.queued_at) >= queue_timeout {
                let _ = request.waiter.send(Err(ThrottleError::QueueTimeout));
            } else {
                kept.push_back(request);
            }
        }
        state.queue = kept;
        state.advance(self.config.max_concurrent_synchronizations);
    }
}

impl Drop for SynchronizationThrottler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttler(max: usize) -> Arc<SynchronizationThrottler> {
        Arc::new(SynchronizationThrottler::new(ThrottlerConfig {
            max_concurrent_synchronizations: max,
            queue_timeout_in_seconds: 300,
            synchronization_timeout_in_seconds: 10,
        }))
    }

    async fn wait_for_queue(throttler: &SynchronizationThrottler, len: usize) {
        while throttler.queue_len() < len {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_admission() {
        let throttler = throttler(2);
        throttler.schedule_synchronize("A", 0, "ps-mpa-0", "sA").await.unwrap();
        throttler.schedule_synchronize("B", 0, "ps-mpa-0", "sB").await.unwrap();

        let t = throttler.clone();
        let c = tokio::spawn(async move { t.schedule_synchronize("C", 0, "ps-mpa-0", "sC").await });
        wait_for_queue(&throttler, 1).await;
        let t = throttler.clone();
        let d = tokio::spawn(async move { t.schedule_synchronize("D", 0, "ps-mpa-0", "sD").await });
        wait_for_queue(&throttler, 2).await;

        assert_eq!(throttler.active_synchronization_ids(), vec!["sA", "sB"]);
        assert!(!throttler.is_synchronization_available());

        throttler.remove_synchronization_id("sA");
        assert_eq!(c.await.unwrap(), Ok(()));
        assert_eq!(throttler.active_synchronization_ids(), vec!["sB", "sC"]);
        assert_eq!(throttler.queue_len(), 1);

        throttler.remove_synchronization_id("sB");
        assert_eq!(d.await.unwrap(), Ok(()));
        assert_eq!(throttler.synchronizing_accounts(), vec!["C", "D"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_request_supersedes_active_slot() {
        let throttler = throttler(2);
        throttler.schedule_synchronize("A", 0, "ps-mpa-0", "s1").await.unwrap();
        throttler.schedule_synchronize("A", 0, "ps-mpa-0", "s2").await.unwrap();

        assert_eq!(throttler.active_synchronization_ids(), vec!["s2"]);
        assert_eq!(throttler.active_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_request_supersedes_queued_request() {
        let throttler = throttler(1);
        throttler.schedule_synchronize("A", 0, "ps-mpa-0", "sA").await.unwrap();

        let t = throttler.clone();
        let first = tokio::spawn(async move { t.schedule_synchronize("B", 0, "ps-mpa-0", "s1").await });
        wait_for_queue(&throttler, 1).await;

        let t = throttler.clone();
        let second = tokio::spawn(async move { t.schedule_synchronize("B", 0, "ps-mpa-0", "s2").await });
        assert_eq!(first.await.unwrap(), Err(ThrottleError::Superseded));
        wait_for_queue(&throttler, 1).await;

        throttler.remove_synchronization_id("sA");
        assert_eq!(second.await.unwrap(), Ok(()));
        assert_eq!(throttler.active_synchronization_ids(), vec!["s2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_timeout() {
        let throttler = Arc::new(SynchronizationThrottler::new(ThrottlerConfig {
            max_concurrent_synchronizations: 1,
            queue_timeout_in_seconds: 5,
            synchronization_timeout_in_seconds: 600,
        }));
        throttler.schedule_synchronize("A", 0, "ps-mpa-0", "sA").await.unwrap();

        let result = throttler.schedule_synchronize("B", 0, "ps-mpa-0", "sB").await;

        assert_eq!(result, Err(ThrottleError::QueueTimeout));
        assert_eq!(throttler.queue_len(), 0);
        assert_eq!(throttler.active_synchronization_ids(), vec!["sA"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_slot_is_freed() {
        let throttler = throttler(1);
        throttler.start();
        throttler.schedule_synchronize("A", 0, "ps-mpa-0", "sA").await.unwrap();

        let t = throttler.clone();
        let queued = tokio::spawn(async move { t.schedule_synchronize("B", 0, "ps-mpa-0", "sB").await });
        wait_for_queue(&throttler, 1).await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        throttler.update_synchronization_id("sA");
        tokio::time::sleep(Duration::from_secs(8)).await;
        assert_eq!(throttler.active_synchronization_ids(), vec!["sA"]);

        assert_eq!(queued.await.unwrap(), Ok(()));
        assert_eq!(throttler.active_synchronization_ids(), vec!["sB"]);
        throttler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_queue() {
        let throttler = throttler(1);
        throttler.schedule_synchronize("A", 0, "ps-mpa-0", "sA").await.unwrap();
        let t = throttler.clone();
        let queued = tokio::spawn(async move { t.schedule_synchronize("B", 1, "ps-mpa-1", "sB").await });
        wait_for_queue(&throttler, 1).await;

        throttler.on_disconnect();

        assert_eq!(queued.await.unwrap(), Err(ThrottleError::Cancelled));
        assert_eq!(throttler.active_count(), 0);
        assert!(throttler.is_synchronization_available());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_by_parameters() {
        let throttler = throttler(2);
        throttler.schedule_synchronize("A", 0, "ps-mpa-0", "s0").await.unwrap();
        throttler.schedule_synchronize("A", 1, "ps-mpa-1", "s1").await.unwrap();

        throttler.remove_id_by_parameters("A", 0, "ps-mpa-0");

        assert_eq!(throttler.active_synchronization_ids(), vec!["s1"]);
    }
}
