//! Subscription bookkeeping
//!
//! Tracks the subscribe loops in flight per `(account, instance number)` so
//! `ensure_subscribe` stays idempotent, and throttles the unsubscribe requests
//! sent for accounts whose packets keep arriving after unsubscription.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rand::Rng;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Bounded exponential backoff with jitter
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
        }
    }

    /// Next delay, between half and all of the current step, never below `min`
    pub fn next_delay(&mut self) -> Duration {
        let step = self.current;
        self.current = (self.current * 2).min(self.max);
        let jitter = rand::thread_rng().gen_range(0.5..=1.0);
        step.mul_f64(jitter).max(self.min)
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

/// Cancellation signal of one subscribe loop
pub struct SubscriptionHandle {
    cancelled: watch::Receiver<bool>,
}

impl SubscriptionHandle {
    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Resolves once the loop is cancelled
    pub async fn cancelled(&mut self) {
        let _ = self.cancelled.wait_for(|value| *value).await;
    }

    /// Sleep for `delay`; true when cancelled meanwhile
    pub async fn sleep(&mut self, delay: Duration) -> bool {
        let cancelled = &mut self.cancelled;
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancelled.wait_for(|value| *value) => return true,
        }
        self.is_cancelled()
    }
}

pub struct SubscriptionManager {
    subscriptions: DashMap<String, watch::Sender<bool>>,
    unsubscribed: DashMap<String, Instant>,
    unsubscribe_throttling_interval: Duration,
}

impl SubscriptionManager {
    pub fn new(unsubscribe_throttling_interval: Duration) -> Self {
        Self {
            subscriptions: DashMap::new(),
            unsubscribed: DashMap::new(),
            unsubscribe_throttling_interval,
        }
    }

    fn key(account_id: &str, instance_number: u32) -> String {
        format!("{account_id}:{instance_number}")
    }

    /// Register a subscribe loop; `None` if one is already running
    pub fn begin(&self, account_id: &str, instance_number: u32) -> Option<SubscriptionHandle> {
        self.unsubscribed.remove(account_id);
        match self.subscriptions.entry(Self::key(account_id, instance_number)) {
            Entry::Occupied(_) => None,
            Entry::Vacant(entry) => {
                let (tx, rx) = watch::channel(false);
                entry.insert(tx);
                Some(SubscriptionHandle { cancelled: rx })
            }
        }
    }

    pub fn is_subscribing(&self, account_id: &str, instance_number: u32) -> bool {
        self.subscriptions
            .contains_key(&Self::key(account_id, instance_number))
    }

    pub fn is_account_subscribing(&self, account_id: &str) -> bool {
        let prefix = format!("{account_id}:");
        self.subscriptions
            .iter()
            .any(|entry| entry.key().starts_with(&prefix))
    }

    /// Stop the subscribe loop of one instance (authenticated, or given up)
    pub fn complete(&self, account_id: &str, instance_number: u32) {
        if let Some((_, tx)) = self
            .subscriptions
            .remove(&Self::key(account_id, instance_number))
        {
            tx.send_replace(true);
        }
    }

    /// Stop every subscribe loop of an account and remember the unsubscription
    pub fn cancel_account(&self, account_id: &str) {
        let prefix = format!("{account_id}:");
        self.subscriptions.retain(|key, tx| {
            if key.starts_with(&prefix) {
                tx.send_replace(true);
                false
            } else {
                true
            }
        });
        self.unsubscribed
            .insert(account_id.to_string(), Instant::now());
    }

    pub fn cancel_all(&self) {
        self.subscriptions.retain(|_, tx| {
            tx.send_replace(true);
            false
        });
    }

    /// Whether an unsubscribe request for a stray packet of `account_id` is due.
    /// Records the request when it is.
    pub fn should_unsubscribe(&self, account_id: &str) -> bool {
        let now = Instant::now();
        match self.unsubscribed.entry(account_id.to_string()) {
            Entry::Occupied(mut entry) => {
                if now.duration_since(*entry.get()) < self.unsubscribe_throttling_interval {
                    false
                } else {
                    entry.insert(now);
                    true
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_bounded() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let delays: Vec<Duration> = (0..10).map(|_| backoff.next_delay()).collect();

        assert!(delays.iter().all(|d| *d >= Duration::from_secs(1)));
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(30)));
        assert!(delays[9] >= Duration::from_secs(15));

        backoff.reset();
        assert!(backoff.next_delay() <= Duration::from_secs(1));
    }

    #[test]
    fn test_begin_is_idempotent() {
        let manager = SubscriptionManager::new(Duration::from_secs(10));

        let handle = manager.begin("accountId", 0);
        assert!(handle.is_some());
        assert!(manager.begin("accountId", 0).is_none());
        assert!(manager.begin("accountId", 1).is_some());
        assert!(manager.is_account_subscribing("accountId"));

        manager.complete("accountId", 0);
        assert!(handle.unwrap().is_cancelled());
        assert!(!manager.is_subscribing("accountId", 0));
        assert!(manager.begin("accountId", 0).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_wakes_sleeping_loop() {
        let manager = std::sync::Arc::new(SubscriptionManager::new(Duration::from_secs(10)));
        let mut handle = manager.begin("accountId", 0).unwrap();

        let m = manager.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            m.cancel_account("accountId");
        });

        let started = Instant::now();
        assert!(handle.sleep(Duration::from_secs(600)).await);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!manager.is_account_subscribing("accountId"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_is_throttled() {
        let manager = SubscriptionManager::new(Duration::from_secs(10));
        manager.cancel_account("accountId");

        assert!(!manager.should_unsubscribe("accountId"));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(manager.should_unsubscribe("accountId"));
        assert!(!manager.should_unsubscribe("accountId"));
        assert!(manager.should_unsubscribe("otherAccount"));
    }
}
