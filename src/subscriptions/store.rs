//! Subscription registry and consumer-instance bookkeeping (component G).

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use thiserror::Error;
use uuid::Uuid;

use super::pattern;

#[derive(Debug, Clone)]
pub struct Subscription {
    pub subscription_id: String,
    pub pattern: String,
    pub webhook_url: String,
    pub webhook_secret: String,
    pub description: Option<String>,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Waking,
    Live,
}

#[derive(Debug, Clone)]
pub struct ConsumerInstance {
    pub consumer_id: String,
    pub subscription_id: String,
    pub primary_stream: String,
    pub state: ConsumerState,
    pub epoch: u64,
    pub wake_id: Option<String>,
    pub wake_id_claimed: bool,
    /// Acked offset per subscribed stream path, including the primary.
    pub streams: HashMap<String, String>,
    pub last_callback_at_ms: i64,
    pub retry_count: u32,
    pub next_retry_at_ms: i64,
    pub first_failure_at_ms: Option<i64>,
    pub last_failure_at_ms: Option<i64>,
    pub created_at_ms: i64,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("subscription not found")]
    NotFound,
    #[error("subscription already exists with a different configuration")]
    Conflict,
    #[error("consumer not found")]
    ConsumerNotFound,
    #[error("wake already claimed by another callback")]
    AlreadyClaimed,
    #[error("epoch mismatch: current epoch is {current}")]
    StaleEpoch { current: u64 },
    #[error("consumer has no remaining subscribed streams")]
    ConsumerGone,
}

fn consumer_key(subscription_id: &str, primary_stream: &str) -> String {
    format!("{subscription_id}#{primary_stream}")
}

pub struct SubscriptionStore {
    subscriptions: RwLock<HashMap<String, Subscription>>,
    consumers: RwLock<HashMap<String, ConsumerInstance>>,
}

impl SubscriptionStore {
    pub fn new() -> Self {
        Self { subscriptions: RwLock::new(HashMap::new()), consumers: RwLock::new(HashMap::new()) }
    }

    /// Register (or idempotently match) a subscription. The webhook secret
    /// is generated on first creation only.
    pub fn register(
        &self,
        subscription_id: &str,
        pattern: &str,
        webhook_url: &str,
        description: Option<String>,
        generate_secret: impl FnOnce() -> String,
    ) -> Result<(Subscription, bool), SubscriptionError> {
        let mut subs = self.subscriptions.write();
        if let Some(existing) = subs.get(subscription_id) {
            if existing.pattern == pattern && existing.webhook_url == webhook_url {
                return Ok((existing.clone(), false));
            }
            return Err(SubscriptionError::Conflict);
        }
        let sub = Subscription {
            subscription_id: subscription_id.to_string(),
            pattern: pattern.to_string(),
            webhook_url: webhook_url.to_string(),
            webhook_secret: generate_secret(),
            description,
            created_at_ms: Utc::now().timestamp_millis(),
        };
        subs.insert(subscription_id.to_string(), sub.clone());
        Ok((sub, true))
    }

    pub fn get(&self, subscription_id: &str) -> Option<Subscription> {
        self.subscriptions.read().get(subscription_id).cloned()
    }

    pub fn list(&self) -> Vec<Subscription> {
        self.subscriptions.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Remove a subscription and every consumer instance it owns.
    pub fn delete(&self, subscription_id: &str) -> bool {
        let removed = self.subscriptions.write().remove(subscription_id).is_some();
        if removed {
            self.consumers.write().retain(|_, c| c.subscription_id != subscription_id);
        }
        removed
    }

    pub fn matching(&self, path: &str) -> Vec<Subscription> {
        self.subscriptions.read().values().filter(|s| pattern::matches(&s.pattern, path)).cloned().collect()
    }

    /// Ensure a consumer instance exists for `(subscription_id, primary_stream)`,
    /// creating it IDLE with the primary stream pre-subscribed at `"-1"`.
    pub fn ensure_consumer(&self, subscription_id: &str, primary_stream: &str) -> ConsumerInstance {
        let key = consumer_key(subscription_id, primary_stream);
        let mut consumers = self.consumers.write();
        consumers
            .entry(key.clone())
            .or_insert_with(|| {
                let now = Utc::now().timestamp_millis();
                let mut streams = HashMap::new();
                streams.insert(primary_stream.to_string(), "-1".to_string());
                ConsumerInstance {
                    consumer_id: key,
                    subscription_id: subscription_id.to_string(),
                    primary_stream: primary_stream.to_string(),
                    state: ConsumerState::Idle,
                    epoch: 0,
                    wake_id: None,
                    wake_id_claimed: false,
                    streams,
                    last_callback_at_ms: now,
                    retry_count: 0,
                    next_retry_at_ms: now,
                    first_failure_at_ms: None,
                    last_failure_at_ms: None,
                    created_at_ms: now,
                }
            })
            .clone()
    }

    pub fn get_consumer(&self, consumer_id: &str) -> Option<ConsumerInstance> {
        self.consumers.read().get(consumer_id).cloned()
    }

    pub fn remove_consumer(&self, consumer_id: &str) {
        self.consumers.write().remove(consumer_id);
    }

    fn with_consumer_mut<R>(&self, consumer_id: &str, f: impl FnOnce(&mut ConsumerInstance) -> R) -> Option<R> {
        let mut consumers = self.consumers.write();
        consumers.get_mut(consumer_id).map(f)
    }

    /// IDLE/LIVE → WAKING. Increments epoch, mints a fresh wake-id, cancels
    /// any pending retry by resetting its bookkeeping.
    pub fn transition_to_waking(&self, consumer_id: &str, now_ms: i64) -> Option<(u64, String)> {
        self.with_consumer_mut(consumer_id, |c| {
            c.state = ConsumerState::Waking;
            c.epoch += 1;
            let wake_id = Uuid::new_v4().to_string();
            c.wake_id = Some(wake_id.clone());
            c.wake_id_claimed = false;
            c.retry_count = 0;
            c.next_retry_at_ms = now_ms;
            (c.epoch, wake_id)
        })
    }

    /// Backoff schedule: `min(2^n * 100ms, 30s) ± 1s jitter` for n ≤ 10,
    /// then a steady `60s ± 5s`.
    pub fn schedule_retry(&self, consumer_id: &str, now_ms: i64, jitter_ms: i64) {
        self.with_consumer_mut(consumer_id, |c| {
            if c.first_failure_at_ms.is_none() {
                c.first_failure_at_ms = Some(now_ms);
            }
            c.last_failure_at_ms = Some(now_ms);
            let base_ms: i64 = if c.retry_count <= 10 {
                (2i64.pow(c.retry_count.min(20)) * 100).min(30_000)
            } else {
                60_000
            };
            c.retry_count += 1;
            c.next_retry_at_ms = now_ms + base_ms + jitter_ms;
        });
    }

    /// First valid callback for a wake claims it; later callbacks for the
    /// same wake-id are rejected.
    pub fn claim_wake(&self, consumer_id: &str, epoch: u64) -> Result<(), SubscriptionError> {
        let mut consumers = self.consumers.write();
        let c = consumers.get_mut(consumer_id).ok_or(SubscriptionError::ConsumerNotFound)?;
        if c.epoch != epoch {
            return Err(SubscriptionError::StaleEpoch { current: c.epoch });
        }
        if c.wake_id_claimed {
            return Err(SubscriptionError::AlreadyClaimed);
        }
        c.wake_id_claimed = true;
        c.first_failure_at_ms = None;
        c.last_failure_at_ms = None;
        Ok(())
    }

    pub fn transition_to_live(&self, consumer_id: &str, now_ms: i64) {
        self.with_consumer_mut(consumer_id, |c| {
            c.state = ConsumerState::Live;
            c.last_callback_at_ms = now_ms;
        });
    }

    pub fn refresh_liveness(&self, consumer_id: &str, now_ms: i64) {
        self.with_consumer_mut(consumer_id, |c| {
            c.last_callback_at_ms = now_ms;
        });
    }

    pub fn transition_to_idle(&self, consumer_id: &str) {
        self.with_consumer_mut(consumer_id, |c| {
            c.state = ConsumerState::Idle;
            c.wake_id = None;
            c.wake_id_claimed = false;
        });
    }

    pub fn ack(&self, consumer_id: &str, acks: &[(String, String)]) -> Result<(), SubscriptionError> {
        self.with_consumer_mut(consumer_id, |c| {
            for (path, offset) in acks {
                c.streams.insert(path.clone(), offset.clone());
            }
        })
        .ok_or(SubscriptionError::ConsumerNotFound)
    }

    pub fn subscribe_stream(&self, consumer_id: &str, path: &str) -> Result<(), SubscriptionError> {
        self.with_consumer_mut(consumer_id, |c| {
            c.streams.entry(path.to_string()).or_insert_with(|| "-1".to_string());
        })
        .ok_or(SubscriptionError::ConsumerNotFound)
    }

    /// Returns `Ok(true)` if that was the last subscribed stream (caller
    /// should delete the consumer and report 410 `CONSUMER_GONE`).
    pub fn unsubscribe_stream(&self, consumer_id: &str, path: &str) -> Result<bool, SubscriptionError> {
        let empty = self
            .with_consumer_mut(consumer_id, |c| {
                c.streams.remove(path);
                c.streams.is_empty()
            })
            .ok_or(SubscriptionError::ConsumerNotFound)?;
        if empty {
            self.remove_consumer(consumer_id);
        }
        Ok(empty)
    }

    pub fn waking_due(&self, now_ms: i64) -> Vec<String> {
        self.consumers
            .read()
            .values()
            .filter(|c| c.state == ConsumerState::Waking && !c.wake_id_claimed && c.next_retry_at_ms <= now_ms)
            .map(|c| c.consumer_id.clone())
            .collect()
    }

    pub fn idle_with_streams(&self) -> Vec<String> {
        self.consumers
            .read()
            .values()
            .filter(|c| c.state == ConsumerState::Idle)
            .map(|c| c.consumer_id.clone())
            .collect()
    }

    pub fn live_stale(&self, now_ms: i64, liveness_timeout_ms: i64) -> Vec<String> {
        self.consumers
            .read()
            .values()
            .filter(|c| c.state == ConsumerState::Live && now_ms - c.last_callback_at_ms > liveness_timeout_ms)
            .map(|c| c.consumer_id.clone())
            .collect()
    }

    pub fn gc_candidates(&self, now_ms: i64, max_continuous_failure_ms: i64) -> Vec<String> {
        self.consumers
            .read()
            .values()
            .filter(|c| match c.first_failure_at_ms {
                Some(first) => now_ms - first > max_continuous_failure_ms,
                None => false,
            })
            .map(|c| c.consumer_id.clone())
            .collect()
    }
}

impl Default for SubscriptionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent_on_matching_config() {
        let store = SubscriptionStore::new();
        let (_, created1) = store.register("s1", "/a/**", "http://x", None, || "secret".into()).unwrap();
        let (_, created2) = store.register("s1", "/a/**", "http://x", None, || "secret2".into()).unwrap();
        assert!(created1);
        assert!(!created2);
    }

    #[test]
    fn register_conflict_on_mismatch() {
        let store = SubscriptionStore::new();
        store.register("s1", "/a/**", "http://x", None, || "secret".into()).unwrap();
        let result = store.register("s1", "/b/**", "http://x", None, || "secret".into());
        assert_eq!(result.unwrap_err(), SubscriptionError::Conflict);
    }

    #[test]
    fn matching_filters_by_pattern() {
        let store = SubscriptionStore::new();
        store.register("s1", "/live/*", "http://x", None, || "secret".into()).unwrap();
        assert_eq!(store.matching("/live/a").len(), 1);
        assert_eq!(store.matching("/other").len(), 0);
    }

    #[test]
    fn wake_claim_is_single_winner() {
        let store = SubscriptionStore::new();
        let consumer = store.ensure_consumer("s1", "/a");
        let (epoch, _wake_id) = store.transition_to_waking(&consumer.consumer_id, 0).unwrap();
        store.claim_wake(&consumer.consumer_id, epoch).unwrap();
        assert_eq!(store.claim_wake(&consumer.consumer_id, epoch).unwrap_err(), SubscriptionError::AlreadyClaimed);
    }

    #[test]
    fn claim_rejects_stale_epoch() {
        let store = SubscriptionStore::new();
        let consumer = store.ensure_consumer("s1", "/a");
        let (epoch, _) = store.transition_to_waking(&consumer.consumer_id, 0).unwrap();
        let result = store.claim_wake(&consumer.consumer_id, epoch + 1);
        assert_eq!(result.unwrap_err(), SubscriptionError::StaleEpoch { current: epoch });
    }

    #[test]
    fn unsubscribe_last_stream_removes_consumer() {
        let store = SubscriptionStore::new();
        let consumer = store.ensure_consumer("s1", "/a");
        let gone = store.unsubscribe_stream(&consumer.consumer_id, "/a").unwrap();
        assert!(gone);
        assert!(store.get_consumer(&consumer.consumer_id).is_none());
    }

    #[test]
    fn retry_backoff_grows_then_steadies() {
        let store = SubscriptionStore::new();
        let consumer = store.ensure_consumer("s1", "/a");
        store.transition_to_waking(&consumer.consumer_id, 0);
        store.schedule_retry(&consumer.consumer_id, 0, 0);
        let c = store.get_consumer(&consumer.consumer_id).unwrap();
        assert_eq!(c.next_retry_at_ms, 100); // 2^0 * 100
        assert_eq!(c.retry_count, 1);
    }
}
