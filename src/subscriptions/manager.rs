//! Webhook delivery state machine (component H).
//!
//! Grounded on the teacher's background-task pattern (periodic sweep tasks
//! registered with `ShutdownService`, see `core::shutdown`): rather than one
//! OS timer per consumer, a single `tick` loop walks due consumers each
//! second, matching the idiom the teacher already uses for checkpoint and
//! retention sweeps.

use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::store::{ConsumerState, SubscriptionStore};
use super::token;
use crate::streams::StreamStore;

type HmacSha256 = Hmac<Sha256>;

/// Liveness timeout and continuous-failure GC window are configuration, the
/// rest of the retry schedule is fixed by §4.7.
pub struct WebhookManagerConfig {
    pub request_timeout_ms: u64,
    pub liveness_timeout_ms: i64,
    pub continuous_failure_gc_ms: i64,
    pub callback_token_ttl_secs: u64,
    pub signing_secret: String,
    pub callback_base_path: String,
}

pub struct WebhookManager {
    subscriptions: Arc<SubscriptionStore>,
    streams: Arc<StreamStore>,
    http: reqwest::Client,
    config: WebhookManagerConfig,
}

impl WebhookManager {
    pub fn new(subscriptions: Arc<SubscriptionStore>, streams: Arc<StreamStore>, config: WebhookManagerConfig) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .expect("reqwest client configuration is static and always valid");
        Arc::new(Self { subscriptions, streams, http, config })
    }

    /// Call after a stream create/append: discover matching subscriptions,
    /// ensure consumer instances exist, and wake any IDLE consumer with
    /// pending work.
    pub async fn on_stream_event(&self, path: &str) {
        let matches = self.subscriptions.matching(path);
        for sub in matches {
            let consumer = self.subscriptions.ensure_consumer(&sub.subscription_id, path);
            if consumer.state == ConsumerState::Idle && self.has_pending_work(&consumer.consumer_id) {
                self.wake(&consumer.consumer_id).await;
            }
        }
    }

    pub(crate) fn has_pending_work(&self, consumer_id: &str) -> bool {
        let Some(consumer) = self.subscriptions.get_consumer(consumer_id) else { return false };
        consumer.streams.iter().any(|(path, acked)| match self.streams.get(path) {
            Some(stream) => crate::streams::offset::compare_rendered(&stream.current_offset, acked) == std::cmp::Ordering::Greater,
            None => false,
        })
    }

    async fn wake(&self, consumer_id: &str) {
        let now = chrono::Utc::now().timestamp_millis();
        let Some((epoch, wake_id)) = self.subscriptions.transition_to_waking(consumer_id, now) else { return };
        info!(consumer_id, epoch, "Waking consumer");
        self.attempt_delivery(consumer_id, epoch, &wake_id).await;
    }

    async fn attempt_delivery(&self, consumer_id: &str, epoch: u64, wake_id: &str) {
        let Some(consumer) = self.subscriptions.get_consumer(consumer_id) else { return };
        let Some(sub) = self.subscriptions.get(&consumer.subscription_id) else { return };

        let now = chrono::Utc::now().timestamp();
        let callback_token = token::mint(&self.config.signing_secret, consumer_id, epoch, self.config.callback_token_ttl_secs, now);
        let triggered_by: Vec<&str> = consumer.streams.keys().map(String::as_str).collect();
        let streams_payload: Vec<serde_json::Value> = consumer
            .streams
            .iter()
            .map(|(path, offset)| serde_json::json!({"path": path, "offset": offset}))
            .collect();

        let body = serde_json::json!({
            "consumer_id": consumer_id,
            "epoch": epoch,
            "wake_id": wake_id,
            "primary_stream": consumer.primary_stream,
            "streams": streams_payload,
            "triggered_by": triggered_by,
            "callback": format!("{}/{}", self.config.callback_base_path, consumer_id),
            "token": callback_token,
        });
        let body_bytes = serde_json::to_vec(&body).expect("webhook body is always serializable");

        let mut mac = HmacSha256::new_from_slice(sub.webhook_secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(&body_bytes);
        let signature = hex::encode(mac.finalize().into_bytes());

        let result = self
            .http
            .post(&sub.webhook_url)
            .header("Content-Type", "application/json")
            .header("Webhook-Signature", format!("sha256={signature}"))
            .body(body_bytes)
            .send()
            .await;

        let now_ms = chrono::Utc::now().timestamp_millis();
        match result {
            Ok(resp) if resp.status().is_success() => {
                debug!(consumer_id, epoch, status = %resp.status(), "Webhook delivered");
            }
            Ok(resp) => {
                warn!(consumer_id, epoch, status = %resp.status(), "Webhook delivery rejected");
            }
            Err(e) => {
                warn!(consumer_id, epoch, error = %e, "Webhook delivery failed");
            }
        }
        // Delivery is fire-and-forget w.r.t. claiming: only a valid callback
        // claims the wake. Arm the retry schedule regardless of HTTP outcome
        // so an unclaimed wake is retried.
        let jitter_ms: i64 = rand::thread_rng().gen_range(-1000..=1000);
        self.subscriptions.schedule_retry(consumer_id, now_ms, jitter_ms);
    }

    /// Called by the callback handler after a consumer reports `done`: wake
    /// it again if it still has pending work, otherwise let it return IDLE.
    pub async fn recheck(&self, consumer_id: &str) {
        if self.has_pending_work(consumer_id) {
            self.wake(consumer_id).await;
        } else {
            self.subscriptions.transition_to_idle(consumer_id);
        }
    }

    /// Background sweep: redeliver due retries, expire stale LIVE consumers,
    /// and GC consumers with 3+ days of continuous failure. Intended to be
    /// called on a short interval by a task registered with the shutdown
    /// service.
    pub async fn tick(&self) {
        let now_ms = chrono::Utc::now().timestamp_millis();

        for consumer_id in self.subscriptions.waking_due(now_ms) {
            let Some(consumer) = self.subscriptions.get_consumer(&consumer_id) else { continue };
            let Some(wake_id) = consumer.wake_id.clone() else { continue };
            self.attempt_delivery(&consumer_id, consumer.epoch, &wake_id).await;
        }

        for consumer_id in self.subscriptions.live_stale(now_ms, self.config.liveness_timeout_ms) {
            info!(consumer_id = %consumer_id, "Liveness timeout, returning consumer to IDLE");
            self.subscriptions.transition_to_idle(&consumer_id);
            if self.has_pending_work(&consumer_id) {
                self.wake(&consumer_id).await;
            }
        }

        for consumer_id in self.subscriptions.idle_with_streams() {
            if self.has_pending_work(&consumer_id) {
                self.wake(&consumer_id).await;
            }
        }

        for consumer_id in self.subscriptions.gc_candidates(now_ms, self.config.continuous_failure_gc_ms) {
            warn!(consumer_id = %consumer_id, "Garbage-collecting consumer after continuous delivery failure");
            self.subscriptions.remove_consumer(&consumer_id);
        }
    }

    /// Run the tick loop until `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick().await,
                _ = shutdown.changed() => break,
            }
        }
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionStore> {
        &self.subscriptions
    }

    pub fn config(&self) -> &WebhookManagerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::CreateOptions;

    fn manager() -> (Arc<WebhookManager>, Arc<SubscriptionStore>, Arc<StreamStore>) {
        let (_tx, rx) = watch::channel(false);
        let streams = StreamStore::new(rx);
        let subscriptions = Arc::new(SubscriptionStore::new());
        let config = WebhookManagerConfig {
            request_timeout_ms: 1000,
            liveness_timeout_ms: 45_000,
            continuous_failure_gc_ms: 3 * 24 * 3600 * 1000,
            callback_token_ttl_secs: 300,
            signing_secret: "test-secret".into(),
            callback_base_path: "/callback".into(),
        };
        let manager = WebhookManager::new(subscriptions.clone(), streams.clone(), config);
        (manager, subscriptions, streams)
    }

    #[tokio::test]
    async fn on_stream_event_wakes_idle_consumer_with_pending_data() {
        let (manager, subscriptions, streams) = manager();
        subscriptions.register("s1", "/a", "http://127.0.0.1:1/hook", None, || "secret".into()).unwrap();
        streams.create("/a", CreateOptions::default()).unwrap();
        streams.append("/a", b"x".to_vec(), Default::default()).unwrap();

        manager.on_stream_event("/a").await;

        let consumer = subscriptions.get_consumer("s1#/a").unwrap();
        assert_eq!(consumer.state, ConsumerState::Waking);
        assert_eq!(consumer.epoch, 1);
    }

    #[test]
    fn has_pending_work_false_when_caught_up() {
        let (manager, subscriptions, streams) = manager();
        streams.create("/a", CreateOptions::default()).unwrap();
        let consumer = subscriptions.ensure_consumer("s1", "/a");
        assert!(!manager.has_pending_work(&consumer.consumer_id));
    }
}
