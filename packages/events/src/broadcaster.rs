// ABOUTME: Per-run event fan-out with unbounded per-subscriber queues
// ABOUTME: Publishers never block; a slow SSE client cannot stall the run

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::debug;

use codexd_core::RunEventEnvelope;

type SubscriberMap = HashMap<String, HashMap<u64, mpsc::UnboundedSender<RunEventEnvelope>>>;

/// In-memory fan-out of run event envelopes. Every subscriber receives every
/// envelope published for its run after subscription time, in publish order.
#[derive(Clone, Default)]
pub struct EventBroadcaster {
    inner: Arc<BroadcasterInner>,
}

#[derive(Default)]
struct BroadcasterInner {
    runs: Mutex<SubscriberMap>,
    next_id: AtomicU64,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for one run. Dropping the returned
    /// [`Subscription`] removes the queue.
    pub fn subscribe(&self, run_id: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut runs = lock(&self.inner.runs);
        runs.entry(run_id.to_string()).or_default().insert(id, tx);
        debug!(run_id, subscriber = id, "subscribed");
        Subscription {
            run_id: run_id.to_string(),
            id,
            rx,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Enqueue an envelope to every current subscriber of the run. Closed
    /// queues are dropped on the spot.
    pub fn publish(&self, run_id: &str, envelope: &RunEventEnvelope) {
        let mut runs = lock(&self.inner.runs);
        let Some(subscribers) = runs.get_mut(run_id) else {
            return;
        };
        subscribers.retain(|_, tx| tx.send(envelope.clone()).is_ok());
        if subscribers.is_empty() {
            runs.remove(run_id);
        }
    }

    /// Number of live subscribers for a run.
    pub fn subscriber_count(&self, run_id: &str) -> usize {
        lock(&self.inner.runs).get(run_id).map_or(0, HashMap::len)
    }
}

fn lock(mutex: &Mutex<SubscriberMap>) -> std::sync::MutexGuard<'_, SubscriberMap> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A live subscriber queue. FIFO per subscriber; disposal is the Drop impl.
pub struct Subscription {
    run_id: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<RunEventEnvelope>,
    inner: Arc<BroadcasterInner>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<RunEventEnvelope> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<RunEventEnvelope> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut runs = lock(&self.inner.runs);
        if let Some(subscribers) = runs.get_mut(&self.run_id) {
            subscribers.remove(&self.id);
            if subscribers.is_empty() {
                runs.remove(&self.run_id);
            }
        }
        debug!(run_id = %self.run_id, subscriber = self.id, "unsubscribed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use codexd_core::event_type;
    use serde_json::json;

    fn envelope(n: u64) -> RunEventEnvelope {
        RunEventEnvelope::new(event_type::CODEX_NOTIFICATION, Utc::now(), json!({ "n": n }))
    }

    #[tokio::test]
    async fn subscribers_receive_in_publish_order() {
        let broadcaster = EventBroadcaster::new();
        let mut sub = broadcaster.subscribe("run-1");
        for n in 0..10 {
            broadcaster.publish("run-1", &envelope(n));
        }
        for n in 0..10 {
            let received = sub.recv().await.unwrap();
            assert_eq!(received.data["n"], n);
        }
    }

    #[tokio::test]
    async fn events_before_subscription_are_not_delivered() {
        let broadcaster = EventBroadcaster::new();
        broadcaster.publish("run-1", &envelope(0));
        let mut sub = broadcaster.subscribe("run-1");
        broadcaster.publish("run-1", &envelope(1));
        assert_eq!(sub.recv().await.unwrap().data["n"], 1);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn runs_are_isolated() {
        let broadcaster = EventBroadcaster::new();
        let mut sub_a = broadcaster.subscribe("run-a");
        let _sub_b = broadcaster.subscribe("run-b");
        broadcaster.publish("run-b", &envelope(7));
        assert!(sub_a.try_recv().is_none());
    }

    #[tokio::test]
    async fn dropping_a_subscription_releases_the_queue() {
        let broadcaster = EventBroadcaster::new();
        let sub = broadcaster.subscribe("run-1");
        assert_eq!(broadcaster.subscriber_count("run-1"), 1);
        drop(sub);
        assert_eq!(broadcaster.subscriber_count("run-1"), 0);
    }

    #[tokio::test]
    async fn publish_never_blocks_on_a_slow_subscriber() {
        let broadcaster = EventBroadcaster::new();
        let mut sub = broadcaster.subscribe("run-1");
        // Nobody is draining; all publishes must still return immediately.
        for n in 0..10_000 {
            broadcaster.publish("run-1", &envelope(n));
        }
        assert_eq!(sub.recv().await.unwrap().data["n"], 0);
    }
}
