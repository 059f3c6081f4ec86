use crate::types::RunId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::RwLock;

/// Outbound queue depth per subscriber. A subscriber that falls this
/// far behind is evicted rather than ever blocking a producer.
pub const SUBSCRIBER_QUEUE_DEPTH: usize = 64;

/// Kind of a run event pushed to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StepStart,
    StepComplete,
    StepLog,
    VariableChange,
    RunComplete,
}

/// A single event on a run's stream; serialized to subscribers as
/// `{runId, type, payload}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    pub run_id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub payload: Value,
}

/// A live subscription to one run's event stream. Dropping the
/// receiver ends the subscription from the hub's point of view on the
/// next broadcast.
pub struct Subscription {
    pub id: u64,
    pub receiver: mpsc::Receiver<RunEvent>,
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<RunEvent>,
}

/// Fan-out broadcaster keyed by run id.
///
/// Producers never block: events are enqueued with `try_send`, and a
/// subscriber whose queue is full is evicted: its channel closes and
/// the consumer sees the stream end.
pub struct EventHub {
    subscribers: RwLock<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a subscriber for a run's events
    pub async fn subscribe(&self, run_id: &RunId) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut subscribers = self.subscribers.write().await;
        subscribers
            .entry(run_id.to_string())
            .or_default()
            .push(Subscriber { id, tx });

        Subscription { id, receiver: rx }
    }

    /// Remove a subscriber and release its queue
    pub async fn unsubscribe(&self, run_id: &RunId, subscription_id: u64) {
        let mut subscribers = self.subscribers.write().await;
        let key = run_id.to_string();
        if let Some(list) = subscribers.get_mut(&key) {
            list.retain(|sub| sub.id != subscription_id);
            if list.is_empty() {
                subscribers.remove(&key);
            }
        }
    }

    /// Deliver an event to every current subscriber of the run.
    /// Subscribers with a full or closed queue are evicted.
    pub async fn broadcast(&self, run_id: &RunId, kind: EventKind, payload: Value) {
        let key = run_id.to_string();
        let event = RunEvent {
            run_id: key.clone(),
            kind,
            payload,
        };

        let mut evicted = Vec::new();
        {
            let subscribers = self.subscribers.read().await;
            let Some(list) = subscribers.get(&key) else {
                return;
            };
            for sub in list {
                if let Err(err) = sub.tx.try_send(event.clone()) {
                    if matches!(err, mpsc::error::TrySendError::Full(_)) {
                        tracing::warn!(
                            "evicting slow subscriber {} from run {}",
                            sub.id,
                            key
                        );
                    }
                    evicted.push(sub.id);
                }
            }
        }

        if !evicted.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            if let Some(list) = subscribers.get_mut(&key) {
                list.retain(|sub| !evicted.contains(&sub.id));
                if list.is_empty() {
                    subscribers.remove(&key);
                }
            }
        }
    }

    pub async fn subscriber_count(&self, run_id: &RunId) -> usize {
        let subscribers = self.subscribers.read().await;
        subscribers
            .get(&run_id.to_string())
            .map(|list| list.len())
            .unwrap_or(0)
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers() {
        let hub = EventHub::new();
        let run_id = RunId::new();

        let mut sub = hub.subscribe(&run_id).await;
        hub.broadcast(&run_id, EventKind::StepStart, json!({"stepId": "a"}))
            .await;

        let event = sub.receiver.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::StepStart);
        assert_eq!(event.run_id, run_id.to_string());
        assert_eq!(event.payload["stepId"], json!("a"));
    }

    #[tokio::test]
    async fn test_broadcast_is_scoped_to_run() {
        let hub = EventHub::new();
        let watched = RunId::new();
        let other = RunId::new();

        let mut sub = hub.subscribe(&watched).await;
        hub.broadcast(&other, EventKind::StepStart, json!({})).await;
        hub.broadcast(&watched, EventKind::RunComplete, json!({})).await;

        let event = sub.receiver.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::RunComplete);
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_evicted() {
        let hub = EventHub::new();
        let run_id = RunId::new();

        let mut slow = hub.subscribe(&run_id).await;
        for _ in 0..=SUBSCRIBER_QUEUE_DEPTH {
            hub.broadcast(&run_id, EventKind::StepLog, json!({})).await;
        }

        assert_eq!(hub.subscriber_count(&run_id).await, 0);

        // The queued events are still readable, then the stream ends
        for _ in 0..SUBSCRIBER_QUEUE_DEPTH {
            assert!(slow.receiver.recv().await.is_some());
        }
        assert!(slow.receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_releases_queue() {
        let hub = EventHub::new();
        let run_id = RunId::new();

        let mut sub = hub.subscribe(&run_id).await;
        assert_eq!(hub.subscriber_count(&run_id).await, 1);

        hub.unsubscribe(&run_id, sub.id).await;
        assert_eq!(hub.subscriber_count(&run_id).await, 0);
        assert!(sub.receiver.recv().await.is_none());
    }
}
