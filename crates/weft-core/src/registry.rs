use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use weft_wire::TaskStreamResult;

/// What flows through a subscriber queue: protocol events, then the
/// end-of-stream sentinel that tears the queue down.
#[derive(Debug, Clone)]
pub enum StreamEnvelope {
    Event(TaskStreamResult),
    Close,
}

/// Cooperative-cancel tokens keyed by task id. `stop` cancels the
/// token; the engine notices between steps, never mid-step.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    inner: Arc<RwLock<HashMap<String, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, task_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.inner
            .write()
            .await
            .insert(task_id.to_string(), token.clone());
        token
    }

    /// Cancel the token for a task. Returns false when no run is
    /// registered, letting the caller surface the failure to signal.
    pub async fn cancel(&self, task_id: &str) -> bool {
        match self.inner.read().await.get(task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, task_id: &str) {
        self.inner.write().await.remove(task_id);
    }
}

/// One live subscription to a task's event stream.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::UnboundedReceiver<StreamEnvelope>,
}

/// Per-task fan-out queues: single producer (the run's pump), any
/// number of consumers. Every enqueued envelope is delivered exactly
/// once per connected subscriber; a subscriber whose receiver is gone
/// is dropped silently without affecting the rest.
#[derive(Clone, Default)]
pub struct SubscriberRegistry {
    inner: Arc<RwLock<SubscriberState>>,
}

#[derive(Default)]
struct SubscriberState {
    queues: HashMap<String, Vec<(u64, mpsc::UnboundedSender<StreamEnvelope>)>>,
    next_id: u64,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, task_id: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.write().await;
        let id = state.next_id;
        state.next_id += 1;
        state
            .queues
            .entry(task_id.to_string())
            .or_default()
            .push((id, tx));
        Subscription { id, rx }
    }

    pub async fn unsubscribe(&self, task_id: &str, subscription_id: u64) {
        let mut state = self.inner.write().await;
        if let Some(queues) = state.queues.get_mut(task_id) {
            queues.retain(|(id, _)| *id != subscription_id);
            if queues.is_empty() {
                state.queues.remove(task_id);
            }
        }
    }

    pub async fn publish(&self, task_id: &str, envelope: StreamEnvelope) {
        let mut state = self.inner.write().await;
        if let Some(queues) = state.queues.get_mut(task_id) {
            queues.retain(|(id, tx)| {
                if tx.send(envelope.clone()).is_err() {
                    debug!(task_id, subscription = *id, "dropping dead subscriber");
                    return false;
                }
                true
            });
        }
    }

    /// Close one subscriber only, leaving the task's other queues
    /// untouched. Used when a late subscriber attaches to a task that
    /// already reached a terminal state.
    pub async fn close_one(&self, task_id: &str, subscription_id: u64) {
        let mut state = self.inner.write().await;
        if let Some(queues) = state.queues.get_mut(task_id) {
            if let Some(pos) = queues.iter().position(|(id, _)| *id == subscription_id) {
                let (_, tx) = queues.remove(pos);
                let _ = tx.send(StreamEnvelope::Close);
            }
            if queues.is_empty() {
                state.queues.remove(task_id);
            }
        }
    }

    /// Deliver the close sentinel and tear the task's queues down.
    pub async fn close(&self, task_id: &str) {
        let mut state = self.inner.write().await;
        if let Some(queues) = state.queues.remove(task_id) {
            for (_, tx) in queues {
                let _ = tx.send(StreamEnvelope::Close);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_wire::{StreamEvent, StreamErrorEvent};

    fn envelope() -> StreamEnvelope {
        StreamEnvelope::Event(TaskStreamResult {
            task_id: "t1".into(),
            is_final: false,
            event: StreamEvent::Error(StreamErrorEvent {
                message: "boom".into(),
            }),
        })
    }

    #[tokio::test]
    async fn publish_fans_out_to_every_subscriber() {
        let registry = SubscriberRegistry::new();
        let mut first = registry.subscribe("t1").await;
        let mut second = registry.subscribe("t1").await;
        registry.publish("t1", envelope()).await;
        assert!(matches!(
            first.rx.recv().await,
            Some(StreamEnvelope::Event(_))
        ));
        assert!(matches!(
            second.rx.recv().await,
            Some(StreamEnvelope::Event(_))
        ));
    }

    #[tokio::test]
    async fn dead_subscriber_is_pruned_without_affecting_others() {
        let registry = SubscriberRegistry::new();
        let first = registry.subscribe("t1").await;
        let mut second = registry.subscribe("t1").await;
        drop(first.rx);
        registry.publish("t1", envelope()).await;
        registry.publish("t1", envelope()).await;
        assert!(matches!(
            second.rx.recv().await,
            Some(StreamEnvelope::Event(_))
        ));
    }

    #[tokio::test]
    async fn close_delivers_sentinel_and_tears_down() {
        let registry = SubscriberRegistry::new();
        let mut sub = registry.subscribe("t1").await;
        registry.close("t1").await;
        assert!(matches!(sub.rx.recv().await, Some(StreamEnvelope::Close)));
        // queue is gone; the channel ends after the sentinel
        assert!(sub.rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn cancel_reports_missing_run() {
        let registry = CancellationRegistry::new();
        assert!(!registry.cancel("absent").await);
        let token = registry.create("t1").await;
        assert!(registry.cancel("t1").await);
        assert!(token.is_cancelled());
    }
}
