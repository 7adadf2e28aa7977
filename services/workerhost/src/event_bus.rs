//! In-process event bus: many-publisher / many-subscriber, filtered by
//! worker id.
//!
//! Follows the per-channel `mpsc` command-trigger pattern used elsewhere in
//! the host: each subscriber gets its own bounded mailbox; the channel's
//! message pump is the sole consumer of its slice. The bus holds only a weak
//! handle back to subscribers so a channel's drop is never blocked by the
//! bus.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::protocol::StreamingMessage;

const SUBSCRIBER_MAILBOX_CAPACITY: usize = 256;

/// An inbound message tagged with the worker it was addressed to.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub worker_id: String,
    pub message: StreamingMessage,
}

/// Handle returned to a subscriber; dropping it unsubscribes.
pub struct Subscription {
    worker_id: String,
    bus: Arc<EventBusInner>,
    receiver: mpsc::Receiver<Envelope>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.subscribers.remove(&self.worker_id);
    }
}

struct EventBusInner {
    subscribers: DashMap<String, mpsc::Sender<Envelope>>,
}

/// The host-wide transport the channel uses to send/receive RPC envelopes.
///
/// Construction, process supervision, and the actual wire transport are
/// external collaborators; this models only the publish/subscribe
/// contract the channel depends on, with an in-process loopback
/// implementation suitable for driving the state machine in tests.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EventBusInner {
                subscribers: DashMap::new(),
            }),
        }
    }

    /// Subscribe to messages addressed to `worker_id`. Replaces any prior
    /// subscription for the same id.
    pub fn subscribe(&self, worker_id: impl Into<String>) -> Subscription {
        let worker_id = worker_id.into();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_MAILBOX_CAPACITY);
        self.inner.subscribers.insert(worker_id.clone(), tx);
        Subscription {
            worker_id,
            bus: self.inner.clone(),
            receiver: rx,
        }
    }

    /// Publish a message tagged by worker id. Non-blocking from the caller's
    /// perspective: a full subscriber mailbox drops the message and is
    /// reported rather than awaited, since outbound publication must never
    /// block a channel's executor on a slow subscriber.
    pub fn publish(&self, worker_id: impl Into<String>, message: StreamingMessage) -> bool {
        let worker_id = worker_id.into();
        if let Some(tx) = self.inner.subscribers.get(&worker_id) {
            tx.try_send(Envelope { worker_id, message }).is_ok()
        } else {
            false
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_is_filtered_by_worker_id() {
        let bus = EventBus::new();
        let mut sub_a = bus.subscribe("worker-a");
        let _sub_b = bus.subscribe("worker-b");

        assert!(bus.publish("worker-a", StreamingMessage::StartStream {
            worker_id: "worker-a".into(),
        }));

        let envelope = sub_a.recv().await.expect("message delivered");
        assert_eq!(envelope.worker_id, "worker-a");
    }

    #[tokio::test]
    async fn publish_to_unknown_worker_reports_false() {
        let bus = EventBus::new();
        assert!(!bus.publish("ghost", StreamingMessage::StartStream {
            worker_id: "ghost".into(),
        }));
    }

    #[tokio::test]
    async fn dropping_subscription_unsubscribes() {
        let bus = EventBus::new();
        {
            let _sub = bus.subscribe("worker-a");
            assert_eq!(bus.subscriber_count(), 1);
        }
        assert_eq!(bus.subscriber_count(), 0);
    }
}
