//! In-process topic bus.
//!
//! Maps topic names to the set of currently attached subscribers, without
//! caring which transport each subscriber arrived through. This is where the
//! cross-transport interoperability guarantee lives: a publish fans out to
//! every subscriber of the topic, full stop.

use crate::error::{BrokerError, Result};
use bytes::Bytes;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

/// One published payload as routed by the bus.
#[derive(Debug, Clone)]
pub struct TopicMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// Identifies one live subscription. Required to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    id: u64,
    topic: String,
}

impl SubscriptionHandle {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

struct SubscriberEntry {
    id: u64,
    /// Where the subscriber attached from, for diagnostics only.
    label: String,
    sender: flume::Sender<TopicMessage>,
}

/// Topic-to-subscribers register shared by every transport listener.
///
/// Topic identity is exact-string; there is no wildcard matching.
pub struct TopicBus {
    subscriptions: RwLock<HashMap<String, Vec<SubscriberEntry>>>,
    next_id: AtomicU64,
}

impl TopicBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a subscriber. Every message published to `topic` while the
    /// subscription is live is sent into `sender` exactly once.
    pub async fn subscribe(
        &self,
        topic: &str,
        label: &str,
        sender: flume::Sender<TopicMessage>,
    ) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut subs = self.subscriptions.write().await;
        subs.entry(topic.to_string()).or_default().push(SubscriberEntry {
            id,
            label: label.to_string(),
            sender,
        });
        debug!(topic, label, id, "subscriber registered");
        SubscriptionHandle {
            id,
            topic: topic.to_string(),
        }
    }

    /// Removes a subscription.
    ///
    /// # Errors
    ///
    /// Returns `SubscriptionNotFound` when the handle was already removed,
    /// which callers treat as a no-op.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<()> {
        let mut subs = self.subscriptions.write().await;
        let Some(entries) = subs.get_mut(&handle.topic) else {
            return Err(BrokerError::SubscriptionNotFound(handle.id));
        };
        let before = entries.len();
        entries.retain(|entry| entry.id != handle.id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            subs.remove(&handle.topic);
        }
        if removed {
            debug!(topic = %handle.topic, id = handle.id, "subscriber removed");
            Ok(())
        } else {
            Err(BrokerError::SubscriptionNotFound(handle.id))
        }
    }

    /// Delivers `payload` to every current subscriber of `topic` and returns
    /// the number of subscribers reached.
    ///
    /// The subscriber set is snapshotted atomically under the registry lock,
    /// then the lock is released and deliveries run concurrently, so a
    /// publish racing a (un)subscribe either sees the subscriber or it
    /// doesn't; it can never double-deliver or skip one that stays
    /// registered. A full subscriber queue blocks that subscriber's delivery
    /// path only. Zero subscribers is a no-op.
    pub async fn publish(&self, topic: &str, payload: Bytes) -> usize {
        let snapshot: Vec<(u64, String, flume::Sender<TopicMessage>)> = {
            let subs = self.subscriptions.read().await;
            match subs.get(topic) {
                Some(entries) => entries
                    .iter()
                    .map(|e| (e.id, e.label.clone(), e.sender.clone()))
                    .collect(),
                None => Vec::new(),
            }
        };

        if snapshot.is_empty() {
            trace!(topic, "publish with no subscribers");
            return 0;
        }

        let message = TopicMessage {
            topic: topic.to_string(),
            payload,
        };

        let deliveries = snapshot.iter().map(|(id, label, sender)| {
            let message = message.clone();
            async move {
                match sender.send_async(message).await {
                    Ok(()) => true,
                    Err(_) => {
                        // Receiver dropped mid-publish; its session cleans
                        // the registration up on exit.
                        warn!(topic = %label, id, "subscriber gone during delivery");
                        false
                    }
                }
            }
        });

        let delivered = join_all(deliveries).await.into_iter().filter(|ok| *ok).count();
        trace!(topic, delivered, "publish fanned out");
        delivered
    }

    /// Number of live subscribers for a topic.
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.subscriptions
            .read()
            .await
            .get(topic)
            .map_or(0, Vec::len)
    }

    /// Number of topics with at least one subscriber.
    pub async fn topic_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }
}

impl Default for TopicBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_publish_unsubscribe() {
        let bus = TopicBus::new();
        let (tx, rx) = flume::bounded(16);

        let handle = bus.subscribe("/topic/a", "test", tx).await;
        assert_eq!(bus.subscriber_count("/topic/a").await, 1);
        assert_eq!(bus.topic_count().await, 1);

        let delivered = bus.publish("/topic/a", Bytes::from_static(b"\"x\"")).await;
        assert_eq!(delivered, 1);
        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.topic, "/topic/a");
        assert_eq!(&msg.payload[..], b"\"x\"");

        bus.unsubscribe(&handle).await.unwrap();
        assert_eq!(bus.subscriber_count("/topic/a").await, 0);
        assert_eq!(bus.topic_count().await, 0);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let bus = TopicBus::new();
        assert_eq!(bus.publish("/topic/empty", Bytes::from_static(b"1")).await, 0);
    }

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let bus = TopicBus::new();
        let (tx1, rx1) = flume::bounded(16);
        let (tx2, rx2) = flume::bounded(16);
        let (tx3, rx3) = flume::bounded(16);

        bus.subscribe("/topic/a", "one", tx1).await;
        bus.subscribe("/topic/a", "two", tx2).await;
        bus.subscribe("/topic/b", "other", tx3).await;

        let delivered = bus.publish("/topic/a", Bytes::from_static(b"42")).await;
        assert_eq!(delivered, 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
        assert!(rx3.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_exact_string_topic_identity() {
        let bus = TopicBus::new();
        let (tx, rx) = flume::bounded(16);
        bus.subscribe("/topic/a.b", "test", tx).await;

        bus.publish("/topic/a", Bytes::from_static(b"1")).await;
        bus.publish("/topic/a.b.c", Bytes::from_static(b"2")).await;
        assert!(rx.try_recv().is_err());

        bus.publish("/topic/a.b", Bytes::from_static(b"3")).await;
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_unsubscribe_twice_reports_not_found() {
        let bus = TopicBus::new();
        let (tx, _rx) = flume::bounded(16);
        let handle = bus.subscribe("/topic/a", "test", tx).await;

        bus.unsubscribe(&handle).await.unwrap();
        let err = bus.unsubscribe(&handle).await.unwrap_err();
        assert!(matches!(err, BrokerError::SubscriptionNotFound(_)));
    }

    #[tokio::test]
    async fn test_exactly_once_per_publish() {
        let bus = TopicBus::new();
        let (tx, rx) = flume::bounded(16);
        bus.subscribe("/topic/a", "test", tx).await;

        bus.publish("/topic/a", Bytes::from_static(b"1")).await;
        bus.publish("/topic/a", Bytes::from_static(b"2")).await;

        assert_eq!(rx.len(), 2);
    }

    #[tokio::test]
    async fn test_dropped_receiver_does_not_poison_publish() {
        let bus = TopicBus::new();
        let (tx_dead, rx_dead) = flume::bounded(16);
        let (tx_live, rx_live) = flume::bounded(16);

        bus.subscribe("/topic/a", "dead", tx_dead).await;
        bus.subscribe("/topic/a", "live", tx_live).await;
        drop(rx_dead);

        let delivered = bus.publish("/topic/a", Bytes::from_static(b"1")).await;
        assert_eq!(delivered, 1);
        assert!(rx_live.try_recv().is_ok());
    }
}
