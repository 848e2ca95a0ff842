use std::{
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicUsize, Ordering},
};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

use crate::events::{EventEnvelope, Topic};

/// One envelope as observed on one topic. A subscriber on several matching
/// topics receives one delivery per topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub topic: Topic,
    pub envelope: EventEnvelope,
}

#[derive(Default)]
struct Registry {
    subscribers: HashMap<usize, mpsc::UnboundedSender<Delivery>>,
    topics: HashMap<Topic, HashSet<usize>>,
}

impl Registry {
    fn drop_subscriber(&mut self, id: usize) {
        self.subscribers.remove(&id);
        self.topics.retain(|_, ids| {
            ids.remove(&id);
            !ids.is_empty()
        });
    }
}

pub struct Subscription {
    pub id: usize,
    pub receiver: mpsc::UnboundedReceiver<Delivery>,
}

/// Topic fan-out hub. Publishing never blocks on, or fails because of, a
/// subscriber.
#[derive(Default)]
pub struct EventBroadcaster {
    registry: Mutex<Registry>,
    next_id: AtomicUsize,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.registry.lock().await.subscribers.insert(id, tx);
        Subscription { id, receiver: rx }
    }

    /// Returns false for an unknown (already removed) subscriber.
    pub async fn subscribe(&self, id: usize, topic: Topic) -> bool {
        let mut registry = self.registry.lock().await;
        if !registry.subscribers.contains_key(&id) {
            return false;
        }
        tracing::debug!(subscriber = id, topic = %topic, "subscribed");
        registry.topics.entry(topic).or_default().insert(id);
        true
    }

    pub async fn unsubscribe(&self, id: usize, topic: &Topic) {
        let mut registry = self.registry.lock().await;
        if let Some(ids) = registry.topics.get_mut(topic) {
            ids.remove(&id);
            if ids.is_empty() {
                registry.topics.remove(topic);
            }
        }
    }

    pub async fn remove(&self, id: usize) {
        self.registry.lock().await.drop_subscriber(id);
    }

    pub async fn subscriber_count(&self, topic: &Topic) -> usize {
        self.registry
            .lock()
            .await
            .topics
            .get(topic)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    /// Fans `envelope` out to every topic it names. Returns the number of
    /// deliveries handed to live subscribers.
    pub async fn publish(&self, envelope: EventEnvelope) -> usize {
        let targets = {
            let registry = self.registry.lock().await;
            let mut targets = Vec::new();
            for topic in envelope.topics() {
                let Some(ids) = registry.topics.get(&topic) else {
                    continue;
                };
                for id in ids {
                    if let Some(tx) = registry.subscribers.get(id) {
                        targets.push((*id, tx.clone(), topic.clone()));
                    }
                }
            }
            targets
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, tx, topic) in targets {
            let delivery = Delivery {
                topic,
                envelope: envelope.clone(),
            };
            if tx.send(delivery).is_ok() {
                delivered += 1;
            } else {
                dead.push(id);
            }
        }

        if !dead.is_empty() {
            tracing::debug!(subscribers = ?dead, "dropping closed subscribers");
            let mut registry = self.registry.lock().await;
            for id in dead {
                registry.drop_subscriber(id);
            }
        }

        tracing::debug!(
            kind = envelope.kind().as_str(),
            session_id = %envelope.session_id,
            delivered,
            "event published"
        );
        delivered
    }

    pub async fn publish_all(&self, envelopes: impl IntoIterator<Item = EventEnvelope>) {
        for envelope in envelopes {
            self.publish(envelope).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::events::{ChatEvent, StatusPayload};
    use crate::types::*;

    fn status_changed(session_id: &str) -> EventEnvelope {
        let session = ChatSession::new(1, session_id.into(), "v".into(), Channel::Web, Utc::now());
        EventEnvelope::new(ChatEvent::StatusChanged(StatusPayload {
            chat: ChatSnapshot {
                session,
                escalation: None,
            },
            previous_status: ChatStatus::Bot,
            previous_agent: None,
        }))
    }

    #[tokio::test]
    async fn overlapping_subscriptions_get_one_delivery_per_topic() {
        let hub = EventBroadcaster::new();
        let mut sub = hub.register().await;
        assert!(hub.subscribe(sub.id, Topic::chat("s-1")).await);
        assert!(hub.subscribe(sub.id, Topic::ActiveChats).await);

        assert_eq!(hub.publish(status_changed("s-1")).await, 2);
        let first = sub.receiver.recv().await.unwrap();
        let second = sub.receiver.recv().await.unwrap();
        assert_ne!(first.topic, second.topic);
        assert_eq!(first.envelope, second.envelope);
    }

    #[tokio::test]
    async fn other_chats_are_not_delivered() {
        let hub = EventBroadcaster::new();
        let mut sub = hub.register().await;
        hub.subscribe(sub.id, Topic::chat("s-1")).await;

        assert_eq!(hub.publish(status_changed("s-2")).await, 0);
        assert!(sub.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_subscribers_are_pruned_without_failing_publish() {
        let hub = EventBroadcaster::new();
        let sub = hub.register().await;
        hub.subscribe(sub.id, Topic::chat("s-1")).await;
        drop(sub.receiver);

        assert_eq!(hub.publish(status_changed("s-1")).await, 0);
        assert_eq!(hub.subscriber_count(&Topic::chat("s-1")).await, 0);
        assert!(!hub.subscribe(sub.id, Topic::ActiveChats).await);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let hub = EventBroadcaster::new();
        let mut sub = hub.register().await;
        let topic = Topic::chat("s-1");
        hub.subscribe(sub.id, topic.clone()).await;
        hub.unsubscribe(sub.id, &topic).await;

        hub.publish(status_changed("s-1")).await;
        assert!(sub.receiver.try_recv().is_err());
    }
}
