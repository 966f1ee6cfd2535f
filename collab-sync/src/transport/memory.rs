//! In-process pub/sub hub.
//!
//! One tokio broadcast channel per topic; every subscriber gets its own
//! receiver and a forwarder task that filters and re-emits events on the
//! subscriber's unbounded stream. Lagging receivers drop messages rather
//! than stalling the topic.
//!
//! The hub also backs [`RelayServer`](crate::relay::RelayServer), and has a
//! few fault-injection switches for exercising providers against a less
//! polite transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::{PubSub, SubscribeOptions, Subscription, SubscriptionId, TransportError, TransportEvent};
use crate::protocol::PresenceSnapshot;

#[derive(Debug, Clone)]
pub struct MemoryPubSubConfig {
    /// Messages buffered per subscriber before it starts lagging.
    pub capacity: usize,
    /// Deliver broadcasts back to their sender regardless of subscribe options.
    pub echo_self: bool,
    /// Deliver every broadcast twice.
    pub duplicate_delivery: bool,
}

impl Default for MemoryPubSubConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            echo_self: false,
            duplicate_delivery: false,
        }
    }
}

impl MemoryPubSubConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn with_echo_self(mut self, echo_self: bool) -> Self {
        self.echo_self = echo_self;
        self
    }

    pub fn with_duplicate_delivery(mut self, duplicate: bool) -> Self {
        self.duplicate_delivery = duplicate;
        self
    }
}

/// Hub counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub messages_sent: u64,
    pub messages_lagged: u64,
    pub presence_syncs: u64,
}

#[derive(Default)]
struct AtomicHubStats {
    messages_sent: AtomicU64,
    messages_lagged: AtomicU64,
    presence_syncs: AtomicU64,
}

#[derive(Debug)]
enum HubEvent {
    Broadcast { event: String, payload: Value },
    Presence(PresenceSnapshot),
}

#[derive(Debug)]
struct Envelope {
    from: SubscriptionId,
    event: HubEvent,
}

struct Member {
    key: String,
    meta: Option<Value>,
}

struct Topic {
    sender: broadcast::Sender<Arc<Envelope>>,
    members: HashMap<SubscriptionId, Member>,
}

impl Topic {
    fn snapshot(&self) -> PresenceSnapshot {
        let mut snapshot = PresenceSnapshot::new();
        let mut members: Vec<(&SubscriptionId, &Member)> = self.members.iter().collect();
        members.sort_by_key(|(id, _)| **id);
        for (_, member) in members {
            if let Some(meta) = &member.meta {
                snapshot
                    .entry(member.key.clone())
                    .or_default()
                    .push(meta.clone());
            }
        }
        snapshot
    }
}

struct SubscriberEntry {
    topic: String,
    forwarder: JoinHandle<()>,
}

/// In-process [`PubSub`] implementation.
pub struct MemoryPubSub {
    config: MemoryPubSubConfig,
    topics: Mutex<HashMap<String, Topic>>,
    subscribers: Mutex<HashMap<SubscriptionId, SubscriberEntry>>,
    next_id: AtomicU64,
    reject_subscriptions: AtomicBool,
    stats: Arc<AtomicHubStats>,
}

impl MemoryPubSub {
    pub fn new() -> Self {
        Self::with_config(MemoryPubSubConfig::default())
    }

    pub fn with_config(config: MemoryPubSubConfig) -> Self {
        Self {
            config,
            topics: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            reject_subscriptions: AtomicBool::new(false),
            stats: Arc::new(AtomicHubStats::default()),
        }
    }

    pub fn config(&self) -> &MemoryPubSubConfig {
        &self.config
    }

    /// Make every subsequent `subscribe` fail (simulates an unreachable
    /// or refusing service).
    pub fn set_reject_subscriptions(&self, reject: bool) {
        self.reject_subscriptions.store(reject, Ordering::SeqCst);
    }

    /// Current membership of a topic.
    pub fn presence_state(&self, topic: &str) -> PresenceSnapshot {
        self.topics
            .lock()
            .get(topic)
            .map(Topic::snapshot)
            .unwrap_or_default()
    }

    /// Subscribers on a topic (tracked or not).
    pub fn member_count(&self, topic: &str) -> usize {
        self.topics.lock().get(topic).map_or(0, |t| t.members.len())
    }

    pub fn topic_count(&self) -> usize {
        self.topics.lock().len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn active_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.lock().keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_lagged: self.stats.messages_lagged.load(Ordering::Relaxed),
            presence_syncs: self.stats.presence_syncs.load(Ordering::Relaxed),
        }
    }

    fn topic_of(&self, id: SubscriptionId) -> Result<String, TransportError> {
        self.subscribers
            .lock()
            .get(&id)
            .map(|s| s.topic.clone())
            .ok_or(TransportError::NotSubscribed)
    }

    fn publish_presence(&self, topic: &Topic, from: SubscriptionId) {
        let envelope = Envelope {
            from,
            event: HubEvent::Presence(topic.snapshot()),
        };
        // No receivers is fine: the topic may be emptying out.
        let _ = topic.sender.send(Arc::new(envelope));
        self.stats.presence_syncs.fetch_add(1, Ordering::Relaxed);
    }

    fn spawn_forwarder(
        &self,
        id: SubscriptionId,
        mut rx: broadcast::Receiver<Arc<Envelope>>,
        tx: mpsc::UnboundedSender<TransportEvent>,
        receive_own: bool,
    ) -> JoinHandle<()> {
        let duplicate = self.config.duplicate_delivery;
        let stats = Arc::clone(&self.stats);

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => {
                        let event = match &envelope.event {
                            HubEvent::Broadcast { event, payload } => {
                                if envelope.from == id && !receive_own {
                                    continue;
                                }
                                TransportEvent::Broadcast {
                                    event: event.clone(),
                                    payload: payload.clone(),
                                }
                            }
                            HubEvent::Presence(snapshot) => {
                                TransportEvent::PresenceSync(snapshot.clone())
                            }
                        };

                        let repeat = duplicate && matches!(event, TransportEvent::Broadcast { .. });
                        if repeat && tx.send(event.clone()).is_err() {
                            break;
                        }
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Subscriber {} lagged, skipped {} messages", id, n);
                        stats.messages_lagged.fetch_add(n, Ordering::Relaxed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Default for MemoryPubSub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn subscribe(
        &self,
        topic: &str,
        options: SubscribeOptions,
    ) -> Result<Subscription, TransportError> {
        if self.reject_subscriptions.load(Ordering::SeqCst) {
            return Err(TransportError::SubscriptionRejected(format!(
                "topic {topic} is not accepting subscriptions"
            )));
        }

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let rx = {
            let mut topics = self.topics.lock();
            let entry = topics.entry(topic.to_string()).or_insert_with(|| Topic {
                sender: broadcast::channel(self.config.capacity.max(1)).0,
                members: HashMap::new(),
            });
            entry.members.insert(
                id,
                Member {
                    key: options.presence_key.clone(),
                    meta: None,
                },
            );
            entry.sender.subscribe()
        };

        let (tx, events) = mpsc::unbounded_channel();
        let receive_own = options.receive_own || self.config.echo_self;
        let forwarder = self.spawn_forwarder(id, rx, tx, receive_own);
        self.subscribers.lock().insert(
            id,
            SubscriberEntry {
                topic: topic.to_string(),
                forwarder,
            },
        );

        log::debug!("{} subscribed to {}", id, topic);
        Ok(Subscription {
            id,
            topic: topic.to_string(),
            events,
        })
    }

    fn broadcast(
        &self,
        id: SubscriptionId,
        event: &str,
        payload: Value,
    ) -> Result<(), TransportError> {
        let topic = self.topic_of(id)?;
        let topics = self.topics.lock();
        let entry = topics.get(&topic).ok_or(TransportError::NotSubscribed)?;

        let envelope = Envelope {
            from: id,
            event: HubEvent::Broadcast {
                event: event.to_string(),
                payload,
            },
        };
        let _ = entry.sender.send(Arc::new(envelope));
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn track(&self, id: SubscriptionId, meta: Value) -> Result<(), TransportError> {
        let topic = self.topic_of(id)?;
        let mut topics = self.topics.lock();
        let entry = topics.get_mut(&topic).ok_or(TransportError::NotSubscribed)?;
        let member = entry.members.get_mut(&id).ok_or(TransportError::NotSubscribed)?;
        member.meta = Some(meta);
        self.publish_presence(entry, id);
        Ok(())
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError> {
        let subscriber = self
            .subscribers
            .lock()
            .remove(&id)
            .ok_or(TransportError::NotSubscribed)?;
        subscriber.forwarder.abort();

        let mut topics = self.topics.lock();
        let now_empty = match topics.get_mut(&subscriber.topic) {
            Some(entry) => {
                entry.members.remove(&id);
                entry.members.is_empty()
            }
            None => false,
        };
        if now_empty {
            topics.remove(&subscriber.topic);
            log::debug!("Topic {} is empty, removed", subscriber.topic);
        } else if let Some(entry) = topics.get(&subscriber.topic) {
            self.publish_presence(entry, id);
        }

        log::debug!("{} left {}", id, subscriber.topic);
        Ok(())
    }
}
