//! Transport channel adapter: one topic, one replica.
//!
//! Wraps a [`PubSub`] with the replica's typed protocol. Outbound messages
//! are serialized here; inbound events are shape-checked into
//! [`InboundMessage`]s and anything malformed is counted and dropped.

use std::sync::Arc;

use tokio::sync::mpsc;

use super::{PubSub, SubscribeOptions, SubscriptionId, TransportError, TransportEvent};
use crate::error::SyncError;
use crate::presence::ClientId;
use crate::protocol::{InboundMessage, MemberDescriptor, OutboundMessage};

/// Adapter counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterStats {
    pub sent: u64,
    pub received: u64,
    pub rejected: u64,
}

pub struct ChannelAdapter {
    pubsub: Arc<dyn PubSub>,
    topic: String,
    client_id: ClientId,
    receive_own: bool,
    subscription: Option<SubscriptionId>,
    members: Vec<MemberDescriptor>,
    stats: AdapterStats,
}

impl ChannelAdapter {
    pub fn new(pubsub: Arc<dyn PubSub>, topic: impl Into<String>, client_id: impl Into<ClientId>) -> Self {
        Self {
            pubsub,
            topic: topic.into(),
            client_id: client_id.into(),
            receive_own: false,
            subscription: None,
            members: Vec::new(),
            stats: AdapterStats::default(),
        }
    }

    /// Ask the transport to echo our own broadcasts back.
    pub fn with_receive_own(mut self, receive_own: bool) -> Self {
        self.receive_own = receive_own;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    pub fn subscription_id(&self) -> Option<SubscriptionId> {
        self.subscription
    }

    /// Subscribe to the topic and hand back its event stream.
    pub async fn subscribe(
        &mut self,
    ) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError> {
        if self.subscription.is_some() {
            self.unsubscribe().await?;
        }

        let options = SubscribeOptions::new(self.client_id.clone()).with_receive_own(self.receive_own);
        let subscription = self.pubsub.subscribe(&self.topic, options).await?;
        log::info!("Subscribed to {} as {}", self.topic, subscription.id);

        self.subscription = Some(subscription.id);
        Ok(subscription.events)
    }

    /// Leave the topic. Forgets the subscription even if the transport
    /// reports it already gone.
    pub async fn unsubscribe(&mut self) -> Result<(), TransportError> {
        let Some(id) = self.subscription.take() else {
            return Ok(());
        };
        self.members.clear();

        match self.pubsub.unsubscribe(id).await {
            Ok(()) | Err(TransportError::NotSubscribed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Forget the subscription without telling the transport (its stream
    /// already ended).
    pub fn mark_closed(&mut self) {
        self.subscription = None;
        self.members.clear();
    }

    /// Publish our membership descriptor.
    pub async fn track(&self, member: &MemberDescriptor) -> Result<(), SyncError> {
        let id = self.subscription.ok_or(TransportError::NotSubscribed)?;
        let meta = serde_json::to_value(member)
            .map_err(|e| crate::protocol::ProtocolError::Serialization(e.to_string()))?;
        self.pubsub.track(id, meta).await?;
        Ok(())
    }

    /// Fire-and-forget broadcast.
    pub fn send(&mut self, message: &OutboundMessage) -> Result<(), SyncError> {
        let id = self.subscription.ok_or(TransportError::NotSubscribed)?;
        let payload = message.to_payload()?;
        self.pubsub.broadcast(id, message.kind().as_str(), payload)?;
        self.stats.sent += 1;
        Ok(())
    }

    /// Validate an inbound transport event. Malformed events are logged and
    /// dropped.
    pub fn parse(&mut self, event: TransportEvent) -> Option<InboundMessage> {
        match event {
            TransportEvent::Broadcast { event, payload } => {
                match InboundMessage::from_broadcast(&event, payload) {
                    Ok(message) => {
                        self.stats.received += 1;
                        Some(message)
                    }
                    Err(e) => {
                        log::warn!("Discarding {} event on {}: {}", event, self.topic, e);
                        self.stats.rejected += 1;
                        None
                    }
                }
            }
            TransportEvent::PresenceSync(snapshot) => {
                let (message, rejected) = InboundMessage::from_presence(snapshot);
                for e in &rejected {
                    log::warn!("Discarding membership entry on {}: {}", self.topic, e);
                }
                self.stats.rejected += rejected.len() as u64;
                self.stats.received += 1;

                if let InboundMessage::PresenceSync(members) = &message {
                    self.members = members.clone();
                }
                Some(message)
            }
        }
    }

    /// Last membership list seen on the topic.
    pub fn members(&self) -> &[MemberDescriptor] {
        &self.members
    }

    pub fn stats(&self) -> AdapterStats {
        self.stats.clone()
    }
}
