//! Topic-based pub/sub transport.
//!
//! The provider talks to the network through [`PubSub`], a small contract
//! modeled on hosted realtime channels: subscribe to a topic, broadcast named
//! events to the other subscribers, and track a membership descriptor that
//! the transport folds into presence-sync events.
//!
//! ```text
//!                    ┌────────────────┐
//!  SyncProvider ───► │ ChannelAdapter │ ── typed messages, validation
//!                    └───────┬────────┘
//!                            │ dyn PubSub
//!              ┌─────────────┴─────────────┐
//!              ▼                           ▼
//!        MemoryPubSub                   WsPubSub ── socket ──► RelayServer
//!       (in-process hub)             (relay client)            (MemoryPubSub)
//! ```
//!
//! Delivery is at-least-once and unordered from the provider's point of
//! view. A subscription's event stream ending means the connection is gone.

pub mod channel;
pub mod memory;
pub mod ws;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::protocol::PresenceSnapshot;

pub use channel::{AdapterStats, ChannelAdapter};
pub use memory::{HubStats, MemoryPubSub, MemoryPubSubConfig};
pub use ws::{WsPubSub, WsPubSubConfig};

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("subscription rejected: {0}")]
    SubscriptionRejected(String),
    #[error("not subscribed")]
    NotSubscribed,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("timed out waiting for the transport")]
    Timeout,
    #[error("outbound queue full")]
    Backpressure,
    #[error("connection error: {0}")]
    Connection(String),
}

/// Transport-assigned subscription handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Key this subscriber's tracked meta is filed under in presence syncs.
    pub presence_key: String,
    /// Deliver this subscriber's own broadcasts back to it.
    pub receive_own: bool,
}

impl SubscribeOptions {
    pub fn new(presence_key: impl Into<String>) -> Self {
        Self {
            presence_key: presence_key.into(),
            receive_own: false,
        }
    }

    pub fn with_receive_own(mut self, receive_own: bool) -> Self {
        self.receive_own = receive_own;
        self
    }
}

/// Event delivered to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Broadcast { event: String, payload: Value },
    /// Full membership of the topic
    PresenceSync(PresenceSnapshot),
}

/// A live subscription. Dropping `events` does not unsubscribe; call
/// [`PubSub::unsubscribe`].
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub topic: String,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// External pub/sub contract.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Join `topic`. Resolves once the transport has acknowledged.
    async fn subscribe(
        &self,
        topic: &str,
        options: SubscribeOptions,
    ) -> Result<Subscription, TransportError>;

    /// Fire-and-forget broadcast to the topic's other subscribers.
    fn broadcast(&self, id: SubscriptionId, event: &str, payload: Value)
        -> Result<(), TransportError>;

    /// Publish (or replace) this subscriber's membership descriptor.
    async fn track(&self, id: SubscriptionId, meta: Value) -> Result<(), TransportError>;

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError>;
}
