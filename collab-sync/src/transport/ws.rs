//! WebSocket client for a [`RelayServer`](crate::relay::RelayServer).
//!
//! One socket multiplexes every subscription this process holds:
//!
//! ```text
//! subscribe() ── Join{ref_id} ──►            relay
//!             ◄── Joined{ref_id, subscription}
//! broadcast() ── Broadcast{subscription} ──►
//!             ◄── Event{subscription} / Presence{subscription}
//! ```
//!
//! A writer task drains a bounded outbound queue into the socket; a reader
//! task routes inbound frames to per-subscription streams. When the socket
//! closes every stream ends, which providers observe as a disconnect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use super::{PubSub, SubscribeOptions, Subscription, SubscriptionId, TransportError, TransportEvent};
use crate::protocol::RelayFrame;

#[derive(Debug, Clone)]
pub struct WsPubSubConfig {
    /// How long `subscribe` waits for the relay's `joined` reply.
    pub join_timeout: Duration,
    /// Frames queued for the writer before `broadcast` reports backpressure.
    pub outbound_capacity: usize,
}

impl Default for WsPubSubConfig {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_secs(5),
            outbound_capacity: 1024,
        }
    }
}

impl WsPubSubConfig {
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }
}

type Route = mpsc::UnboundedSender<TransportEvent>;

struct PendingJoin {
    reply: oneshot::Sender<Result<SubscriptionId, TransportError>>,
    events: Route,
}

#[derive(Default)]
struct Shared {
    pending_joins: Mutex<HashMap<u64, PendingJoin>>,
    routes: Mutex<HashMap<SubscriptionId, Route>>,
    closed: AtomicBool,
    next_ref: AtomicU64,
}

impl Shared {
    /// Route one inbound frame. Returns a frame to send back to the relay,
    /// if any.
    fn handle_frame(&self, frame: RelayFrame) -> Option<RelayFrame> {
        match frame {
            RelayFrame::Joined { ref_id, subscription } => {
                let Some(pending) = self.pending_joins.lock().remove(&ref_id) else {
                    // The join timed out on our side; release it on the relay.
                    log::warn!(
                        "Join reply for unknown ref {}, leaving subscription {}",
                        ref_id,
                        subscription
                    );
                    return Some(RelayFrame::Leave { subscription });
                };
                let id = SubscriptionId(subscription);
                // Route first so nothing sent right after the reply is lost.
                self.routes.lock().insert(id, pending.events);
                if pending.reply.send(Ok(id)).is_err() {
                    // Subscriber gave up between the timeout and this reply.
                    self.routes.lock().remove(&id);
                    return Some(RelayFrame::Leave { subscription });
                }
            }
            RelayFrame::Rejected { ref_id, reason } => {
                if let Some(pending) = self.pending_joins.lock().remove(&ref_id) {
                    let _ = pending.reply.send(Err(TransportError::SubscriptionRejected(reason)));
                }
            }
            RelayFrame::Event {
                subscription,
                event,
                payload,
            } => self.route(
                SubscriptionId(subscription),
                TransportEvent::Broadcast { event, payload },
            ),
            RelayFrame::Presence { subscription, state } => {
                self.route(SubscriptionId(subscription), TransportEvent::PresenceSync(state))
            }
            other => log::warn!("Unexpected frame from relay: {:?}", other),
        }
        None
    }

    fn route(&self, id: SubscriptionId, event: TransportEvent) {
        let routes = self.routes.lock();
        match routes.get(&id) {
            Some(tx) => {
                let _ = tx.send(event);
            }
            None => log::debug!("Dropping event for unknown subscription {}", id),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the senders ends every subscription stream.
        self.routes.lock().clear();
        for (_, pending) in self.pending_joins.lock().drain() {
            let _ = pending.reply.send(Err(TransportError::ConnectionClosed));
        }
    }
}

/// [`PubSub`] over a relay WebSocket connection.
pub struct WsPubSub {
    config: WsPubSubConfig,
    outgoing: mpsc::Sender<Vec<u8>>,
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
}

impl WsPubSub {
    /// Connect to a relay at `url` (e.g. `ws://127.0.0.1:9091`).
    pub async fn connect(url: &str, config: WsPubSubConfig) -> Result<Self, TransportError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        log::info!("Connected to relay at {}", url);

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(config.outbound_capacity.max(1));
        let shared = Arc::new(Shared::default());

        // Writer task: forward outgoing queue to the socket
        let writer_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if let Err(e) = ws_writer.send(Message::Binary(data.into())).await {
                    log::error!("Relay send failed: {}", e);
                    break;
                }
            }
            let _ = ws_writer.close().await;
            writer_shared.close();
        });

        // Reader task: route inbound frames
        let reader_shared = Arc::clone(&shared);
        let replies = out_tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match RelayFrame::decode(&data) {
                        Ok(frame) => {
                            let Some(reply) = reader_shared.handle_frame(frame) else {
                                continue;
                            };
                            match reply.encode() {
                                Ok(bytes) => {
                                    if let Err(e) = replies.try_send(bytes) {
                                        log::warn!("Dropping reply to relay: {}", e);
                                    }
                                }
                                Err(e) => log::error!("Failed to encode reply: {}", e),
                            }
                        }
                        Err(e) => log::warn!("Discarding relay frame: {}", e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("Relay connection error: {}", e);
                        break;
                    }
                }
            }
            log::info!("Relay connection closed");
            reader_shared.close();
        });

        Ok(Self {
            config,
            outgoing: out_tx,
            shared,
            reader,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Number of live subscriptions on this socket.
    pub fn subscription_count(&self) -> usize {
        self.shared.routes.lock().len()
    }

    async fn send_frame(&self, frame: &RelayFrame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        let bytes = frame
            .encode()
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        self.outgoing
            .send(bytes)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

impl Drop for WsPubSub {
    fn drop(&mut self) {
        self.reader.abort();
        self.shared.close();
    }
}

#[async_trait]
impl PubSub for WsPubSub {
    async fn subscribe(
        &self,
        topic: &str,
        options: SubscribeOptions,
    ) -> Result<Subscription, TransportError> {
        let ref_id = self.shared.next_ref.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        self.shared.pending_joins.lock().insert(
            ref_id,
            PendingJoin {
                reply: reply_tx,
                events: events_tx,
            },
        );

        let join = RelayFrame::Join {
            ref_id,
            topic: topic.to_string(),
            key: options.presence_key,
            receive_own: options.receive_own,
        };
        if let Err(e) = self.send_frame(&join).await {
            self.shared.pending_joins.lock().remove(&ref_id);
            return Err(e);
        }

        let id = match tokio::time::timeout(self.config.join_timeout, reply_rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(TransportError::ConnectionClosed),
            Err(_) => {
                self.shared.pending_joins.lock().remove(&ref_id);
                return Err(TransportError::Timeout);
            }
        };

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
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        if !self.shared.routes.lock().contains_key(&id) {
            return Err(TransportError::NotSubscribed);
        }

        let frame = RelayFrame::Broadcast {
            subscription: id.0,
            event: event.to_string(),
            payload,
        };
        let bytes = frame
            .encode()
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        self.outgoing.try_send(bytes).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => TransportError::ConnectionClosed,
        })
    }

    async fn track(&self, id: SubscriptionId, meta: Value) -> Result<(), TransportError> {
        if !self.shared.routes.lock().contains_key(&id) {
            return Err(TransportError::NotSubscribed);
        }
        self.send_frame(&RelayFrame::Track {
            subscription: id.0,
            meta,
        })
        .await
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError> {
        if self.shared.routes.lock().remove(&id).is_none() {
            return Err(TransportError::NotSubscribed);
        }
        self.send_frame(&RelayFrame::Leave { subscription: id.0 }).await
    }
}
