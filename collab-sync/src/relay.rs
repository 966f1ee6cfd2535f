//! WebSocket relay exposing an in-process pub/sub hub to remote replicas.
//!
//! Architecture:
//! ```text
//! WsPubSub A ──┐                          ┌── forwarder(sub 1) ──┐
//!              ├── connection task ───────┤                      ├──► socket A
//! WsPubSub B ──┘   (select! loop)         └── forwarder(sub 2) ──┘
//!                        │
//!                        ▼
//!                  MemoryPubSub hub ── topic "doc:1" ── broadcast channel
//!                                  └── topic "doc:2" ── broadcast channel
//! ```
//!
//! The relay holds no document state. It only routes `RelayFrame`s between
//! sockets and the hub, so every CRDT guarantee stays end-to-end between
//! providers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::RelayFrame;
use crate::transport::{
    MemoryPubSub, MemoryPubSubConfig, PubSub, SubscribeOptions, SubscriptionId, TransportEvent,
};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per topic
    pub topic_capacity: usize,
    /// Subscriptions one socket may hold
    pub max_subscriptions_per_connection: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9091".to_string(),
            topic_capacity: 256,
            max_subscriptions_per_connection: 64,
        }
    }
}

impl RelayConfig {
    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    pub fn with_topic_capacity(mut self, capacity: usize) -> Self {
        self.topic_capacity = capacity;
        self
    }

    pub fn with_max_subscriptions_per_connection(mut self, max: usize) -> Self {
        self.max_subscriptions_per_connection = max;
        self
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub rejected_frames: u64,
}

#[derive(Default)]
struct AtomicRelayStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_frames: AtomicU64,
    total_bytes: AtomicU64,
    rejected_frames: AtomicU64,
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    hub: Arc<MemoryPubSub>,
    stats: Arc<AtomicRelayStats>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let hub = MemoryPubSub::with_config(
            MemoryPubSubConfig::default().with_capacity(config.topic_capacity),
        );
        Self {
            config,
            hub: Arc::new(hub),
            stats: Arc::new(AtomicRelayStats::default()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// The hub behind the relay (topics, membership, counters).
    pub fn hub(&self) -> &Arc<MemoryPubSub> {
        &self.hub
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            total_frames: self.stats.total_frames.load(Ordering::Relaxed),
            total_bytes: self.stats.total_bytes.load(Ordering::Relaxed),
            rejected_frames: self.stats.rejected_frames.load(Ordering::Relaxed),
        }
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = Arc::clone(&self.hub);
            let stats = Arc::clone(&self.stats);
            let max_subs = self.config.max_subscriptions_per_connection;

            tokio::spawn(async move {
                stats.total_connections.fetch_add(1, Ordering::Relaxed);
                stats.active_connections.fetch_add(1, Ordering::Relaxed);

                if let Err(e) = handle_connection(stream, addr, &hub, &stats, max_subs).await {
                    log::error!("Connection error from {addr}: {e}");
                }

                stats.active_connections.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }
}

struct HeldSubscription {
    id: SubscriptionId,
    forwarder: JoinHandle<()>,
}

fn spawn_forwarder(
    id: SubscriptionId,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    frames: mpsc::UnboundedSender<RelayFrame>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let frame = match event {
                TransportEvent::Broadcast { event, payload } => RelayFrame::Event {
                    subscription: id.0,
                    event,
                    payload,
                },
                TransportEvent::PresenceSync(state) => RelayFrame::Presence {
                    subscription: id.0,
                    state,
                },
            };
            if frames.send(frame).is_err() {
                break;
            }
        }
    })
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: &Arc<MemoryPubSub>,
    stats: &AtomicRelayStats,
    max_subscriptions: usize,
) -> Result<(), BoxError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::info!("WebSocket connection established from {addr}");

    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<RelayFrame>();
    let mut held: HashMap<u64, HeldSubscription> = HashMap::new();

    let result = async {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            stats.total_frames.fetch_add(1, Ordering::Relaxed);
                            stats.total_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);

                            let frame = match RelayFrame::decode(&data) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    log::warn!("Failed to decode frame from {addr}: {e}");
                                    stats.rejected_frames.fetch_add(1, Ordering::Relaxed);
                                    continue;
                                }
                            };

                            if let Some(reply) = handle_frame(
                                frame, hub, &mut held, &frame_tx, max_subscriptions, addr,
                            ).await {
                                ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                frame = frame_rx.recv() => {
                    // frame_tx is held by this task, so the stream never ends here.
                    if let Some(frame) = frame {
                        ws_sender.send(Message::Binary(frame.encode()?.into())).await?;
                    }
                }
            }
        }
        Ok::<(), BoxError>(())
    }
    .await;

    // Cleanup: leave every topic this socket joined
    for (_, sub) in held.drain() {
        sub.forwarder.abort();
        let _ = hub.unsubscribe(sub.id).await;
    }
    result
}

/// Apply one client frame. Returns a direct reply, if any.
async fn handle_frame(
    frame: RelayFrame,
    hub: &Arc<MemoryPubSub>,
    held: &mut HashMap<u64, HeldSubscription>,
    frames: &mpsc::UnboundedSender<RelayFrame>,
    max_subscriptions: usize,
    addr: SocketAddr,
) -> Option<RelayFrame> {
    match frame {
        RelayFrame::Join {
            ref_id,
            topic,
            key,
            receive_own,
        } => {
            if held.len() >= max_subscriptions {
                return Some(RelayFrame::Rejected {
                    ref_id,
                    reason: format!("subscription limit ({max_subscriptions}) reached"),
                });
            }
            let options = SubscribeOptions::new(key).with_receive_own(receive_own);
            match hub.subscribe(&topic, options).await {
                Ok(sub) => {
                    let id = sub.id;
                    let forwarder = spawn_forwarder(id, sub.events, frames.clone());
                    held.insert(id.0, HeldSubscription { id, forwarder });
                    log::info!("{addr} joined {topic} as {id}");
                    Some(RelayFrame::Joined {
                        ref_id,
                        subscription: id.0,
                    })
                }
                Err(e) => Some(RelayFrame::Rejected {
                    ref_id,
                    reason: e.to_string(),
                }),
            }
        }
        RelayFrame::Leave { subscription } => {
            if let Some(sub) = held.remove(&subscription) {
                sub.forwarder.abort();
                let _ = hub.unsubscribe(sub.id).await;
                log::info!("{addr} left {}", sub.id);
            }
            None
        }
        RelayFrame::Broadcast {
            subscription,
            event,
            payload,
        } => {
            match held.get(&subscription) {
                Some(sub) => {
                    if let Err(e) = hub.broadcast(sub.id, &event, payload) {
                        log::warn!("Broadcast from {addr} failed: {e}");
                    }
                }
                None => log::warn!("{addr} broadcast on foreign subscription {subscription}"),
            }
            None
        }
        RelayFrame::Track { subscription, meta } => {
            match held.get(&subscription) {
                Some(sub) => {
                    if let Err(e) = hub.track(sub.id, meta).await {
                        log::warn!("Track from {addr} failed: {e}");
                    }
                }
                None => log::warn!("{addr} tracked on foreign subscription {subscription}"),
            }
            None
        }
        other => {
            log::warn!("Unexpected client frame from {addr}: {other:?}");
            None
        }
    }
}
