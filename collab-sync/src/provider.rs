//! Synchronization provider: binds one Yrs document and one awareness store
//! to one pub/sub topic.
//!
//! ## Architecture
//!
//! ```text
//!  SyncProvider (handle)                 driver task (owns all replication state)
//!  ─────────────────────                 ─────────────────────────────────────────
//!  doc observer ── LocalUpdate ───────┐
//!  awareness observer ── Changed ─────┤   select! {
//!  connect()/disconnect() ────────────┼──►   command    → batcher / scheduler / channel
//!  set_typing() ──────────────────────┘      transport  → validate → apply (origin "remote")
//!                                            deadline   → flush / notify / typing reset
//!  take_event_rx() ◄── Connected, Disconnected, Synced, UsersChanged
//! ```
//!
//! Every input is a message handled serially by the driver, so batching,
//! timers and the channel never need locks. Remote updates are applied in a
//! transaction tagged [`REMOTE_ORIGIN`]; the document observer skips those,
//! which is what keeps remote edits from being broadcast again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Origin, ReadTxn, StateVector, Transact, Update};

use crate::batcher::UpdateBatcher;
use crate::encoding::{decode_update, encode_update};
use crate::error::SyncError;
use crate::identity::{IdentityGenerator, RandomIdentity};
use crate::presence::{
    collaborators, AwarenessStore, ChangeOrigin, ClientId, CursorPosition, CursorThrottle,
    IdentityKey, NotificationGate, ObserverId, PresenceState, RemoteUser, TextSelection,
    UserListKey,
};
use crate::protocol::{
    AwarenessUpdateMessage, DocumentUpdateMessage, InboundMessage, MemberDescriptor,
    OutboundMessage, SyncRequestMessage, SyncResponseMessage,
};
use crate::scheduler::{Scheduler, TimerKind};
use crate::transport::{ChannelAdapter, PubSub, TransportEvent};

/// Transaction origin for updates received from the network.
pub const REMOTE_ORIGIN: &str = "remote";

// ───────────────────────────────────────────────────────────────────
// Configuration
// ───────────────────────────────────────────────────────────────────

/// Provider timing and behavior knobs.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Debounce window for outbound document updates
    pub flush_window: Duration,
    /// Debounce window for "users changed" recomputation
    pub awareness_debounce: Duration,
    /// Typing indicator auto-clear delay
    pub typing_timeout: Duration,
    /// Minimum spacing between accepted cursor updates (zero disables)
    pub cursor_throttle: Duration,
    /// Membership entries older than this are ignored
    pub membership_stale_after: Duration,
    /// Ask the transport to echo our own broadcasts
    pub receive_own_broadcasts: bool,
    /// Exchange state vectors with peers after each subscription
    pub state_exchange_on_connect: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            flush_window: Duration::from_millis(50),
            awareness_debounce: Duration::from_millis(100),
            typing_timeout: Duration::from_secs(2),
            cursor_throttle: Duration::from_millis(50),
            membership_stale_after: Duration::from_secs(60),
            receive_own_broadcasts: false,
            state_exchange_on_connect: false,
        }
    }
}

impl ProviderConfig {
    pub fn with_flush_window(mut self, window: Duration) -> Self {
        self.flush_window = window;
        self
    }

    pub fn with_awareness_debounce(mut self, debounce: Duration) -> Self {
        self.awareness_debounce = debounce;
        self
    }

    pub fn with_typing_timeout(mut self, timeout: Duration) -> Self {
        self.typing_timeout = timeout;
        self
    }

    pub fn with_cursor_throttle(mut self, throttle: Duration) -> Self {
        self.cursor_throttle = throttle;
        self
    }

    pub fn with_membership_stale_after(mut self, stale_after: Duration) -> Self {
        self.membership_stale_after = stale_after;
        self
    }

    pub fn with_receive_own_broadcasts(mut self, receive_own: bool) -> Self {
        self.receive_own_broadcasts = receive_own;
        self
    }

    pub fn with_state_exchange_on_connect(mut self, enabled: bool) -> Self {
        self.state_exchange_on_connect = enabled;
        self
    }

    /// How often a connected provider re-tracks its membership. A third of
    /// `membership_stale_after`, so a live session is refreshed at least
    /// twice before peers would consider it stale.
    pub fn presence_refresh_interval(&self) -> Duration {
        self.membership_stale_after / 3
    }
}

/// Construction options. Only `topic` and `doc` are required.
pub struct ProviderOptions {
    pub topic: String,
    pub doc: Doc,
    /// Reuse an existing store; its client id becomes the provider's.
    pub awareness: Option<Arc<AwarenessStore>>,
    pub participant_id: Option<String>,
    pub display_name: Option<String>,
    pub color: Option<String>,
    pub avatar_url: Option<String>,
    pub identity: Arc<dyn IdentityGenerator>,
    pub key: Arc<dyn UserListKey>,
    pub config: ProviderConfig,
}

impl ProviderOptions {
    pub fn new(topic: impl Into<String>, doc: Doc) -> Self {
        Self {
            topic: topic.into(),
            doc,
            awareness: None,
            participant_id: None,
            display_name: None,
            color: None,
            avatar_url: None,
            identity: Arc::new(RandomIdentity),
            key: Arc::new(IdentityKey),
            config: ProviderConfig::default(),
        }
    }

    pub fn with_awareness(mut self, store: Arc<AwarenessStore>) -> Self {
        self.awareness = Some(store);
        self
    }

    pub fn with_participant(
        mut self,
        participant_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        self.participant_id = Some(participant_id.into());
        self.display_name = Some(display_name.into());
        self
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }

    pub fn with_avatar_url(mut self, url: impl Into<String>) -> Self {
        self.avatar_url = Some(url.into());
        self
    }

    pub fn with_identity(mut self, identity: Arc<dyn IdentityGenerator>) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_key(mut self, key: Arc<dyn UserListKey>) -> Self {
        self.key = key;
        self
    }

    pub fn with_config(mut self, config: ProviderConfig) -> Self {
        self.config = config;
        self
    }
}

// ───────────────────────────────────────────────────────────────────
// Public state & events
// ───────────────────────────────────────────────────────────────────

/// Provider connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed, never connected
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Destroyed,
}

/// Events emitted by the provider.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    Connected,
    Disconnected,
    /// First successful connection (emitted once per provider)
    Synced,
    /// Remote user list changed under the comparison key
    UsersChanged(Vec<RemoteUser>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Status {
    state: ConnectionState,
    synced: bool,
}

enum Command {
    LocalUpdate(Vec<u8>),
    AwarenessChanged(ChangeOrigin),
    Typing(bool),
    Connect(oneshot::Sender<Result<(), SyncError>>),
    Disconnect(oneshot::Sender<()>),
    Destroy,
}

// ───────────────────────────────────────────────────────────────────
// Handle
// ───────────────────────────────────────────────────────────────────

/// Handle to a running provider. Dropping it tears the provider down.
pub struct SyncProvider {
    topic: String,
    client_id: ClientId,
    participant_id: String,
    doc: Doc,
    awareness: Arc<AwarenessStore>,
    owns_awareness: bool,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<Status>,
    event_rx: Option<mpsc::UnboundedReceiver<ProviderEvent>>,
    cursor_throttle: Mutex<CursorThrottle>,
    doc_subscription: Mutex<Option<yrs::Subscription>>,
    awareness_observer: ObserverId,
    destroyed: Arc<AtomicBool>,
}

impl SyncProvider {
    /// Create a provider and spawn its driver on the current Tokio runtime.
    pub fn new(options: ProviderOptions, pubsub: Arc<dyn PubSub>) -> Result<Self, SyncError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SyncError::NoRuntime)?;
        let identity = options.identity.generate();

        let (awareness, owns_awareness) = match options.awareness {
            Some(store) => (store, false),
            None => (Arc::new(AwarenessStore::new(identity.client_id.clone())), true),
        };
        let client_id = awareness.client_id().to_string();
        let participant_id = options.participant_id.unwrap_or(identity.participant_id);

        let mut local = PresenceState::new(
            participant_id.clone(),
            options.display_name.unwrap_or_else(|| "Anonymous".to_string()),
            options.color.unwrap_or(identity.color),
        );
        local.avatar_url = options.avatar_url;
        awareness.set_local_state(local);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(Status {
            state: ConnectionState::Idle,
            synced: false,
        });
        let destroyed = Arc::new(AtomicBool::new(false));

        let doc_tx = cmd_tx.clone();
        let remote = Origin::from(REMOTE_ORIGIN);
        let doc_subscription = options
            .doc
            .observe_update_v1(move |txn, event| {
                if txn.origin() == Some(&remote) {
                    return;
                }
                let _ = doc_tx.send(Command::LocalUpdate(event.update.clone()));
            })
            .map_err(|e| SyncError::Observe(format!("{e:?}")))?;

        let awareness_tx = cmd_tx.clone();
        let awareness_observer = awareness.observe(move |change| {
            let _ = awareness_tx.send(Command::AwarenessChanged(change.origin));
        });

        let config = options.config;
        let channel = ChannelAdapter::new(pubsub, options.topic.clone(), client_id.clone())
            .with_receive_own(config.receive_own_broadcasts);
        let driver = Driver {
            client_id: client_id.clone(),
            doc: options.doc.clone(),
            awareness: Arc::clone(&awareness),
            channel,
            batcher: UpdateBatcher::new(config.flush_window),
            scheduler: Scheduler::new(),
            gate: NotificationGate::new(),
            key: options.key,
            status: status_tx,
            event_tx,
            destroyed: Arc::clone(&destroyed),
            config: config.clone(),
        };
        runtime.spawn(driver.run(cmd_rx));

        log::info!("Provider {} created for topic {}", client_id, options.topic);

        Ok(Self {
            topic: options.topic,
            client_id,
            participant_id,
            doc: options.doc,
            awareness,
            owns_awareness,
            commands: cmd_tx,
            status: status_rx,
            event_rx: Some(event_rx),
            cursor_throttle: Mutex::new(CursorThrottle::new(config.cursor_throttle)),
            doc_subscription: Mutex::new(Some(doc_subscription)),
            awareness_observer,
            destroyed,
        })
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<ProviderEvent>> {
        self.event_rx.take()
    }

    /// Subscribe to the topic. Resolves once the transport acknowledged.
    /// Calling it while connected is a no-op.
    pub async fn connect(&self) -> Result<(), SyncError> {
        if self.is_destroyed() {
            return Err(SyncError::Destroyed);
        }
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect(tx))
            .map_err(|_| SyncError::Destroyed)?;
        rx.await.map_err(|_| SyncError::Destroyed)?
    }

    /// Leave the topic. Document and awareness state are kept.
    pub async fn disconnect(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Tear down: detach listeners, cancel timers, leave the topic. Safe to
    /// call more than once and before `connect`.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.doc_subscription.lock().take();
        self.awareness.unobserve(self.awareness_observer);
        if self.owns_awareness {
            self.awareness.destroy();
        } else {
            self.awareness.clear_local_state();
        }

        let _ = self.commands.send(Command::Destroy);
        log::info!("Provider {} destroyed", self.client_id);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_destroyed() {
            return ConnectionState::Destroyed;
        }
        self.status.borrow().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// True once the first connection succeeded; never reset.
    pub fn is_synced(&self) -> bool {
        self.status.borrow().synced
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn awareness(&self) -> &Arc<AwarenessStore> {
        &self.awareness
    }

    pub fn local_state(&self) -> Option<PresenceState> {
        self.awareness.local_state()
    }

    /// Remote sessions currently known.
    pub fn users(&self) -> Vec<RemoteUser> {
        self.awareness.remote_users()
    }

    /// One entry per remote participant, excluding our own other tabs.
    pub fn collaborators(&self) -> Vec<PresenceState> {
        let users = self.users();
        collaborators(&users, &self.participant_id)
            .into_iter()
            .cloned()
            .collect()
    }

    // ── Local presence helpers ─────────────────────────────────────

    /// Shallow-merge into the local presence state.
    pub fn update_local_state<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut PresenceState),
    {
        if self.is_destroyed() {
            return false;
        }
        self.awareness.update_local(f)
    }

    /// Throttled; returns `false` when the update was dropped.
    pub fn update_cursor(&self, cursor: Option<CursorPosition>) -> bool {
        if cursor.is_some() && !self.cursor_throttle.lock().allow(Instant::now()) {
            log::trace!("Cursor update throttled");
            return false;
        }
        self.update_local_state(|s| s.cursor = cursor)
    }

    pub fn update_selection(&self, selection: Option<TextSelection>) -> bool {
        self.update_local_state(|s| s.selection = selection)
    }

    pub fn update_selected_block(&self, block_id: Option<String>) -> bool {
        self.update_local_state(|s| s.selected_block_id = block_id)
    }

    pub fn update_current_section(&self, section: Option<String>, title: Option<String>) -> bool {
        self.update_local_state(|s| {
            s.current_section = section;
            s.current_section_title = title;
        })
    }

    /// Set the typing indicator. `true` auto-clears after the configured
    /// timeout unless set again.
    pub fn set_typing(&self, typing: bool) -> bool {
        if self.is_destroyed() {
            return false;
        }
        let _ = self.commands.send(Command::Typing(typing));
        self.awareness.update_local(|s| s.is_typing = typing)
    }
}

impl Drop for SyncProvider {
    fn drop(&mut self) {
        self.destroy();
    }
}

// ───────────────────────────────────────────────────────────────────
// Driver
// ───────────────────────────────────────────────────────────────────

struct Driver {
    client_id: ClientId,
    doc: Doc,
    awareness: Arc<AwarenessStore>,
    channel: ChannelAdapter,
    batcher: UpdateBatcher,
    scheduler: Scheduler,
    gate: NotificationGate,
    key: Arc<dyn UserListKey>,
    status: watch::Sender<Status>,
    event_tx: mpsc::UnboundedSender<ProviderEvent>,
    destroyed: Arc<AtomicBool>,
    config: ProviderConfig,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut events: Option<mpsc::UnboundedReceiver<TransportEvent>> = None;

        loop {
            let deadline = self.scheduler.next_deadline();

            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(Command::Destroy) | None => break,
                        Some(cmd) => self.handle_command(cmd, &mut events).await,
                    }
                }

                event = async {
                    match events.as_mut() {
                        Some(rx) => rx.recv().await,
                        // Not subscribed: wait forever
                        None => std::future::pending().await,
                    }
                } => {
                    match event {
                        Some(event) => self.handle_transport_event(event),
                        None => {
                            events = None;
                            self.connection_lost();
                        }
                    }
                }

                _ = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.fire_due_timers().await;
                }
            }
        }

        self.teardown().await;
    }

    async fn handle_command(
        &mut self,
        cmd: Command,
        events: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>,
    ) {
        match cmd {
            Command::LocalUpdate(update) => {
                if self.batcher.push(update) {
                    self.scheduler
                        .schedule_in(TimerKind::DocumentFlush, self.batcher.window());
                }
            }
            Command::AwarenessChanged(origin) => {
                if origin == ChangeOrigin::Local {
                    self.broadcast_awareness();
                }
                self.scheduler
                    .schedule_in(TimerKind::AwarenessNotify, self.config.awareness_debounce);
            }
            Command::Typing(true) => {
                self.scheduler
                    .schedule_in(TimerKind::TypingReset, self.config.typing_timeout);
            }
            Command::Typing(false) => {
                self.scheduler.cancel(TimerKind::TypingReset);
            }
            Command::Connect(reply) => {
                let result = self.connect(events).await;
                let _ = reply.send(result);
            }
            Command::Disconnect(reply) => {
                self.disconnect(events).await;
                let _ = reply.send(());
            }
            Command::Destroy => {}
        }
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    async fn connect(
        &mut self,
        events: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>,
    ) -> Result<(), SyncError> {
        if self.channel.is_subscribed() {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        let rx = match self.channel.subscribe().await {
            Ok(rx) => rx,
            Err(e) => {
                log::warn!("Subscription to {} failed: {}", self.channel.topic(), e);
                self.set_state(ConnectionState::Disconnected);
                return Err(e.into());
            }
        };
        *events = Some(rx);

        self.set_state(ConnectionState::Connected);
        self.emit(ProviderEvent::Connected);
        log::info!("Provider {} connected to {}", self.client_id, self.channel.topic());

        self.track_presence().await;
        self.broadcast_awareness();

        if self.config.state_exchange_on_connect {
            self.request_state();
        }

        if !self.status.borrow().synced {
            self.status.send_modify(|s| s.synced = true);
            self.emit(ProviderEvent::Synced);
        }
        Ok(())
    }

    async fn disconnect(&mut self, events: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>) {
        *events = None;
        let was_subscribed = self.channel.is_subscribed();
        if let Err(e) = self.channel.unsubscribe().await {
            log::warn!("Unsubscribe from {} failed: {}", self.channel.topic(), e);
        }

        self.scheduler.cancel(TimerKind::PresenceRefresh);
        if was_subscribed {
            self.set_state(ConnectionState::Disconnected);
            self.emit(ProviderEvent::Disconnected);
            log::info!("Provider {} disconnected", self.client_id);
        }
    }

    fn connection_lost(&mut self) {
        log::warn!("Connection to {} lost", self.channel.topic());
        self.channel.mark_closed();
        self.scheduler.cancel(TimerKind::PresenceRefresh);
        self.set_state(ConnectionState::Disconnected);
        self.emit(ProviderEvent::Disconnected);
    }

    async fn teardown(&mut self) {
        let cancelled = self.scheduler.cancel_all();
        self.batcher.clear();
        if let Err(e) = self.channel.unsubscribe().await {
            log::debug!("Unsubscribe during teardown failed: {}", e);
        }
        self.status.send_modify(|s| s.state = ConnectionState::Destroyed);
        log::debug!(
            "Provider {} driver stopped ({} timers cancelled)",
            self.client_id,
            cancelled
        );
    }

    // ── Timers ─────────────────────────────────────────────────────

    async fn fire_due_timers(&mut self) {
        for kind in self.scheduler.take_due(Instant::now()) {
            match kind {
                TimerKind::DocumentFlush => self.flush(),
                TimerKind::AwarenessNotify => self.notify_users(),
                TimerKind::TypingReset => {
                    // Goes out through the regular local-change path.
                    self.awareness.update_local(|s| s.is_typing = false);
                }
                TimerKind::PresenceRefresh => self.track_presence().await,
            }
        }
    }

    fn flush(&mut self) {
        if !self.channel.is_subscribed() {
            log::debug!(
                "Not connected, holding {} pending updates",
                self.batcher.len()
            );
            return;
        }

        let merged = match self.batcher.flush() {
            Ok(Some(merged)) => merged,
            Ok(None) => return,
            Err(e) => {
                log::error!("Dropping pending updates: {}", e);
                return;
            }
        };

        let message = OutboundMessage::DocumentUpdate(DocumentUpdateMessage {
            update: encode_update(&merged),
            sender: self.client_id.clone(),
        });
        match self.channel.send(&message) {
            Ok(()) => log::debug!("Flushed {} byte update to {}", merged.len(), self.channel.topic()),
            Err(e) => log::error!("Failed to send document update: {}", e),
        }
    }

    /// Publish a fresh membership descriptor and re-arm the refresh.
    async fn track_presence(&mut self) {
        if !self.channel.is_subscribed() {
            return;
        }
        if let Some(local) = self.awareness.local_state() {
            let member = MemberDescriptor::for_state(&self.client_id, &local);
            if let Err(e) = self.channel.track(&member).await {
                log::warn!("Failed to track presence: {}", e);
            }
        }

        let interval = self.config.presence_refresh_interval();
        if !interval.is_zero() {
            self.scheduler.schedule_in(TimerKind::PresenceRefresh, interval);
        }
    }

    fn notify_users(&mut self) {
        let users = self.awareness.remote_users();
        if self.gate.admit(self.key.key(&users)) {
            log::debug!("Remote users changed ({} sessions)", users.len());
            self.emit(ProviderEvent::UsersChanged(users));
        }
    }

    // ── Outbound ───────────────────────────────────────────────────

    fn broadcast_awareness(&mut self) {
        if !self.channel.is_subscribed() {
            return;
        }
        let Some(state) = self.awareness.local_state() else {
            return;
        };
        let message = OutboundMessage::AwarenessUpdate(AwarenessUpdateMessage {
            state,
            client_id: self.client_id.clone(),
        });
        if let Err(e) = self.channel.send(&message) {
            log::error!("Failed to send awareness update: {}", e);
        }
    }

    fn request_state(&mut self) {
        let state_vector = self.doc.transact().state_vector().encode_v1();
        let message = OutboundMessage::SyncRequest(SyncRequestMessage {
            state_vector: encode_update(&state_vector),
            sender: self.client_id.clone(),
        });
        if let Err(e) = self.channel.send(&message) {
            log::error!("Failed to send sync request: {}", e);
        }
    }

    // ── Inbound ────────────────────────────────────────────────────

    fn handle_transport_event(&mut self, event: TransportEvent) {
        let Some(message) = self.channel.parse(event) else {
            return;
        };

        match message {
            InboundMessage::DocumentUpdate(msg) => {
                if msg.sender == self.client_id {
                    log::debug!("Ignoring own document update");
                    return;
                }
                if let Err(e) = self.apply_encoded(&msg.update) {
                    log::warn!("Discarding update from {}: {}", msg.sender, e);
                }
            }
            InboundMessage::AwarenessUpdate(msg) => {
                if msg.client_id == self.client_id {
                    return;
                }
                log::trace!("Awareness from {}", msg.client_id);
                self.awareness.apply_remote(&msg.client_id, msg.state);
            }
            InboundMessage::PresenceSync(members) => {
                self.awareness.reconcile_members(
                    &members,
                    self.config.membership_stale_after,
                    Utc::now(),
                );
                self.scheduler
                    .schedule_in(TimerKind::AwarenessNotify, self.config.awareness_debounce);
            }
            InboundMessage::SyncRequest(msg) => {
                if msg.sender == self.client_id {
                    return;
                }
                if let Err(e) = self.answer_sync_request(&msg) {
                    log::warn!("Ignoring sync request from {}: {}", msg.sender, e);
                }
            }
            InboundMessage::SyncResponse(msg) => {
                if msg.sender == self.client_id || msg.target != self.client_id {
                    return;
                }
                if let Err(e) = self.apply_encoded(&msg.update) {
                    log::warn!("Discarding sync response from {}: {}", msg.sender, e);
                }
            }
        }
    }

    fn answer_sync_request(&mut self, msg: &SyncRequestMessage) -> Result<(), SyncError> {
        let remote_sv = StateVector::decode_v1(&decode_update(&msg.state_vector)?)?;
        let diff = self.doc.transact().encode_diff_v1(&remote_sv);

        let response = OutboundMessage::SyncResponse(SyncResponseMessage {
            update: encode_update(&diff),
            sender: self.client_id.clone(),
            target: msg.sender.clone(),
        });
        self.channel.send(&response)
    }

    /// Decode and apply a remote update with [`REMOTE_ORIGIN`].
    fn apply_encoded(&mut self, encoded: &str) -> Result<(), SyncError> {
        let bytes = decode_update(encoded)?;
        let update = Update::decode_v1(&bytes)?;
        let mut txn = self.doc.transact_mut_with(REMOTE_ORIGIN);
        txn.apply_update(update)
            .map_err(|e| SyncError::Apply(e.to_string()))
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn set_state(&mut self, state: ConnectionState) {
        self.status.send_modify(|s| s.state = state);
    }

    fn emit(&self, event: ProviderEvent) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.event_tx.send(event);
    }
}
