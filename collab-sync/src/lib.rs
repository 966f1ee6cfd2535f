//! # collab-sync: realtime CRDT document sync over topic pub/sub
//!
//! Replicates a Yrs document and per-user awareness state between replicas
//! that share a pub/sub topic. There is no authoritative server: every
//! replica broadcasts its own deltas and applies everyone else's, and the
//! CRDT makes the order irrelevant.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   document-update    ┌──────────────┐
//! │ SyncProvider │ ◄──────────────────► │ SyncProvider │
//! │  Yrs Doc     │   awareness-update   │  Yrs Doc     │
//! │  Awareness   │   presence sync      │  Awareness   │
//! └──────┬───────┘                      └──────┬───────┘
//!        │ ChannelAdapter                      │
//!        ▼                                     ▼
//! ┌─────────────────────────────────────────────────────┐
//! │ dyn PubSub: MemoryPubSub (in-process) or WsPubSub   │
//! │             ──► RelayServer (WebSocket)             │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`encoding`]: base64 text encoding for binary update deltas
//! - [`batcher`]: coalesces local deltas into one merged broadcast
//! - [`presence`]: awareness store, user-list keys, collaborator views
//! - [`protocol`]: event kinds and validated wire payloads
//! - [`transport`]: pub/sub contract, channel adapter, memory and WebSocket transports
//! - [`provider`]: the orchestrator
//! - [`relay`]: WebSocket relay server
//! - [`scheduler`]: explicit debounce timers owned by the provider
//! - [`identity`]: injectable participant id / color generation

pub mod batcher;
pub mod encoding;
pub mod error;
pub mod identity;
pub mod presence;
pub mod protocol;
pub mod provider;
pub mod relay;
pub mod scheduler;
pub mod transport;

// Re-exports for convenience
pub use batcher::{UpdateBatcher, DEFAULT_FLUSH_WINDOW};
pub use encoding::{decode_update, encode_update, EncodingError};
pub use error::{Result, SyncError};
pub use identity::{FixedIdentity, GeneratedIdentity, IdentityGenerator, RandomIdentity, PALETTE};
pub use presence::{
    collaborators, user_on_block, users_in_section, AwarenessChange, AwarenessStore,
    ChangeOrigin, ClientId, CursorPosition, CursorThrottle, IdentityKey, NotificationGate,
    PresenceState, RemoteUser, TextSelection, UserListKey,
};
pub use protocol::{EventKind, InboundMessage, MemberDescriptor, OutboundMessage, ProtocolError};
pub use provider::{
    ConnectionState, ProviderConfig, ProviderEvent, ProviderOptions, SyncProvider, REMOTE_ORIGIN,
};
pub use relay::{RelayConfig, RelayServer, RelayStats};
pub use scheduler::{Scheduler, TimerKind};
pub use transport::{
    ChannelAdapter, MemoryPubSub, MemoryPubSubConfig, PubSub, SubscribeOptions, Subscription,
    SubscriptionId, TransportError, TransportEvent, WsPubSub, WsPubSubConfig,
};
