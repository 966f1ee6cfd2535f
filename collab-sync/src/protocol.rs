//! Wire protocol for topic-scoped CRDT and presence replication.
//!
//! Payloads are JSON objects carried by the pub/sub transport under a named
//! event kind:
//!
//! ```text
//! event              payload
//! ─────────────────  ─────────────────────────────────────────────
//! document-update    { update: <base64 delta>, sender: <clientId> }
//! awareness-update   { state: <PresenceState>, clientId: <clientId> }
//! sync-request       { stateVector: <base64>, sender: <clientId> }
//! sync-response      { update: <base64 diff>, sender, target }
//! (presence sync)    { <presenceKey>: [ <MemberDescriptor>, … ] }
//! ```
//!
//! Inbound payloads are untrusted: every one is parsed into an
//! [`InboundMessage`] variant and shape-checked before the provider sees it.
//! Anything that fails is reported as a [`ProtocolError`].
//!
//! The relay transport additionally frames the pub/sub operations
//! themselves as [`RelayFrame`]s.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::presence::{ClientId, PresenceState};

/// Presence key → tracked metas, as delivered by a presence-sync event.
pub type PresenceSnapshot = HashMap<String, Vec<Value>>;

/// Broadcast event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// Merged CRDT delta
    #[serde(rename = "document-update")]
    DocumentUpdate,
    /// Full local presence state
    #[serde(rename = "awareness-update")]
    AwarenessUpdate,
    /// State vector announcing what a replica already has
    #[serde(rename = "sync-request")]
    SyncRequest,
    /// Diff answering a sync request
    #[serde(rename = "sync-response")]
    SyncResponse,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::DocumentUpdate,
        EventKind::AwarenessUpdate,
        EventKind::SyncRequest,
        EventKind::SyncResponse,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::DocumentUpdate => "document-update",
            EventKind::AwarenessUpdate => "awareness-update",
            EventKind::SyncRequest => "sync-request",
            EventKind::SyncResponse => "sync-response",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ───────────────────────────────────────────────────────────────────
// Payloads
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentUpdateMessage {
    /// Base64-encoded Yrs v1 update
    pub update: String,
    pub sender: ClientId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessUpdateMessage {
    pub state: PresenceState,
    #[serde(rename = "clientId")]
    pub client_id: ClientId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequestMessage {
    /// Base64-encoded Yrs v1 state vector
    #[serde(rename = "stateVector")]
    pub state_vector: String,
    pub sender: ClientId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponseMessage {
    /// Base64-encoded Yrs v1 diff
    pub update: String,
    pub sender: ClientId,
    /// Client that asked for the diff
    pub target: ClientId,
}

fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Membership descriptor a replica tracks on the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberDescriptor {
    /// Participant (user) id
    pub id: String,
    /// Session id; falls back to the presence key when absent
    #[serde(default)]
    pub client_id: ClientId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default = "now")]
    pub online_at: DateTime<Utc>,
}

impl MemberDescriptor {
    /// Descriptor for the local participant, stamped now.
    pub fn for_state(client_id: &str, state: &PresenceState) -> Self {
        Self {
            id: state.participant_id.clone(),
            client_id: client_id.to_string(),
            name: state.display_name.clone(),
            color: state.color.clone(),
            avatar_url: state.avatar_url.clone(),
            online_at: Utc::now(),
        }
    }

    /// Parse one tracked meta from a presence snapshot.
    pub fn from_meta(presence_key: &str, meta: Value) -> Result<Self, ProtocolError> {
        let mut member: MemberDescriptor =
            serde_json::from_value(meta).map_err(|e| ProtocolError::InvalidPayload {
                event: "presence",
                reason: e.to_string(),
            })?;
        if member.client_id.is_empty() {
            member.client_id = presence_key.to_string();
        }
        if member.client_id.is_empty() {
            return Err(ProtocolError::InvalidPayload {
                event: "presence",
                reason: "missing client id".into(),
            });
        }
        Ok(member)
    }
}

// ───────────────────────────────────────────────────────────────────
// Inbound / outbound variants
// ───────────────────────────────────────────────────────────────────

/// A validated inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    DocumentUpdate(DocumentUpdateMessage),
    AwarenessUpdate(AwarenessUpdateMessage),
    SyncRequest(SyncRequestMessage),
    SyncResponse(SyncResponseMessage),
    /// Current channel membership (already parsed; invalid metas dropped)
    PresenceSync(Vec<MemberDescriptor>),
}

fn parse_payload<T: serde::de::DeserializeOwned>(
    kind: EventKind,
    payload: Value,
) -> Result<T, ProtocolError> {
    serde_json::from_value(payload).map_err(|e| ProtocolError::InvalidPayload {
        event: kind.as_str(),
        reason: e.to_string(),
    })
}

fn require(kind: EventKind, field: &'static str, value: &str) -> Result<(), ProtocolError> {
    if value.is_empty() {
        return Err(ProtocolError::InvalidPayload {
            event: kind.as_str(),
            reason: format!("empty {field}"),
        });
    }
    Ok(())
}

impl InboundMessage {
    /// Parse and shape-check a broadcast event.
    pub fn from_broadcast(event: &str, payload: Value) -> Result<Self, ProtocolError> {
        let kind =
            EventKind::parse(event).ok_or_else(|| ProtocolError::UnknownEvent(event.to_string()))?;

        match kind {
            EventKind::DocumentUpdate => {
                let msg: DocumentUpdateMessage = parse_payload(kind, payload)?;
                require(kind, "sender", &msg.sender)?;
                require(kind, "update", &msg.update)?;
                Ok(InboundMessage::DocumentUpdate(msg))
            }
            EventKind::AwarenessUpdate => {
                let mut msg: AwarenessUpdateMessage = parse_payload(kind, payload)?;
                require(kind, "clientId", &msg.client_id)?;
                if msg.state.participant_id.is_empty() {
                    msg.state.participant_id = msg.client_id.clone();
                }
                Ok(InboundMessage::AwarenessUpdate(msg))
            }
            EventKind::SyncRequest => {
                let msg: SyncRequestMessage = parse_payload(kind, payload)?;
                require(kind, "sender", &msg.sender)?;
                Ok(InboundMessage::SyncRequest(msg))
            }
            EventKind::SyncResponse => {
                let msg: SyncResponseMessage = parse_payload(kind, payload)?;
                require(kind, "sender", &msg.sender)?;
                require(kind, "target", &msg.target)?;
                require(kind, "update", &msg.update)?;
                Ok(InboundMessage::SyncResponse(msg))
            }
        }
    }

    /// Parse a presence snapshot. Metas that fail the shape check are
    /// returned separately so the caller can log them.
    pub fn from_presence(snapshot: PresenceSnapshot) -> (Self, Vec<ProtocolError>) {
        let mut members = Vec::new();
        let mut rejected = Vec::new();

        for (key, metas) in snapshot {
            for meta in metas {
                match MemberDescriptor::from_meta(&key, meta) {
                    Ok(member) => members.push(member),
                    Err(e) => rejected.push(e),
                }
            }
        }
        members.sort_by(|a, b| a.client_id.cmp(&b.client_id));

        (InboundMessage::PresenceSync(members), rejected)
    }
}

/// An outbound broadcast.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    DocumentUpdate(DocumentUpdateMessage),
    AwarenessUpdate(AwarenessUpdateMessage),
    SyncRequest(SyncRequestMessage),
    SyncResponse(SyncResponseMessage),
}

impl OutboundMessage {
    pub fn kind(&self) -> EventKind {
        match self {
            OutboundMessage::DocumentUpdate(_) => EventKind::DocumentUpdate,
            OutboundMessage::AwarenessUpdate(_) => EventKind::AwarenessUpdate,
            OutboundMessage::SyncRequest(_) => EventKind::SyncRequest,
            OutboundMessage::SyncResponse(_) => EventKind::SyncResponse,
        }
    }

    pub fn to_payload(&self) -> Result<Value, ProtocolError> {
        let value = match self {
            OutboundMessage::DocumentUpdate(m) => serde_json::to_value(m),
            OutboundMessage::AwarenessUpdate(m) => serde_json::to_value(m),
            OutboundMessage::SyncRequest(m) => serde_json::to_value(m),
            OutboundMessage::SyncResponse(m) => serde_json::to_value(m),
        };
        value.map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

// ───────────────────────────────────────────────────────────────────
// Relay framing
// ───────────────────────────────────────────────────────────────────

/// Frames exchanged between a [`WsPubSub`](crate::transport::ws::WsPubSub)
/// client and a [`RelayServer`](crate::relay::RelayServer).
///
/// One socket multiplexes any number of subscriptions; `ref_id` pairs a
/// `join` with its `joined`/`rejected` reply, after which the server-assigned
/// `subscription` id addresses everything else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayFrame {
    // client → server
    Join {
        ref_id: u64,
        topic: String,
        key: String,
        receive_own: bool,
    },
    Leave {
        subscription: u64,
    },
    Broadcast {
        subscription: u64,
        event: String,
        payload: Value,
    },
    Track {
        subscription: u64,
        meta: Value,
    },

    // server → client
    Joined {
        ref_id: u64,
        subscription: u64,
    },
    Rejected {
        ref_id: u64,
        reason: String,
    },
    Event {
        subscription: u64,
        event: String,
        payload: Value,
    },
    Presence {
        subscription: u64,
        state: PresenceSnapshot,
    },
}

impl RelayFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown event kind: {0}")]
    UnknownEvent(String),
    #[error("invalid {event} payload: {reason}")]
    InvalidPayload { event: &'static str, reason: String },
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
}
