//! Participant identity generation.
//!
//! Ids and colors are produced by an injected [`IdentityGenerator`] so tests
//! can pin them instead of depending on ambient randomness.

use uuid::Uuid;

/// Cursor/avatar colors handed out to participants without one.
pub const PALETTE: [&str; 10] = [
    "#F87171", "#FB923C", "#FBBF24", "#A3E635", "#34D399",
    "#22D3EE", "#60A5FA", "#A78BFA", "#F472B6", "#FB7185",
];

/// A freshly generated identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedIdentity {
    /// Stable user identity (shared by all of a user's sessions).
    pub participant_id: String,
    /// Per-session replica identity. Used for all self-filtering.
    pub client_id: String,
    pub color: String,
}

/// Source of participant identities.
pub trait IdentityGenerator: Send + Sync {
    fn generate(&self) -> GeneratedIdentity;
}

/// Stable palette color for an id.
pub fn color_for(id: Uuid) -> &'static str {
    PALETTE[(id.as_u128() % PALETTE.len() as u128) as usize]
}

/// UUID v4 ids with a palette color derived from the participant id.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomIdentity;

impl IdentityGenerator for RandomIdentity {
    fn generate(&self) -> GeneratedIdentity {
        let participant = Uuid::new_v4();
        GeneratedIdentity {
            participant_id: participant.to_string(),
            client_id: Uuid::new_v4().to_string(),
            color: color_for(participant).to_string(),
        }
    }
}

/// Always returns the same identity.
#[derive(Debug, Clone)]
pub struct FixedIdentity(pub GeneratedIdentity);

impl FixedIdentity {
    pub fn new(
        participant_id: impl Into<String>,
        client_id: impl Into<String>,
        color: impl Into<String>,
    ) -> Self {
        Self(GeneratedIdentity {
            participant_id: participant_id.into(),
            client_id: client_id.into(),
            color: color.into(),
        })
    }
}

impl IdentityGenerator for FixedIdentity {
    fn generate(&self) -> GeneratedIdentity {
        self.0.clone()
    }
}
