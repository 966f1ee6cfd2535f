//! Error types for the sync provider.

use crate::encoding::EncodingError;
use crate::protocol::ProtocolError;
use crate::transport::TransportError;

/// Top-level provider error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Update bytes that Yrs could not decode.
    #[error("malformed update: {0}")]
    MalformedUpdate(String),

    #[error("failed to merge pending updates: {0}")]
    Merge(String),

    #[error("failed to apply update: {0}")]
    Apply(String),

    #[error("failed to observe document: {0}")]
    Observe(String),

    /// The provider needs a running Tokio runtime to spawn its driver.
    #[error("no tokio runtime available")]
    NoRuntime,

    #[error("provider destroyed")]
    Destroyed,
}

impl From<yrs::encoding::read::Error> for SyncError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        SyncError::MalformedUpdate(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(SyncError::Destroyed.to_string(), "provider destroyed");
        assert_eq!(
            SyncError::Apply("boom".into()).to_string(),
            "failed to apply update: boom"
        );
    }

    #[test]
    fn test_from_transport_error() {
        let err: SyncError = TransportError::ConnectionClosed.into();
        assert!(matches!(err, SyncError::Transport(TransportError::ConnectionClosed)));
    }
}
