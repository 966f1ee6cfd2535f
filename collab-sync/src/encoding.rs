//! Text-safe transport encoding for binary update payloads.
//!
//! Yrs deltas are opaque bytes; pub/sub payloads are JSON. Deltas travel
//! as standard padded base64 inside the JSON envelope.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

/// Malformed encoded payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid update encoding: {0}")]
pub struct EncodingError(#[from] base64::DecodeError);

/// Encode binary update bytes for transport.
#[inline]
pub fn encode_update(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode a transport string back into update bytes.
#[inline]
pub fn decode_update(text: &str) -> Result<Vec<u8>, EncodingError> {
    Ok(STANDARD.decode(text)?)
}
