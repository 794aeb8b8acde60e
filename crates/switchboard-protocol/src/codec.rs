//! JSON codec for Switchboard frames.
//!
//! Client frames, relay frames and durability events are all JSON. The codec
//! enforces a size ceiling on both directions so a single oversized payload
//! cannot pin memory on a gateway node.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::envelope::InboundEnvelope;

/// Maximum encoded frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Errors that can occur while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// The frame is not valid JSON or does not match the expected shape.
    #[error("Malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    /// The envelope tag is known but its payload does not match.
    #[error("Malformed {kind} payload: {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Encode a value as a JSON frame.
///
/// # Errors
///
/// Returns an error if serialization fails or the frame is too large.
pub fn encode<T: Serialize>(value: &T) -> Result<Bytes, ProtocolError> {
    let data = serde_json::to_vec(value)?;

    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(data.len()));
    }

    Ok(Bytes::from(data))
}

/// Decode a JSON frame.
///
/// # Errors
///
/// Returns an error if the frame is too large or malformed.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(data.len()));
    }

    Ok(serde_json::from_slice(data)?)
}

/// Decode the outer `{"type", "data"}` wrapper of a client frame.
///
/// # Errors
///
/// Returns an error if the frame is too large or is not an envelope.
pub fn decode_envelope(data: &[u8]) -> Result<InboundEnvelope, ProtocolError> {
    decode(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::OutboundEnvelope;

    #[test]
    fn test_decode_envelope() {
        let env = decode_envelope(br#"{"type":"typing","data":{"is_typing":false}}"#).unwrap();
        assert_eq!(env.kind, "typing");
        assert_eq!(env.data["is_typing"], false);
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(
            decode_envelope(b"not json at all"),
            Err(ProtocolError::Json(_))
        ));
        // Valid JSON, but no type tag
        assert!(matches!(
            decode_envelope(br#"{"data":{}}"#),
            Err(ProtocolError::Json(_))
        ));
    }

    #[test]
    fn test_frame_too_large() {
        let env = OutboundEnvelope::broadcast("x".repeat(MAX_FRAME_SIZE + 1));
        match encode(&env) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }

        let big = vec![b' '; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            decode_envelope(&big),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }
}
