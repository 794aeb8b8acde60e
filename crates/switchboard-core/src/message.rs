//! Internal message types for Switchboard.

use bytes::Bytes;
use switchboard_protocol::{unix_now, UserId};

/// A raw client frame on its way from a read pump to the router.
///
/// The read pump does not interpret the payload; it only tags it with the
/// authenticated identity of the connection it came from.
#[derive(Debug, Clone)]
pub struct UserMessage {
    /// Authenticated sender.
    pub user_id: UserId,
    /// Undecoded envelope bytes.
    pub payload: Bytes,
    /// When the frame was read, in unix seconds.
    pub received_at: i64,
}

impl UserMessage {
    /// Create a message received now.
    #[must_use]
    pub fn new(user_id: UserId, payload: impl Into<Bytes>) -> Self {
        Self {
            user_id,
            payload: payload.into(),
            received_at: unix_now(),
        }
    }

    /// Get the payload size in bytes.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }
}
