//! Transport abstraction traits for Switchboard.
//!
//! These traits define the interface that all transport implementations must
//! provide, allowing the connection pumps to be transport-agnostic.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// A single transport-level message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// UTF-8 application frame.
    Text(Bytes),
    /// Binary application frame.
    Binary(Bytes),
    /// Keepalive ping.
    Ping(Bytes),
    /// Keepalive answer.
    Pong(Bytes),
    /// Close handshake.
    Close,
}

impl WireMessage {
    /// Create a text frame.
    #[must_use]
    pub fn text(data: impl Into<Bytes>) -> Self {
        WireMessage::Text(data.into())
    }

    /// Payload of an application frame, if this is one.
    #[must_use]
    pub fn into_payload(self) -> Option<Bytes> {
        match self {
            WireMessage::Text(data) | WireMessage::Binary(data) => Some(data),
            _ => None,
        }
    }

    /// Size of the message payload in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            WireMessage::Text(d)
            | WireMessage::Binary(d)
            | WireMessage::Ping(d)
            | WireMessage::Pong(d) => d.len(),
            WireMessage::Close => 0,
        }
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connection timed out.
    #[error("Connection timed out")]
    Timeout,

    /// Frame exceeds the configured limit.
    #[error("Frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The receiving half of a client connection.
#[async_trait]
pub trait FrameReader: Send {
    /// Receive the next message.
    ///
    /// Returns `None` if the peer closed the connection cleanly.
    async fn recv(&mut self) -> Result<Option<WireMessage>, TransportError>;
}

/// The sending half of a client connection.
#[async_trait]
pub trait FrameWriter: Send {
    /// Send one message.
    async fn send(&mut self, message: WireMessage) -> Result<(), TransportError>;

    /// Close the transport. Closing twice is not an error.
    async fn close(&mut self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_extraction() {
        assert_eq!(
            WireMessage::text("hi").into_payload(),
            Some(Bytes::from_static(b"hi"))
        );
        assert_eq!(
            WireMessage::Binary(Bytes::from_static(b"\x01")).into_payload(),
            Some(Bytes::from_static(b"\x01"))
        );
        assert_eq!(WireMessage::Ping(Bytes::new()).into_payload(), None);
        assert_eq!(WireMessage::Close.into_payload(), None);
    }

    #[test]
    fn test_len() {
        assert_eq!(WireMessage::text("abc").len(), 3);
        assert!(WireMessage::Close.is_empty());
    }
}
