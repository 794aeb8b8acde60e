//! In-memory transport.
//!
//! A duplex pipe built from two bounded channels. The server side gets a
//! [`MemoryReader`]/[`MemoryWriter`] pair that behaves like a socket; the
//! other end is a [`MemoryPeer`] that plays the client.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::traits::{FrameReader, FrameWriter, TransportError, WireMessage};

/// Create a connected server/client pair.
///
/// `buffer` bounds each direction; a peer that stops reading eventually
/// blocks the server's writer, like a stalled TCP window.
#[must_use]
pub fn pair(buffer: usize) -> (MemoryReader, MemoryWriter, MemoryPeer) {
    let (to_server, from_client) = mpsc::channel(buffer);
    let (to_client, from_server) = mpsc::channel(buffer);

    (
        MemoryReader { rx: from_client },
        MemoryWriter {
            tx: Some(to_client),
        },
        MemoryPeer {
            tx: Some(to_server),
            rx: from_server,
        },
    )
}

/// Server-side receiving half.
pub struct MemoryReader {
    rx: mpsc::Receiver<WireMessage>,
}

#[async_trait]
impl FrameReader for MemoryReader {
    async fn recv(&mut self) -> Result<Option<WireMessage>, TransportError> {
        match self.rx.recv().await {
            Some(WireMessage::Close) => Ok(None),
            Some(msg) => Ok(Some(msg)),
            // Peer vanished without a close handshake
            None => Err(TransportError::ConnectionClosed),
        }
    }
}

/// Server-side sending half.
pub struct MemoryWriter {
    tx: Option<mpsc::Sender<WireMessage>>,
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn send(&mut self, message: WireMessage) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(message)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

/// The client end of an in-memory connection.
pub struct MemoryPeer {
    tx: Option<mpsc::Sender<WireMessage>>,
    rx: mpsc::Receiver<WireMessage>,
}

impl MemoryPeer {
    /// Send a message to the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the server side has gone away.
    pub async fn send(&mut self, message: WireMessage) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(message)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Send a text frame to the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the server side has gone away.
    pub async fn send_text(&mut self, text: impl Into<Bytes>) -> Result<(), TransportError> {
        self.send(WireMessage::Text(text.into())).await
    }

    /// Receive the next message from the server.
    ///
    /// Returns `None` once the server closed its writer.
    pub async fn recv(&mut self) -> Option<WireMessage> {
        self.rx.recv().await
    }

    /// Receive without waiting.
    pub fn try_recv(&mut self) -> Option<WireMessage> {
        self.rx.try_recv().ok()
    }

    /// Drop the client's sending half without a close handshake.
    pub fn disconnect(&mut self) {
        self.tx = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_roundtrip() {
        let (mut reader, mut writer, mut peer) = pair(4);

        peer.send_text("hello").await.unwrap();
        assert_eq!(
            reader.recv().await.unwrap(),
            Some(WireMessage::text("hello"))
        );

        writer.send(WireMessage::text("world")).await.unwrap();
        assert_eq!(peer.recv().await, Some(WireMessage::text("world")));
    }

    #[tokio::test]
    async fn test_close_and_disconnect() {
        let (mut reader, mut writer, mut peer) = pair(4);

        peer.send(WireMessage::Close).await.unwrap();
        assert_eq!(reader.recv().await.unwrap(), None);

        peer.disconnect();
        assert!(matches!(
            reader.recv().await,
            Err(TransportError::ConnectionClosed)
        ));

        writer.close().await.unwrap();
        writer.close().await.unwrap();
        assert!(writer.send(WireMessage::text("late")).await.is_err());
        assert_eq!(peer.recv().await, None);
    }
}
