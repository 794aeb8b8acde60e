//! WebSocket transport implementation.
//!
//! Adapts an upgraded axum [`WebSocket`] into the reader/writer halves the
//! connection pumps drive.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, warn};

use crate::traits::{FrameReader, FrameWriter, TransportError, WireMessage};

/// Split an upgraded socket into pump halves.
///
/// Frames larger than `max_message_size` are rejected by the reader.
#[must_use]
pub fn split_websocket(
    socket: WebSocket,
    max_message_size: usize,
) -> (WebSocketReader, WebSocketWriter) {
    let (sink, stream) = socket.split();
    (
        WebSocketReader {
            stream,
            max_message_size,
        },
        WebSocketWriter { sink, closed: false },
    )
}

/// Receiving half of a WebSocket connection.
pub struct WebSocketReader {
    stream: SplitStream<WebSocket>,
    max_message_size: usize,
}

impl WebSocketReader {
    fn check_size(&self, size: usize) -> Result<(), TransportError> {
        if size > self.max_message_size {
            warn!(
                "Message too large: {} bytes (max: {})",
                size, self.max_message_size
            );
            return Err(TransportError::FrameTooLarge {
                size,
                limit: self.max_message_size,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl FrameReader for WebSocketReader {
    async fn recv(&mut self) -> Result<Option<WireMessage>, TransportError> {
        match self.stream.next().await {
            Some(Ok(Message::Text(text))) => {
                self.check_size(text.len())?;
                Ok(Some(WireMessage::Text(Bytes::from(text))))
            }
            Some(Ok(Message::Binary(data))) => {
                self.check_size(data.len())?;
                Ok(Some(WireMessage::Binary(Bytes::from(data))))
            }
            Some(Ok(Message::Ping(data))) => Ok(Some(WireMessage::Ping(Bytes::from(data)))),
            Some(Ok(Message::Pong(data))) => Ok(Some(WireMessage::Pong(Bytes::from(data)))),
            Some(Ok(Message::Close(frame))) => {
                debug!(?frame, "Received close frame");
                Ok(None)
            }
            Some(Err(e)) => Err(TransportError::ReceiveFailed(e.to_string())),
            None => {
                debug!("WebSocket stream ended");
                Ok(None)
            }
        }
    }
}

/// Sending half of a WebSocket connection.
pub struct WebSocketWriter {
    sink: SplitSink<WebSocket, Message>,
    closed: bool,
}

#[async_trait]
impl FrameWriter for WebSocketWriter {
    async fn send(&mut self, message: WireMessage) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }

        let message = match message {
            WireMessage::Text(data) => {
                let text = String::from_utf8(data.to_vec())
                    .map_err(|e| TransportError::SendFailed(e.to_string()))?;
                Message::Text(text)
            }
            WireMessage::Binary(data) => Message::Binary(data.to_vec()),
            WireMessage::Ping(data) => Message::Ping(data.to_vec()),
            WireMessage::Pong(data) => Message::Pong(data.to_vec()),
            WireMessage::Close => Message::Close(None),
        };

        self.sink
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(()); // Already closed
        }

        self.sink
            .close()
            .await
            .map_err(|e| TransportError::SendFailed(format!("Failed to close: {}", e)))
    }
}
