//! Cross-node pub/sub.
//!
//! Nodes exchange relay frames over named channels: one per node
//! (`gateway_node:<node>`) plus the shared `group_broadcast` channel.
//! Delivery is at-most-once; a frame published while nobody listens is lost.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{trace, warn};

/// Default per-channel buffer of the in-memory bus.
const DEFAULT_BUS_CAPACITY: usize = 1024;

/// Cross-node transport errors.
#[derive(Debug, Error)]
pub enum BusError {
    /// The transport has shut down.
    #[error("Bus closed")]
    Closed,

    /// The backing broker failed.
    #[error("Bus backend error: {0}")]
    Backend(String),
}

/// A live subscription to one channel.
///
/// Payloads arrive in publish order. Dropping the subscription stops the
/// task that feeds it.
pub struct Subscription {
    channel: String,
    rx: mpsc::UnboundedReceiver<Bytes>,
    forwarder: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Wrap a receiver fed by `forwarder`.
    #[must_use]
    pub fn new(
        channel: impl Into<String>,
        rx: mpsc::UnboundedReceiver<Bytes>,
        forwarder: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            channel: channel.into(),
            rx,
            forwarder,
        }
    }

    /// Get the channel name.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wait for the next payload.
    ///
    /// Returns `None` once the transport closed the channel.
    pub async fn next(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(handle) = self.forwarder.take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

/// Pub/sub between gateway nodes.
#[async_trait]
pub trait CrossNodeTransport: Send + Sync {
    /// Publish `payload` on `channel`.
    ///
    /// Returns the number of subscribers that received it, when known.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize, BusError>;

    /// Subscribe to `channel`.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, BusError>;
}

/// In-process bus shared by hubs running in one process.
#[derive(Debug)]
pub struct MemoryBus {
    channels: DashMap<String, broadcast::Sender<Bytes>>,
    capacity: usize,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    /// Create a bus with the default per-channel buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    /// Create a bus with a specific per-channel buffer.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Get the number of subscribers on `channel`.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Bytes> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

#[async_trait]
impl CrossNodeTransport for MemoryBus {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize, BusError> {
        trace!(channel = %channel, size = payload.len(), "Bus publish");
        let delivered = match self.channels.get(channel) {
            Some(tx) => tx.send(payload).unwrap_or_default(),
            None => 0,
        };
        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BusError> {
        let mut rx = self.sender(channel).subscribe();
        let (tx, out) = mpsc::unbounded_channel();
        let name = channel.to_string();

        // Forward from broadcast to mpsc so slow listeners see lag, not loss of
        // the whole channel
        let forwarder = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).is_err() {
                            break; // Subscription dropped
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(channel = %name, skipped, "Bus subscriber lagged");
                        continue;
                    }
                }
            }
        });

        Ok(Subscription::new(channel, out, Some(forwarder)))
    }
}
