//! Client connections and their pumps.
//!
//! Every connection is driven by exactly two tasks:
//!
//! - the **read pump** reads frames off the transport and hands them to the
//!   hub, tagged with the connection's authenticated user
//! - the **write pump** drains the connection's outbound queue onto the
//!   transport and sends heartbeat pings
//!
//! The outbound queue is bounded. Enqueueing never waits; a full queue means
//! the client cannot keep up and the hub evicts it.

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use switchboard_protocol::UserId;
use switchboard_transport::{FrameReader, FrameWriter, TransportError, WireMessage};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::hub::Hub;
use crate::message::UserMessage;

/// Default time without any inbound frame before a connection is dropped.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default interval between heartbeat pings.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(54);

/// Default deadline for a single outbound write.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default maximum inbound frame size (64 KB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Default outbound queue capacity.
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 256;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Authenticated identity of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub username: String,
}

impl Identity {
    /// Create an identity.
    #[must_use]
    pub fn new(user_id: UserId, username: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
        }
    }
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Created, not yet registered.
    Connecting = 0,
    /// Registered with the hub.
    Established = 1,
    /// Outbound queue closed, pumps winding down.
    Draining = 2,
    /// Both pumps exited.
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Established,
            2 => ConnectionState::Draining,
            _ => ConnectionState::Closed,
        }
    }
}

/// Why an enqueue did not go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// The queue is full; the client is too slow.
    Full,
    /// The queue was already closed.
    Closed,
}

/// Receiving end of a connection's outbound queue, owned by the write pump.
pub type Outbound = mpsc::Receiver<Bytes>;

/// Handle to one client connection.
///
/// Cheap to clone; all clones refer to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    identity: Identity,
    queue: Mutex<Option<mpsc::Sender<Bytes>>>,
    state: AtomicU8,
    pumps_running: AtomicU8,
    closing: CancellationToken,
}

impl Connection {
    /// Create a connection and its outbound queue.
    #[must_use]
    pub fn new(identity: Identity, queue_capacity: usize) -> (Self, Outbound) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let connection = Self {
            inner: Arc::new(Inner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                identity,
                queue: Mutex::new(Some(tx)),
                state: AtomicU8::new(ConnectionState::Connecting as u8),
                pumps_running: AtomicU8::new(0),
                closing: CancellationToken::new(),
            }),
        };
        (connection, rx)
    }

    /// Get the process-unique connection id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Get the authenticated user.
    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.inner.identity.user_id
    }

    /// Get the full identity.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    /// Get the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Check whether the outbound queue has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner
            .queue
            .lock()
            .map(|queue| queue.is_none())
            .unwrap_or(true)
    }

    /// Token cancelled once either pump has exited.
    #[must_use]
    pub fn closing(&self) -> &CancellationToken {
        &self.inner.closing
    }

    /// Queue a frame without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`EnqueueError::Full`] if the queue is at capacity and
    /// [`EnqueueError::Closed`] if it was already closed.
    pub fn enqueue(&self, frame: Bytes) -> Result<(), EnqueueError> {
        let queue = self.inner.queue.lock().map_err(|_| EnqueueError::Closed)?;
        let Some(tx) = queue.as_ref() else {
            return Err(EnqueueError::Closed);
        };
        tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Close the outbound queue.
    ///
    /// Frames already queued are still written, then the write pump sends a
    /// close frame. Returns `true` only for the call that actually closed it.
    pub fn close(&self) -> bool {
        let closed = self
            .inner
            .queue
            .lock()
            .map(|mut queue| queue.take().is_some())
            .unwrap_or(false);
        if closed {
            self.advance(ConnectionState::Draining);
            trace!(connection = self.id(), user = %self.user_id(), "Outbound queue closed");
        }
        closed
    }

    pub(crate) fn mark_established(&self) {
        self.advance(ConnectionState::Established);
    }

    fn advance(&self, to: ConnectionState) {
        // States only move forward
        self.inner.state.fetch_max(to as u8, Ordering::AcqRel);
    }

    fn pump_started(&self) {
        self.inner.pumps_running.fetch_add(1, Ordering::AcqRel);
    }

    fn pump_exited(&self) {
        self.inner.closing.cancel();
        if self.inner.pumps_running.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.advance(ConnectionState::Closed);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("user_id", &self.inner.identity.user_id)
            .field("state", &self.state())
            .finish()
    }
}

/// Timeouts and limits of the connection pumps.
#[derive(Debug, Clone, Copy)]
pub struct PumpConfig {
    /// Drop the connection after this long without an inbound frame.
    pub idle_timeout: Duration,
    /// Ping the client this often. Must be shorter than `idle_timeout`.
    pub heartbeat_interval: Duration,
    /// Deadline for a single outbound write.
    pub write_timeout: Duration,
    /// Largest accepted inbound frame.
    pub max_message_size: usize,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Register a new connection and start both of its pumps.
pub fn spawn<R, W>(
    hub: &Arc<Hub>,
    identity: Identity,
    reader: R,
    writer: W,
    config: PumpConfig,
) -> Connection
where
    R: FrameReader + 'static,
    W: FrameWriter + 'static,
{
    let (connection, outbound) = hub.connect(identity);
    hub.register(connection.clone());

    connection.pump_started();
    connection.pump_started();
    tokio::spawn(write_pump(connection.clone(), outbound, writer, config));
    tokio::spawn(read_pump(connection.clone(), reader, Arc::clone(hub), config));

    connection
}

/// Read frames until the transport fails, closes or goes idle.
///
/// On exit the connection is always unregistered and the write pump is told
/// to stop.
pub async fn read_pump<R: FrameReader>(
    connection: Connection,
    mut reader: R,
    hub: Arc<Hub>,
    config: PumpConfig,
) {
    let user = connection.user_id();

    loop {
        let next = tokio::select! {
            biased;
            _ = connection.closing().cancelled() => break,
            next = tokio::time::timeout(config.idle_timeout, reader.recv()) => next,
        };

        match next {
            Ok(Ok(Some(message))) => match message {
                WireMessage::Text(data) | WireMessage::Binary(data) => {
                    if data.len() > config.max_message_size {
                        warn!(
                            user = %user,
                            size = data.len(),
                            limit = config.max_message_size,
                            "Inbound frame too large"
                        );
                        break;
                    }
                    // Stalls here while this sender's dispatch queue is full
                    tokio::select! {
                        biased;
                        _ = connection.closing().cancelled() => break,
                        _ = hub.submit(UserMessage::new(user, data)) => {}
                    }
                }
                WireMessage::Ping(_) | WireMessage::Pong(_) => {
                    trace!(user = %user, "Keepalive frame");
                }
                WireMessage::Close => break,
            },
            Ok(Ok(None)) => {
                debug!(user = %user, "Client closed connection");
                break;
            }
            Ok(Err(TransportError::FrameTooLarge { size, limit })) => {
                warn!(user = %user, size, limit, "Inbound frame too large");
                break;
            }
            Ok(Err(e)) => {
                debug!(user = %user, error = %e, "Read failed");
                break;
            }
            Err(_) => {
                debug!(user = %user, timeout = ?config.idle_timeout, "Connection idle, dropping");
                break;
            }
        }
    }

    hub.unregister(connection.clone());
    connection.pump_exited();
}

/// Drain the outbound queue onto the transport and keep the client alive.
///
/// Queued frames are always written before a close takes effect. On exit
/// the transport is closed and the read pump is told to stop.
pub async fn write_pump<W: FrameWriter>(
    connection: Connection,
    mut outbound: Outbound,
    mut writer: W,
    config: PumpConfig,
) {
    let user = connection.user_id();
    let mut heartbeat = interval_at(
        Instant::now() + config.heartbeat_interval,
        config.heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = write(&mut writer, WireMessage::Text(frame), config.write_timeout).await {
                        debug!(user = %user, error = %e, "Write failed");
                        break;
                    }
                }
                None => {
                    // Queue closed by the hub
                    let _ = write(&mut writer, WireMessage::Close, config.write_timeout).await;
                    break;
                }
            },
            _ = heartbeat.tick() => {
                if let Err(e) = write(&mut writer, WireMessage::Ping(Bytes::new()), config.write_timeout).await {
                    debug!(user = %user, error = %e, "Heartbeat failed");
                    break;
                }
            }
            _ = connection.closing().cancelled() => {
                flush(&mut outbound, &mut writer, config.write_timeout, user).await;
                break;
            }
        }
    }

    if let Err(e) = writer.close().await {
        trace!(user = %user, error = %e, "Close failed");
    }
    connection.pump_exited();
}

/// Write whatever is still queued, stopping at the first failed write.
async fn flush<W: FrameWriter>(
    outbound: &mut Outbound,
    writer: &mut W,
    deadline: Duration,
    user: UserId,
) {
    let mut flushed = 0usize;
    while let Ok(frame) = outbound.try_recv() {
        if let Err(e) = write(writer, WireMessage::Text(frame), deadline).await {
            debug!(user = %user, error = %e, flushed, "Flush on close failed");
            return;
        }
        flushed += 1;
    }
    if flushed > 0 {
        trace!(user = %user, flushed, "Flushed queued frames on close");
    }
}

async fn write<W: FrameWriter>(
    writer: &mut W,
    message: WireMessage,
    deadline: Duration,
) -> Result<(), TransportError> {
    tokio::time::timeout(deadline, writer.send(message))
        .await
        .map_err(|_| TransportError::Timeout)?
}
