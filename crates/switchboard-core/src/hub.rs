//! The connection hub.
//!
//! A hub is the registry of the live connections of one node. All registry
//! mutation happens inside a single control-loop task ([`HubLoop`]); other
//! tasks post events to it. Reads such as [`Hub::online_users`] and the
//! per-user lookup of [`Hub::send_to_user`] go straight to the map and never
//! wait for the loop.
//!
//! Inbound client frames go to a fixed set of dispatch workers, sharded by
//! sender, so one sender's messages stay in order while a slow persistence
//! call only holds up that shard. Shard queues are bounded: a sender whose
//! shard is full waits in [`Hub::submit`], which stalls that connection's
//! read pump instead of growing memory.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use switchboard_protocol::{codec, NodeId, OutboundEnvelope, UserId};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::connection::{
    Connection, EnqueueError, Identity, Outbound, DEFAULT_SEND_QUEUE_CAPACITY,
};
use crate::message::UserMessage;
use crate::presence::{PresenceDirectory, PresenceError};

/// Default number of inbound dispatch workers.
pub const DEFAULT_DISPATCH_WORKERS: usize = 8;

/// Default interval between presence lease refreshes.
pub const DEFAULT_PRESENCE_REFRESH: Duration = Duration::from_secs(40);

/// Default capacity of each dispatch worker's inbound queue.
pub const DEFAULT_INBOUND_QUEUE_CAPACITY: usize = 128;

/// Default deadline of a single presence call.
pub const DEFAULT_PRESENCE_TIMEOUT: Duration = Duration::from_secs(3);

/// Receives every inbound client frame, in per-sender order.
#[async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    /// Handle one frame.
    async fn handle(&self, message: UserMessage);
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Outbound queue capacity of every connection.
    pub send_queue_capacity: usize,
    /// Number of inbound dispatch workers.
    pub dispatch_workers: usize,
    /// Inbound queue capacity of each dispatch worker.
    pub inbound_queue_capacity: usize,
    /// How often registered users' presence records are re-written.
    /// `None` disables refreshing.
    pub presence_refresh: Option<Duration>,
    /// Deadline of a single presence call.
    pub presence_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
            dispatch_workers: DEFAULT_DISPATCH_WORKERS,
            inbound_queue_capacity: DEFAULT_INBOUND_QUEUE_CAPACITY,
            presence_refresh: Some(DEFAULT_PRESENCE_REFRESH),
            presence_timeout: DEFAULT_PRESENCE_TIMEOUT,
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    /// Currently registered connections.
    pub connections: usize,
    /// Registrations since start.
    pub registered_total: u64,
    /// Connections evicted for being too slow or replaced.
    pub evictions_total: u64,
    /// Inbound frames handed to the dispatchers.
    pub inbound_total: u64,
    /// Outbound frames queued on connections.
    pub outbound_total: u64,
}

enum HubEvent {
    Register(Connection),
    Unregister(Connection),
    Broadcast(Bytes),
    Barrier(oneshot::Sender<()>),
}

/// Registry of the live connections of one node.
pub struct Hub {
    node_id: NodeId,
    registry: DashMap<UserId, Connection>,
    events: mpsc::UnboundedSender<HubEvent>,
    dispatchers: Vec<mpsc::Sender<UserMessage>>,
    presence: Arc<dyn PresenceDirectory>,
    config: HubConfig,
    registered_total: AtomicU64,
    evictions_total: AtomicU64,
    inbound_total: AtomicU64,
    outbound_total: AtomicU64,
}

impl Hub {
    /// Create a hub and the control loop that owns it.
    ///
    /// Nothing is processed until [`HubLoop::run`] is spawned.
    #[must_use]
    pub fn new(
        node_id: NodeId,
        presence: Arc<dyn PresenceDirectory>,
        config: HubConfig,
    ) -> (Arc<Self>, HubLoop) {
        let (events, rx) = mpsc::unbounded_channel();
        let (dispatchers, shards): (Vec<_>, Vec<_>) = (0..config.dispatch_workers.max(1))
            .map(|_| mpsc::channel(config.inbound_queue_capacity.max(1)))
            .unzip();
        let hub = Arc::new(Self {
            node_id,
            registry: DashMap::new(),
            events,
            dispatchers,
            presence,
            config,
            registered_total: AtomicU64::new(0),
            evictions_total: AtomicU64::new(0),
            inbound_total: AtomicU64::new(0),
            outbound_total: AtomicU64::new(0),
        });
        let hub_loop = HubLoop {
            hub: Arc::clone(&hub),
            events: rx,
            shards,
        };
        (hub, hub_loop)
    }

    /// Get this node's id.
    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Create a connection sized for this hub. It is not registered yet.
    #[must_use]
    pub fn connect(&self, identity: Identity) -> (Connection, Outbound) {
        Connection::new(identity, self.config.send_queue_capacity)
    }

    /// Ask the loop to register `connection`.
    pub fn register(&self, connection: Connection) {
        self.post(HubEvent::Register(connection));
    }

    /// Ask the loop to unregister `connection`. Safe to call more than once.
    pub fn unregister(&self, connection: Connection) {
        self.post(HubEvent::Unregister(connection));
    }

    /// Send a pre-encoded frame to every registered connection.
    pub fn broadcast(&self, frame: Bytes) {
        self.post(HubEvent::Broadcast(frame));
    }

    /// Hand an inbound client frame to the sender's dispatch worker.
    ///
    /// Waits while that worker's queue is full.
    pub async fn submit(&self, message: UserMessage) {
        let shard = (message.user_id.as_u128() % self.dispatchers.len() as u128) as usize;
        if self.dispatchers[shard].send(message).await.is_err() {
            debug!(node = %self.node_id, shard, "Dispatch worker gone, inbound frame dropped");
            return;
        }
        self.inbound_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Wait until every event posted before this call has been processed.
    pub async fn barrier(&self) {
        let (tx, rx) = oneshot::channel();
        self.post(HubEvent::Barrier(tx));
        let _ = rx.await;
    }

    /// Send an envelope to `user` if connected to this node.
    ///
    /// Returns `true` if the frame was queued.
    pub fn send_to_user(&self, user: UserId, envelope: &OutboundEnvelope) -> bool {
        match codec::encode(envelope) {
            Ok(frame) => self.send_frame_to_user(user, frame),
            Err(e) => {
                warn!(user = %user, kind = %envelope.kind, error = %e, "Failed to encode envelope");
                false
            }
        }
    }

    /// Send a pre-encoded frame to `user` if connected to this node.
    ///
    /// A user that is not registered here is a silent no-op. A full queue
    /// evicts the connection.
    pub fn send_frame_to_user(&self, user: UserId, frame: Bytes) -> bool {
        // Clone out of the map so no shard lock is held while evicting
        let Some(connection) = self.registry.get(&user).map(|c| c.clone()) else {
            trace!(user = %user, "User not connected to this node");
            return false;
        };

        match connection.enqueue(frame) {
            Ok(()) => {
                self.outbound_total.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(EnqueueError::Full) => {
                self.evict(&connection);
                false
            }
            Err(EnqueueError::Closed) => false,
        }
    }

    /// Get the users registered on this node.
    #[must_use]
    pub fn online_users(&self) -> Vec<UserId> {
        self.registry.iter().map(|entry| *entry.key()).collect()
    }

    /// Check whether `user` is registered on this node.
    #[must_use]
    pub fn is_local(&self, user: UserId) -> bool {
        self.registry.contains_key(&user)
    }

    /// Get the connection registered for `user`.
    #[must_use]
    pub fn connection(&self, user: UserId) -> Option<Connection> {
        self.registry.get(&user).map(|c| c.clone())
    }

    /// Get the number of registered connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Get hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            connections: self.registry.len(),
            registered_total: self.registered_total.load(Ordering::Relaxed),
            evictions_total: self.evictions_total.load(Ordering::Relaxed),
            inbound_total: self.inbound_total.load(Ordering::Relaxed),
            outbound_total: self.outbound_total.load(Ordering::Relaxed),
        }
    }

    fn post(&self, event: HubEvent) {
        if self.events.send(event).is_err() {
            debug!(node = %self.node_id, "Hub loop has stopped, event dropped");
        }
    }

    /// Close a slow connection now and let the loop drop its entry.
    fn evict(&self, connection: &Connection) {
        if connection.close() {
            self.evictions_total.fetch_add(1, Ordering::Relaxed);
            warn!(
                user = %connection.user_id(),
                connection = connection.id(),
                "Outbound queue full, evicting connection"
            );
            self.unregister(connection.clone());
        }
    }

    async fn presence_call<T>(
        &self,
        op: &'static str,
        call: impl Future<Output = Result<T, PresenceError>>,
    ) -> Option<T> {
        match tokio::time::timeout(self.config.presence_timeout, call).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                warn!(node = %self.node_id, op, error = %e, "Presence call failed");
                None
            }
            Err(_) => {
                warn!(node = %self.node_id, op, "Presence call timed out");
                None
            }
        }
    }

    async fn on_register(&self, connection: Connection) {
        let user = connection.user_id();
        if connection.is_closed() {
            debug!(user = %user, "Connection closed before registration");
            return;
        }

        if let Some(previous) = self.registry.insert(user, connection.clone()) {
            if previous.id() != connection.id() && previous.close() {
                self.evictions_total.fetch_add(1, Ordering::Relaxed);
                debug!(user = %user, connection = previous.id(), "Replaced by newer connection");
            }
        }
        connection.mark_established();
        self.registered_total.fetch_add(1, Ordering::Relaxed);

        self.presence_call("set_location", self.presence.set_location(user, &self.node_id))
            .await;

        let welcome = OutboundEnvelope::connection_established(user, &self.node_id);
        self.send_to_user(user, &welcome);
        info!(user = %user, connection = connection.id(), "Client registered");
    }

    async fn on_unregister(&self, connection: Connection) {
        let user = connection.user_id();
        let removed = self
            .registry
            .remove_if(&user, |_, current| current.id() == connection.id())
            .is_some();
        connection.close();

        if removed {
            self.presence_call(
                "delete_location",
                self.presence.delete_location(user, &self.node_id),
            )
            .await;
            info!(user = %user, connection = connection.id(), "Client unregistered");
        }
    }

    fn on_broadcast(&self, frame: Bytes) {
        let mut slow = Vec::new();
        for entry in self.registry.iter() {
            match entry.value().enqueue(frame.clone()) {
                Ok(()) => {
                    self.outbound_total.fetch_add(1, Ordering::Relaxed);
                }
                Err(EnqueueError::Full) => slow.push(entry.value().clone()),
                Err(EnqueueError::Closed) => {}
            }
        }
        for connection in slow {
            self.evict(&connection);
        }
    }

    async fn refresh_presence(&self) {
        let users = self.online_users();
        if !users.is_empty() {
            trace!(node = %self.node_id, count = users.len(), "Refreshing presence leases");
            self.presence_call(
                "refresh_locations",
                self.presence.refresh_locations(&users, &self.node_id),
            )
            .await;
        }

        if let Some(swept) = self
            .presence_call("sweep_expired", self.presence.sweep_expired())
            .await
        {
            if swept > 0 {
                debug!(node = %self.node_id, swept, "Expired presence records dropped");
            }
        }
    }

    async fn drain(&self) {
        let connections: Vec<Connection> =
            self.registry.iter().map(|e| e.value().clone()).collect();
        for connection in connections {
            self.on_unregister(connection).await;
        }
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("node_id", &self.node_id)
            .field("connections", &self.registry.len())
            .finish()
    }
}

/// The hub's control loop.
pub struct HubLoop {
    hub: Arc<Hub>,
    events: mpsc::UnboundedReceiver<HubEvent>,
    shards: Vec<mpsc::Receiver<UserMessage>>,
}

impl HubLoop {
    /// Run until `shutdown` is cancelled.
    ///
    /// On exit every local connection is closed and its presence record
    /// removed.
    pub async fn run(mut self, handler: Arc<dyn InboundHandler>, shutdown: CancellationToken) {
        let hub = Arc::clone(&self.hub);
        let workers = spawn_dispatchers(std::mem::take(&mut self.shards), handler, &shutdown);
        let mut refresh = hub.config.presence_refresh.map(|period| {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        info!(node = %hub.node_id, workers, "Hub started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                event = self.events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
                _ = tick(&mut refresh) => hub.refresh_presence().await,
            }
        }

        hub.drain().await;
        info!(node = %hub.node_id, "Hub stopped");
    }

    async fn handle(&self, event: HubEvent) {
        match event {
            HubEvent::Register(connection) => self.hub.on_register(connection).await,
            HubEvent::Unregister(connection) => self.hub.on_unregister(connection).await,
            HubEvent::Broadcast(frame) => self.hub.on_broadcast(frame),
            HubEvent::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
}

/// Start one worker per shard queue. Returns the number started.
fn spawn_dispatchers(
    shards: Vec<mpsc::Receiver<UserMessage>>,
    handler: Arc<dyn InboundHandler>,
    shutdown: &CancellationToken,
) -> usize {
    let workers = shards.len();
    for mut rx in shards {
        let handler = Arc::clone(&handler);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    message = rx.recv() => match message {
                        Some(message) => handler.handle(message).await,
                        None => break,
                    },
                }
            }
        });
    }
    workers
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::MemoryPresence;
    use serde_json::Value;
    use tokio::sync::Semaphore;
    use uuid::Uuid;

    struct Discard;

    #[async_trait]
    impl InboundHandler for Discard {
        async fn handle(&self, _message: UserMessage) {}
    }

    /// Handles one frame per permit.
    struct Gated(Arc<Semaphore>);

    #[async_trait]
    impl InboundHandler for Gated {
        async fn handle(&self, _message: UserMessage) {
            if let Ok(permit) = self.0.acquire().await {
                permit.forget();
            }
        }
    }

    fn start(config: HubConfig) -> (Arc<Hub>, Arc<MemoryPresence>, CancellationToken) {
        let presence = Arc::new(MemoryPresence::new());
        let (hub, hub_loop) = Hub::new(NodeId::new("node-a"), presence.clone(), config);
        let shutdown = CancellationToken::new();
        tokio::spawn(hub_loop.run(Arc::new(Discard), shutdown.clone()));
        (hub, presence, shutdown)
    }

    fn user_connection(hub: &Hub, user: UserId) -> (Connection, Outbound) {
        hub.connect(Identity::new(user, "user"))
    }

    fn decode(frame: Bytes) -> Value {
        serde_json::from_slice(&frame).unwrap()
    }

    #[tokio::test]
    async fn test_register_writes_presence_and_welcomes() {
        let (hub, presence, _shutdown) = start(HubConfig::default());
        let user = Uuid::new_v4();
        let (conn, mut outbound) = user_connection(&hub, user);

        hub.register(conn.clone());
        hub.barrier().await;

        assert!(hub.is_local(user));
        assert_eq!(
            presence.get_location(user).await.unwrap(),
            NodeId::new("node-a")
        );

        let welcome = decode(outbound.recv().await.unwrap());
        assert_eq!(welcome["type"], "connection_established");
        assert_eq!(welcome["data"]["user_id"], user.to_string());
    }

    #[tokio::test]
    async fn test_registry_consistency_at_quiescence() {
        let (hub, presence, _shutdown) = start(HubConfig::default());
        let users: Vec<UserId> = (0..5).map(|_| Uuid::new_v4()).collect();
        let conns: Vec<_> = users.iter().map(|u| user_connection(&hub, *u)).collect();

        for (conn, _) in &conns {
            hub.register(conn.clone());
        }
        hub.unregister(conns[1].0.clone());
        hub.unregister(conns[3].0.clone());
        hub.barrier().await;

        let mut online = hub.online_users();
        online.sort();
        let mut expected = vec![users[0], users[2], users[4]];
        expected.sort();
        assert_eq!(online, expected);
        assert!(presence.get_location(users[1]).await.is_err());
        assert_eq!(hub.connection_count(), 3);
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let (hub, _presence, _shutdown) = start(HubConfig::default());
        let user = Uuid::new_v4();
        let (conn, _outbound) = user_connection(&hub, user);

        hub.register(conn.clone());
        hub.unregister(conn.clone());
        hub.unregister(conn.clone());
        hub.barrier().await;

        assert!(!hub.is_local(user));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_superseded_connection_unregister_keeps_newer() {
        let (hub, presence, _shutdown) = start(HubConfig::default());
        let user = Uuid::new_v4();
        let (old, _old_out) = user_connection(&hub, user);
        let (new, _new_out) = user_connection(&hub, user);

        hub.register(old.clone());
        hub.register(new.clone());
        hub.barrier().await;
        assert!(old.is_closed());
        assert!(!new.is_closed());

        // The stale unregister arrives late
        hub.unregister(old.clone());
        hub.barrier().await;

        assert_eq!(hub.connection(user).unwrap().id(), new.id());
        assert!(!new.is_closed());
        assert!(presence.get_location(user).await.is_ok());
        assert_eq!(hub.stats().evictions_total, 1);
    }

    #[tokio::test]
    async fn test_full_queue_evicts_once() {
        let config = HubConfig {
            send_queue_capacity: 4,
            ..HubConfig::default()
        };
        let (hub, _presence, _shutdown) = start(config);
        let user = Uuid::new_v4();
        let (conn, _outbound) = user_connection(&hub, user);

        hub.register(conn.clone());
        hub.barrier().await;

        // The welcome frame occupies one slot
        let frame = Bytes::from_static(b"{}");
        for _ in 0..3 {
            assert!(hub.send_frame_to_user(user, frame.clone()));
        }
        assert!(!hub.send_frame_to_user(user, frame.clone()));
        assert!(conn.is_closed());

        // Later sends are no-ops
        assert!(!hub.send_frame_to_user(user, frame.clone()));
        hub.barrier().await;
        assert!(!hub.is_local(user));
        assert!(!hub.send_frame_to_user(user, frame.clone()));
        assert_eq!(hub.stats().evictions_total, 1);

        // Until the user reconnects
        let (again, mut again_out) = user_connection(&hub, user);
        hub.register(again);
        hub.barrier().await;
        assert!(hub.send_frame_to_user(user, frame));
        assert_eq!(
            decode(again_out.recv().await.unwrap())["type"],
            "connection_established"
        );
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_and_evicts_slow() {
        let config = HubConfig {
            send_queue_capacity: 2,
            ..HubConfig::default()
        };
        let (hub, _presence, _shutdown) = start(config);
        let (fast_user, slow_user) = (Uuid::new_v4(), Uuid::new_v4());
        let (fast, mut fast_out) = user_connection(&hub, fast_user);
        let (slow, _slow_out) = user_connection(&hub, slow_user);

        hub.register(fast);
        hub.register(slow.clone());
        hub.barrier().await;
        fast_out.recv().await.unwrap(); // welcome

        hub.broadcast(Bytes::from_static(b"one"));
        hub.barrier().await;
        assert_eq!(fast_out.recv().await.unwrap(), Bytes::from_static(b"one"));

        hub.broadcast(Bytes::from_static(b"two"));
        hub.barrier().await;
        hub.barrier().await;

        assert!(slow.is_closed());
        assert!(!hub.is_local(slow_user));
        assert!(hub.is_local(fast_user));
        assert_eq!(fast_out.recv().await.unwrap(), Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn test_send_to_unknown_user_is_noop() {
        let (hub, _presence, _shutdown) = start(HubConfig::default());
        let envelope = OutboundEnvelope::broadcast("hello");
        assert!(!hub.send_to_user(Uuid::new_v4(), &envelope));
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_lease_is_refreshed() {
        let presence = Arc::new(MemoryPresence::with_lease(Duration::from_secs(30)));
        let config = HubConfig {
            presence_refresh: Some(Duration::from_secs(10)),
            ..HubConfig::default()
        };
        let (hub, hub_loop) = Hub::new(NodeId::new("node-a"), presence.clone(), config);
        tokio::spawn(hub_loop.run(Arc::new(Discard), CancellationToken::new()));

        let user = Uuid::new_v4();
        let (conn, _outbound) = user_connection(&hub, user);
        hub.register(conn);
        hub.barrier().await;

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(presence.get_location(user).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_sweeps_expired_records() {
        let presence = Arc::new(MemoryPresence::with_lease(Duration::from_secs(30)));
        let config = HubConfig {
            presence_refresh: Some(Duration::from_secs(10)),
            ..HubConfig::default()
        };
        let (hub, hub_loop) = Hub::new(NodeId::new("node-a"), presence.clone(), config);
        tokio::spawn(hub_loop.run(Arc::new(Discard), CancellationToken::new()));

        // Left behind by a node that died
        let orphan = Uuid::new_v4();
        presence
            .set_location(orphan, &NodeId::new("node-gone"))
            .await
            .unwrap();

        let user = Uuid::new_v4();
        let (conn, _outbound) = user_connection(&hub, user);
        hub.register(conn);
        hub.barrier().await;

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert!(presence.prune_expired().is_empty());
        assert_eq!(presence.location_count(), 1);
        assert!(presence.get_location(user).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_node_refresh_keeps_user_on_new_node() {
        let presence = Arc::new(MemoryPresence::with_lease(Duration::from_secs(120)));
        let config = HubConfig {
            presence_refresh: Some(Duration::from_secs(40)),
            ..HubConfig::default()
        };
        let shutdown = CancellationToken::new();
        let (hub_a, loop_a) = Hub::new(NodeId::new("node-a"), presence.clone(), config.clone());
        let (hub_b, loop_b) = Hub::new(NodeId::new("node-b"), presence.clone(), config);
        tokio::spawn(loop_a.run(Arc::new(Discard), shutdown.clone()));
        tokio::spawn(loop_b.run(Arc::new(Discard), shutdown.clone()));

        let user = Uuid::new_v4();
        let (on_a, _a_out) = user_connection(&hub_a, user);
        hub_a.register(on_a.clone());
        hub_a.barrier().await;

        tokio::time::sleep(Duration::from_secs(20)).await;
        let (on_b, _b_out) = user_connection(&hub_b, user);
        hub_b.register(on_b);
        hub_b.barrier().await;

        // Both hubs refresh at t=40 while node a still holds its old connection
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(
            presence.get_location(user).await.unwrap(),
            NodeId::new("node-b")
        );

        hub_a.unregister(on_a);
        hub_a.barrier().await;
        assert_eq!(
            presence.get_location(user).await.unwrap(),
            NodeId::new("node-b")
        );
        assert!(hub_b.is_local(user));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_dispatch_queue_holds_back_the_sender() {
        let gate = Arc::new(Semaphore::new(0));
        let config = HubConfig {
            dispatch_workers: 1,
            inbound_queue_capacity: 2,
            ..HubConfig::default()
        };
        let (hub, hub_loop) =
            Hub::new(NodeId::new("node-a"), Arc::new(MemoryPresence::new()), config);
        tokio::spawn(hub_loop.run(Arc::new(Gated(gate.clone())), CancellationToken::new()));

        let user = Uuid::new_v4();
        let frame = || UserMessage::new(user, Bytes::from_static(b"{}"));

        // One frame held by the handler, two queued behind it
        for _ in 0..3 {
            hub.submit(frame()).await;
        }
        assert!(
            tokio::time::timeout(Duration::from_secs(1), hub.submit(frame()))
                .await
                .is_err()
        );

        gate.add_permits(1);
        assert!(
            tokio::time::timeout(Duration::from_secs(1), hub.submit(frame()))
                .await
                .is_ok()
        );
        assert_eq!(hub.stats().inbound_total, 4);
    }

    #[tokio::test]
    async fn test_shutdown_drains_registry() {
        let (hub, presence, shutdown) = start(HubConfig::default());
        let user = Uuid::new_v4();
        let (conn, _outbound) = user_connection(&hub, user);
        hub.register(conn.clone());
        hub.barrier().await;

        shutdown.cancel();
        // The loop is gone, so the barrier returns once the event is dropped
        hub.barrier().await;

        for _ in 0..10 {
            if !hub.is_local(user) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!hub.is_local(user));
        assert!(conn.is_closed());
        assert!(presence.get_location(user).await.is_err());
    }
}
