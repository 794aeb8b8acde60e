//! Inbound message routing.
//!
//! The router turns a raw client frame into actions: it decodes the
//! envelope, dispatches on its type, calls the message service, and
//! delivers the result to every recipient wherever they are connected.
//!
//! Delivery follows the presence directory:
//!
//! - recipient on this node: queued on its connection directly
//! - recipient on another node: published on that node's channel
//! - no presence record: offline, nothing to deliver now

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use switchboard_protocol::{
    codec, keys, ClientRequest, DurabilityEvent, GroupId, GroupMessage, MessageReceipt, NodeId,
    OutboundEnvelope, P2PMessage, ReadReceipt, RelayFrame, SendGroupRequest, SendP2PRequest,
    TypingRequest, UserId,
};
use tracing::{debug, trace, warn};

use crate::bus::CrossNodeTransport;
use crate::events::EventPublisher;
use crate::hub::{Hub, InboundHandler};
use crate::message::UserMessage;
use crate::persistence::{MessageService, PersistenceError};
use crate::presence::{PresenceDirectory, PresenceError};

/// Default deadline of a message service call.
pub const DEFAULT_PERSISTENCE_TIMEOUT: Duration = Duration::from_secs(10);

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Deadline of a single message service call.
    pub persistence_timeout: Duration,
    /// Deadline of a single presence lookup.
    pub presence_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            persistence_timeout: DEFAULT_PERSISTENCE_TIMEOUT,
            presence_timeout: crate::hub::DEFAULT_PRESENCE_TIMEOUT,
        }
    }
}

/// Where a recipient was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Connected to this node.
    Local,
    /// Connected to another node.
    Remote(NodeId),
    /// Not connected anywhere.
    Offline,
}

/// Router statistics.
#[derive(Debug, Default)]
pub struct RouterStats {
    pub delivered_local: AtomicU64,
    pub relayed: AtomicU64,
    pub offline: AtomicU64,
    pub dropped: AtomicU64,
    pub persistence_failures: AtomicU64,
    pub relay_failures: AtomicU64,
}

/// Point-in-time copy of [`RouterStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterSnapshot {
    pub delivered_local: u64,
    pub relayed: u64,
    pub offline: u64,
    pub dropped: u64,
    pub persistence_failures: u64,
    pub relay_failures: u64,
}

impl RouterStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot.
    #[must_use]
    pub fn snapshot(&self) -> RouterSnapshot {
        RouterSnapshot {
            delivered_local: self.delivered_local.load(Ordering::Relaxed),
            relayed: self.relayed.load(Ordering::Relaxed),
            offline: self.offline.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
            relay_failures: self.relay_failures.load(Ordering::Relaxed),
        }
    }
}

/// Routes inbound client frames.
pub struct MessageRouter {
    hub: Arc<Hub>,
    presence: Arc<dyn PresenceDirectory>,
    bus: Arc<dyn CrossNodeTransport>,
    messages: Arc<dyn MessageService>,
    events: EventPublisher,
    config: RouterConfig,
    stats: RouterStats,
}

impl MessageRouter {
    /// Create a router for `hub`.
    #[must_use]
    pub fn new(
        hub: Arc<Hub>,
        presence: Arc<dyn PresenceDirectory>,
        bus: Arc<dyn CrossNodeTransport>,
        messages: Arc<dyn MessageService>,
        events: EventPublisher,
        config: RouterConfig,
    ) -> Self {
        Self {
            hub,
            presence,
            bus,
            messages,
            events,
            config,
            stats: RouterStats::default(),
        }
    }

    /// Get routing statistics.
    #[must_use]
    pub fn stats(&self) -> RouterSnapshot {
        self.stats.snapshot()
    }

    /// Route one inbound frame.
    ///
    /// Undecodable frames and unknown types are logged and dropped; the
    /// sender's connection is left untouched.
    pub async fn route(&self, message: UserMessage) {
        let sender = message.user_id;

        let envelope = match codec::decode_envelope(&message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(user = %sender, error = %e, "Dropping undecodable frame");
                RouterStats::bump(&self.stats.dropped);
                return;
            }
        };

        let request = match ClientRequest::from_envelope(envelope) {
            Ok(request) => request,
            Err(e) => {
                debug!(user = %sender, error = %e, "Dropping malformed request");
                RouterStats::bump(&self.stats.dropped);
                return;
            }
        };

        trace!(user = %sender, kind = request.tag(), "Routing request");
        match request {
            ClientRequest::SendP2P(request) => self.send_p2p(sender, request).await,
            ClientRequest::SendGroup(request) => self.send_group(sender, request).await,
            ClientRequest::Typing(request) => self.typing(sender, request).await,
            ClientRequest::ReadReceipt(receipt) => self.read_receipt(sender, receipt),
            ClientRequest::Unknown(kind) => {
                debug!(user = %sender, kind = %kind, "Unknown message type");
                RouterStats::bump(&self.stats.dropped);
            }
        }
    }

    async fn send_p2p(&self, sender: UserId, mut request: SendP2PRequest) {
        // Never trust the client's claim of who it is
        request.sender_id = sender;

        let receipt = match self.persist(self.messages.send_p2p(&request)).await {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!(user = %sender, error = %e, "Failed to persist p2p message");
                self.reply_error(sender, "Failed to send message", &e);
                return;
            }
        };

        let message = P2PMessage::accepted(&request, receipt);
        self.events
            .publish(DurabilityEvent::p2p(&message), receipt.id.to_string());

        self.deliver(message.receiver_id, OutboundEnvelope::new_p2p_message(&message))
            .await;
        self.acknowledge(sender, &receipt);
    }

    async fn send_group(&self, sender: UserId, mut request: SendGroupRequest) {
        request.sender_id = sender;

        let receipt = match self.persist(self.messages.send_group(&request)).await {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!(user = %sender, group = %request.group_id, error = %e, "Failed to persist group message");
                self.reply_error(sender, "Failed to send group message", &e);
                return;
            }
        };

        let message = GroupMessage::accepted(&request, receipt);
        self.events
            .publish(DurabilityEvent::group(&message), receipt.id.to_string());

        self.deliver_group(
            sender,
            message.group_id,
            OutboundEnvelope::new_group_message(&message),
        )
        .await;
        self.acknowledge(sender, &receipt);
    }

    async fn typing(&self, sender: UserId, request: TypingRequest) {
        let envelope = OutboundEnvelope::typing_indicator(sender, request.is_typing);
        self.deliver(request.receiver_id, envelope).await;
    }

    fn read_receipt(&self, sender: UserId, receipt: ReadReceipt) {
        debug!(
            user = %sender,
            conversation = ?receipt.conversation_id,
            message = ?receipt.message_id,
            "Read receipt"
        );
    }

    /// Find where `user` is connected.
    pub async fn locate(&self, user: UserId) -> Route {
        let lookup =
            tokio::time::timeout(self.config.presence_timeout, self.presence.get_location(user))
                .await;
        match lookup {
            Ok(Ok(node)) if node == *self.hub.node_id() => Route::Local,
            Ok(Ok(node)) => Route::Remote(node),
            Ok(Err(PresenceError::NotFound)) => Route::Offline,
            Ok(Err(e)) => {
                warn!(user = %user, error = %e, "Presence lookup failed, treating as offline");
                Route::Offline
            }
            Err(_) => {
                warn!(user = %user, "Presence lookup timed out, treating as offline");
                Route::Offline
            }
        }
    }

    /// Deliver `envelope` to `user` wherever they are connected.
    ///
    /// A presence record naming this node for a user the hub no longer
    /// holds counts as offline.
    pub async fn deliver(&self, user: UserId, envelope: OutboundEnvelope) -> Route {
        let mut route = self.locate(user).await;
        if route == Route::Local && !self.hub.send_to_user(user, &envelope) {
            trace!(user = %user, kind = %envelope.kind, "Recipient not held locally");
            route = Route::Offline;
        }
        match &route {
            Route::Local => RouterStats::bump(&self.stats.delivered_local),
            Route::Remote(node) => {
                let channel = keys::node_channel(node);
                self.relay(&channel, &RelayFrame::direct(user, envelope))
                    .await;
            }
            Route::Offline => {
                trace!(user = %user, kind = %envelope.kind, "Recipient offline");
                RouterStats::bump(&self.stats.offline);
            }
        }
        route
    }

    async fn deliver_group(&self, sender: UserId, group: GroupId, envelope: OutboundEnvelope) {
        let members = self.group_members(group).await;

        let frame = match codec::encode(&envelope) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(group = %group, error = %e, "Failed to encode group envelope");
                return;
            }
        };

        let mut remote = Vec::new();
        for member in members.into_iter().filter(|m| *m != sender) {
            match self.locate(member).await {
                Route::Local if self.hub.send_frame_to_user(member, frame.clone()) => {
                    RouterStats::bump(&self.stats.delivered_local);
                }
                Route::Local => RouterStats::bump(&self.stats.offline),
                Route::Remote(_) => remote.push(member),
                Route::Offline => RouterStats::bump(&self.stats.offline),
            }
        }

        if !remote.is_empty() {
            let frame = RelayFrame::group(self.hub.node_id().clone(), remote, envelope);
            self.relay(keys::GROUP_BROADCAST_CHANNEL, &frame).await;
        }
    }

    /// Resolve group members from the cached snapshot, falling back to the
    /// message service.
    async fn group_members(&self, group: GroupId) -> Vec<UserId> {
        let cached =
            tokio::time::timeout(self.config.presence_timeout, self.presence.get_members(group))
                .await;
        match cached {
            Ok(Ok(members)) => return members,
            Ok(Err(PresenceError::NotFound)) => {}
            Ok(Err(e)) => warn!(group = %group, error = %e, "Membership cache unavailable"),
            Err(_) => warn!(group = %group, "Membership cache timed out"),
        }

        match self.persist(self.messages.group_members(group)).await {
            Ok(members) => {
                if let Err(e) = self.presence.set_members(group, &members).await {
                    debug!(group = %group, error = %e, "Failed to cache group members");
                }
                members
            }
            Err(e) => {
                warn!(group = %group, error = %e, "Failed to resolve group members");
                Vec::new()
            }
        }
    }

    async fn relay(&self, channel: &str, frame: &RelayFrame) {
        let result = match codec::encode(frame) {
            Ok(payload) => self.bus.publish(channel, payload).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match result {
            Ok(_) => RouterStats::bump(&self.stats.relayed),
            Err(e) => {
                warn!(channel = %channel, error = %e, "Failed to relay frame");
                RouterStats::bump(&self.stats.relay_failures);
            }
        }
    }

    async fn persist<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, PersistenceError>>,
    ) -> Result<T, PersistenceError> {
        match tokio::time::timeout(self.config.persistence_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(PersistenceError::Unavailable(
                "message service timed out".into(),
            )),
        }
    }

    fn acknowledge(&self, sender: UserId, receipt: &MessageReceipt) {
        self.hub
            .send_to_user(sender, &OutboundEnvelope::message_sent(receipt));
    }

    fn reply_error(&self, sender: UserId, message: &str, error: &PersistenceError) {
        RouterStats::bump(&self.stats.persistence_failures);
        self.hub
            .send_to_user(sender, &OutboundEnvelope::error(message, error.to_string()));
    }
}

#[async_trait]
impl InboundHandler for MessageRouter {
    async fn handle(&self, message: UserMessage) {
        self.route(message).await;
    }
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("node_id", self.hub.node_id())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
