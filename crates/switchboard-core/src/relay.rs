//! Cross-node relay listeners.
//!
//! Each node runs two listeners: one on its own `gateway_node:<node>`
//! channel for frames addressed to a single user, and one on the shared
//! `group_broadcast` channel. Both hand the embedded envelope to the local
//! hub, exactly as a direct local send would.

use std::sync::Arc;
use switchboard_protocol::{codec, keys, RelayFrame};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::bus::{BusError, CrossNodeTransport, Subscription};
use crate::hub::Hub;

/// The two subscriptions of one node.
#[derive(Debug)]
pub struct RelayListener {
    hub: Arc<Hub>,
    node: Subscription,
    group: Subscription,
}

impl RelayListener {
    /// Subscribe to this node's channel and the group channel.
    ///
    /// Subscribing happens before anything is spawned, so no frame published
    /// after this returns is missed.
    ///
    /// # Errors
    ///
    /// Returns an error if either subscription fails.
    pub async fn subscribe(
        hub: Arc<Hub>,
        bus: &dyn CrossNodeTransport,
    ) -> Result<Self, BusError> {
        let node = bus.subscribe(&keys::node_channel(hub.node_id())).await?;
        let group = bus.subscribe(keys::GROUP_BROADCAST_CHANNEL).await?;
        info!(node = %hub.node_id(), channel = %node.channel(), "Relay listeners subscribed");
        Ok(Self { hub, node, group })
    }

    /// Start both listener loops. They run until `shutdown` is cancelled.
    #[must_use]
    pub fn spawn(self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(listen(
                Arc::clone(&self.hub),
                self.node,
                shutdown.clone(),
            )),
            tokio::spawn(listen(self.hub, self.group, shutdown)),
        ]
    }
}

async fn listen(hub: Arc<Hub>, mut subscription: Subscription, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            payload = subscription.next() => match payload {
                Some(payload) => match codec::decode::<RelayFrame>(&payload) {
                    Ok(frame) => deliver(&hub, frame),
                    Err(e) => warn!(channel = %subscription.channel(), error = %e, "Malformed relay frame"),
                },
                None => {
                    warn!(channel = %subscription.channel(), "Relay subscription closed");
                    break;
                }
            },
        }
    }
    debug!(channel = %subscription.channel(), "Relay listener stopped");
}

/// Deliver a relayed frame to the users this node hosts.
pub fn deliver(hub: &Hub, frame: RelayFrame) {
    match frame {
        RelayFrame::Direct {
            recipient,
            envelope,
        } => {
            if !hub.send_to_user(recipient, &envelope) {
                trace!(user = %recipient, kind = %envelope.kind, "Relayed recipient not connected here");
            }
        }
        RelayFrame::Group {
            origin,
            recipients,
            envelope,
        } => {
            if origin == *hub.node_id() {
                return; // Our own members were served before publishing
            }
            let frame = match codec::encode(&envelope) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "Failed to encode relayed envelope");
                    return;
                }
            };
            for recipient in recipients {
                hub.send_frame_to_user(recipient, frame.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::connection::{Identity, Outbound};
    use crate::hub::{HubConfig, InboundHandler};
    use crate::message::UserMessage;
    use crate::presence::MemoryPresence;
    use async_trait::async_trait;
    use bytes::Bytes;
    use serde_json::Value;
    use switchboard_protocol::{NodeId, OutboundEnvelope, UserId};
    use uuid::Uuid;

    struct Discard;

    #[async_trait]
    impl InboundHandler for Discard {
        async fn handle(&self, _message: UserMessage) {}
    }

    async fn node(name: &str, bus: &MemoryBus, shutdown: &CancellationToken) -> Arc<Hub> {
        let (hub, hub_loop) = Hub::new(
            NodeId::new(name),
            Arc::new(MemoryPresence::new()),
            HubConfig::default(),
        );
        tokio::spawn(hub_loop.run(Arc::new(Discard), shutdown.clone()));
        let listener = RelayListener::subscribe(Arc::clone(&hub), bus).await.unwrap();
        let _ = listener.spawn(shutdown.clone());
        hub
    }

    async fn connect(hub: &Arc<Hub>, user: UserId) -> Outbound {
        let (conn, mut outbound) = hub.connect(Identity::new(user, "user"));
        hub.register(conn);
        hub.barrier().await;
        outbound.recv().await.unwrap(); // welcome
        outbound
    }

    fn kind(frame: Bytes) -> String {
        let value: Value = serde_json::from_slice(&frame).unwrap();
        value["type"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_direct_frame_on_node_channel() {
        let bus = MemoryBus::new();
        let shutdown = CancellationToken::new();
        let hub = node("node-b", &bus, &shutdown).await;
        let user = Uuid::new_v4();
        let mut outbound = connect(&hub, user).await;

        let frame = RelayFrame::direct(user, OutboundEnvelope::broadcast("relayed"));
        bus.publish(
            &keys::node_channel(&NodeId::new("node-b")),
            codec::encode(&frame).unwrap(),
        )
        .await
        .unwrap();

        assert_eq!(kind(outbound.recv().await.unwrap()), "broadcast");
    }

    #[tokio::test]
    async fn test_group_frame_skips_origin() {
        let bus = MemoryBus::new();
        let shutdown = CancellationToken::new();
        let a = node("node-a", &bus, &shutdown).await;
        let b = node("node-b", &bus, &shutdown).await;
        let (on_a, on_b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut out_a = connect(&a, on_a).await;
        let mut out_b = connect(&b, on_b).await;

        let frame = RelayFrame::group(
            NodeId::new("node-a"),
            vec![on_a, on_b],
            OutboundEnvelope::broadcast("group"),
        );
        bus.publish(keys::GROUP_BROADCAST_CHANNEL, codec::encode(&frame).unwrap())
            .await
            .unwrap();

        assert_eq!(kind(out_b.recv().await.unwrap()), "broadcast");

        // node-a originated the frame and must not deliver it again
        a.barrier().await;
        tokio::task::yield_now().await;
        assert!(out_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_frame_is_dropped() {
        let bus = MemoryBus::new();
        let shutdown = CancellationToken::new();
        let hub = node("node-b", &bus, &shutdown).await;
        let user = Uuid::new_v4();
        let mut outbound = connect(&hub, user).await;

        let channel = keys::node_channel(hub.node_id());
        bus.publish(&channel, Bytes::from_static(b"not json"))
            .await
            .unwrap();
        let frame = RelayFrame::direct(user, OutboundEnvelope::broadcast("after"));
        bus.publish(&channel, codec::encode(&frame).unwrap())
            .await
            .unwrap();

        // The listener survived the bad frame
        assert_eq!(kind(outbound.recv().await.unwrap()), "broadcast");
    }
}
