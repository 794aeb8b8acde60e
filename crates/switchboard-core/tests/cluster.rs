//! Two gateway nodes sharing one presence directory and one bus.

use bytes::Bytes;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::connection::{self, Identity, PumpConfig};
use switchboard_core::events::MemorySink;
use switchboard_core::{
    DeliveryPolicy, EventPublisher, Hub, HubConfig, MemoryBus, MemoryMessageStore,
    MemoryPresence, MessageRouter, PersistenceError, RelayListener, RouterConfig,
};
use switchboard_protocol::{unix_now, NodeId, UserId};
use switchboard_transport::memory::{self, MemoryPeer};
use switchboard_transport::WireMessage;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct Cluster {
    presence: Arc<MemoryPresence>,
    store: Arc<MemoryMessageStore>,
    sink: Arc<MemorySink>,
    shutdown: CancellationToken,
}

struct Node {
    hub: Arc<Hub>,
    router: Arc<MessageRouter>,
}

impl Cluster {
    fn new() -> Self {
        Self {
            presence: Arc::new(MemoryPresence::new()),
            store: Arc::new(MemoryMessageStore::new()),
            sink: Arc::new(MemorySink::new()),
            shutdown: CancellationToken::new(),
        }
    }

    async fn node(&self, name: &str, bus: &Arc<MemoryBus>) -> Node {
        let (hub, hub_loop) = Hub::new(
            NodeId::new(name),
            self.presence.clone(),
            HubConfig::default(),
        );
        let topics = HashMap::from([
            ("p2p_message".to_string(), "chat.p2p".to_string()),
            ("group_message".to_string(), "chat.group".to_string()),
        ]);
        let router = Arc::new(MessageRouter::new(
            Arc::clone(&hub),
            self.presence.clone(),
            bus.clone(),
            self.store.clone(),
            EventPublisher::new(self.sink.clone(), topics, DeliveryPolicy::AtMostOnce),
            RouterConfig::default(),
        ));
        tokio::spawn(hub_loop.run(router.clone(), self.shutdown.clone()));

        let listener = RelayListener::subscribe(Arc::clone(&hub), bus.as_ref())
            .await
            .unwrap();
        let _ = listener.spawn(self.shutdown.clone());

        Node { hub, router }
    }
}

async fn connect(node: &Node, user: UserId) -> MemoryPeer {
    let (reader, writer, mut peer) = memory::pair(64);
    connection::spawn(
        &node.hub,
        Identity::new(user, "user"),
        reader,
        writer,
        PumpConfig::default(),
    );
    let welcome = next_envelope(&mut peer).await;
    assert_eq!(welcome["type"], "connection_established");
    peer
}

async fn next_envelope(peer: &mut MemoryPeer) -> Value {
    let deadline = Duration::from_secs(5);
    loop {
        let message = tokio::time::timeout(deadline, peer.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed");
        if let Some(payload) = message.into_payload() {
            return serde_json::from_slice(&payload).unwrap();
        }
    }
}

async fn send(peer: &mut MemoryPeer, kind: &str, data: Value) {
    let frame = json!({"type": kind, "data": data}).to_string();
    peer.send(WireMessage::Text(Bytes::from(frame))).await.unwrap();
}

async fn assert_silent(peer: &mut MemoryPeer) {
    let next = tokio::time::timeout(Duration::from_millis(200), peer.recv()).await;
    assert!(next.is_err(), "unexpected frame: {next:?}");
}

#[tokio::test]
async fn test_p2p_across_nodes() {
    let cluster = Cluster::new();
    let bus = Arc::new(MemoryBus::new());
    let a = cluster.node("node-a", &bus).await;
    let b = cluster.node("node-b", &bus).await;

    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    cluster.store.add_friendship(alice, bob);
    let mut alice_peer = connect(&a, alice).await;
    let mut bob_peer = connect(&b, bob).await;

    let sent_at = unix_now();
    send(
        &mut alice_peer,
        "send_p2p_message",
        json!({"receiver_id": bob, "content": "hi bob", "content_type": 0}),
    )
    .await;

    let delivered = next_envelope(&mut bob_peer).await;
    assert_eq!(delivered["type"], "new_p2p_message");
    assert_eq!(delivered["data"]["sender_id"], alice.to_string());
    assert_eq!(delivered["data"]["content"], "hi bob");

    let ack = next_envelope(&mut alice_peer).await;
    assert_eq!(ack["type"], "message_sent");
    assert_eq!(ack["data"]["id"], delivered["data"]["id"]);
    assert_eq!(ack["data"]["timestamp"], delivered["data"]["timestamp"]);
    assert!(ack["data"]["timestamp"].as_i64().unwrap() >= sent_at);

    // Node a relayed, node b never touched persistence for this message
    assert_eq!(a.router.stats().relayed, 1);
    assert_eq!(b.router.stats().relayed, 0);
    assert_eq!(cluster.store.calls(), 1);
}

#[tokio::test]
async fn test_locality_routing_from_both_nodes() {
    let cluster = Cluster::new();
    let bus = Arc::new(MemoryBus::new());
    let a = cluster.node("node-a", &bus).await;
    let b = cluster.node("node-b", &bus).await;

    let (on_a, sender_a, sender_b) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let mut target = connect(&a, on_a).await;
    let _sa = connect(&a, sender_a).await;
    let _sb = connect(&b, sender_b).await;

    // Local path on the owning node
    a.router
        .route(switchboard_core::UserMessage::new(
            sender_a,
            json!({"type": "typing", "data": {"receiver_id": on_a, "is_typing": true}}).to_string(),
        ))
        .await;
    assert_eq!(next_envelope(&mut target).await["data"]["user_id"], sender_a.to_string());
    assert_eq!(a.router.stats().delivered_local, 1);

    // Owner's channel from the other node
    b.router
        .route(switchboard_core::UserMessage::new(
            sender_b,
            json!({"type": "typing", "data": {"receiver_id": on_a, "is_typing": false}}).to_string(),
        ))
        .await;
    let relayed = next_envelope(&mut target).await;
    assert_eq!(relayed["data"]["user_id"], sender_b.to_string());
    assert_eq!(relayed["data"]["is_typing"], false);
    assert_eq!(b.router.stats().relayed, 1);
}

#[tokio::test]
async fn test_persistence_failure_reaches_sender_only() {
    let cluster = Cluster::new();
    let bus = Arc::new(MemoryBus::new());
    let a = cluster.node("node-a", &bus).await;
    let b = cluster.node("node-b", &bus).await;

    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    cluster.store.add_friendship(alice, bob);
    cluster
        .store
        .set_failure(Some(PersistenceError::Storage("disk full".into())));
    let mut alice_peer = connect(&a, alice).await;
    let mut bob_peer = connect(&b, bob).await;

    send(
        &mut alice_peer,
        "send_p2p_message",
        json!({"receiver_id": bob, "content": "lost"}),
    )
    .await;

    let reply = next_envelope(&mut alice_peer).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["data"]["message"], "Failed to send message");
    assert!(reply["data"]["error"].as_str().unwrap().contains("disk full"));

    assert_silent(&mut bob_peer).await;
    assert!(cluster.sink.records().is_empty());
}

#[tokio::test]
async fn test_group_message_across_nodes() {
    let cluster = Cluster::new();
    let bus = Arc::new(MemoryBus::new());
    let a = cluster.node("node-a", &bus).await;
    let b = cluster.node("node-b", &bus).await;

    let (alice, carol, bob, dave) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let group = Uuid::new_v4();
    cluster.store.add_group(group, vec![alice, carol, bob, dave]);

    let mut alice_peer = connect(&a, alice).await;
    let mut carol_peer = connect(&a, carol).await;
    let mut bob_peer = connect(&b, bob).await;
    let mut dave_peer = connect(&b, dave).await;

    send(
        &mut alice_peer,
        "send_group_message",
        json!({"group_id": group, "content": "hello group"}),
    )
    .await;

    for peer in [&mut carol_peer, &mut bob_peer, &mut dave_peer] {
        let delivered = next_envelope(peer).await;
        assert_eq!(delivered["type"], "new_group_message");
        assert_eq!(delivered["data"]["group_id"], group.to_string());
    }
    assert_eq!(next_envelope(&mut alice_peer).await["type"], "message_sent");

    // Exactly once per member, sender excluded
    assert_silent(&mut alice_peer).await;
    assert_silent(&mut carol_peer).await;
    assert_silent(&mut bob_peer).await;
}

#[tokio::test]
async fn test_unknown_type_keeps_connection() {
    let cluster = Cluster::new();
    let bus = Arc::new(MemoryBus::new());
    let a = cluster.node("node-a", &bus).await;

    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    cluster.store.add_friendship(alice, bob);
    let mut alice_peer = connect(&a, alice).await;
    let mut bob_peer = connect(&a, bob).await;

    send(&mut alice_peer, "self_destruct", json!({"now": true})).await;
    assert_silent(&mut alice_peer).await;
    assert_eq!(cluster.store.calls(), 0);

    // Still usable afterwards
    send(
        &mut alice_peer,
        "send_p2p_message",
        json!({"receiver_id": bob, "content": "still here"}),
    )
    .await;
    assert_eq!(next_envelope(&mut bob_peer).await["type"], "new_p2p_message");
    assert!(a.hub.is_local(alice));
}

#[tokio::test]
async fn test_durability_event_published_after_acceptance() {
    let cluster = Cluster::new();
    let bus = Arc::new(MemoryBus::new());
    let a = cluster.node("node-a", &bus).await;

    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    cluster.store.add_friendship(alice, bob);
    let mut alice_peer = connect(&a, alice).await;

    send(
        &mut alice_peer,
        "send_p2p_message",
        json!({"receiver_id": bob, "content": "keep me"}),
    )
    .await;
    let ack = next_envelope(&mut alice_peer).await;

    let mut records = Vec::new();
    for _ in 0..50 {
        records = cluster.sink.records();
        if !records.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].topic, "chat.p2p");

    let event: Value = serde_json::from_slice(&records[0].payload).unwrap();
    assert_eq!(event["type"], "p2p_message");
    assert_eq!(event["data"]["id"], ack["data"]["id"]);
}

#[tokio::test]
async fn test_reconnect_to_other_node_moves_presence() {
    let cluster = Cluster::new();
    let bus = Arc::new(MemoryBus::new());
    let a = cluster.node("node-a", &bus).await;
    let b = cluster.node("node-b", &bus).await;

    let user = Uuid::new_v4();
    let mut first = connect(&a, user).await;
    let _second = connect(&b, user).await;

    // The old connection goes away after the new one registered elsewhere
    first.send(WireMessage::Close).await.unwrap();
    while first.recv().await.is_some() {}
    a.hub.barrier().await;

    assert!(!a.hub.is_local(user));
    assert!(b.hub.is_local(user));
    assert_eq!(a.router.locate(user).await, switchboard_core::Route::Remote(NodeId::new("node-b")));
}
