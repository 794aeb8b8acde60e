//! Redis-backed presence directory and cross-node bus.
//!
//! Every gateway node of a cluster points at the same Redis. Presence lives
//! under `user_location:<user>` (leased with `PX` and extended only by the
//! node the record names), membership snapshots
//! under `group_member_by_id:<group>` as a JSON array, and relay frames
//! travel over Redis pub/sub.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, Script};
use std::time::Duration;
use switchboard_core::{BusError, CrossNodeTransport, PresenceDirectory, PresenceError, Subscription};
use switchboard_protocol::{keys, GroupId, NodeId, UserId};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Delete a key only while it still holds the expected value.
const DELETE_IF_OWNER: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// Extend a key's lease only while it still holds the expected value.
const EXPIRE_IF_OWNER: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
end
return 0
"#;

fn backend(e: RedisError) -> PresenceError {
    PresenceError::Backend(e.to_string())
}

/// Open a client and a multiplexed, auto-reconnecting connection.
///
/// # Errors
///
/// Returns an error if the URL is invalid or the first connection fails.
pub async fn connect(url: &str) -> Result<(Client, ConnectionManager), RedisError> {
    let client = Client::open(url)?;
    let manager = ConnectionManager::new(client.clone()).await?;
    info!(url = %url, "Connected to Redis");
    Ok((client, manager))
}

/// Presence directory stored in Redis.
#[derive(Clone)]
pub struct RedisPresence {
    conn: ConnectionManager,
    lease: Option<Duration>,
    delete_if_owner: Script,
}

impl RedisPresence {
    /// Create a directory over `conn`. Records expire after `lease`, if set.
    #[must_use]
    pub fn new(conn: ConnectionManager, lease: Option<Duration>) -> Self {
        Self {
            conn,
            lease,
            delete_if_owner: Script::new(DELETE_IF_OWNER),
        }
    }

    fn lease_ms(&self) -> Option<u64> {
        self.lease
            .map(|lease| u64::try_from(lease.as_millis()).unwrap_or(u64::MAX))
    }
}

#[async_trait]
impl PresenceDirectory for RedisPresence {
    async fn set_location(&self, user: UserId, node: &NodeId) -> Result<(), PresenceError> {
        let mut conn = self.conn.clone();
        let key = keys::user_location(&user);
        match self.lease_ms() {
            Some(ms) => {
                let _: () = conn.pset_ex(&key, node.as_str(), ms).await.map_err(backend)?;
            }
            None => {
                let _: () = conn.set(&key, node.as_str()).await.map_err(backend)?;
            }
        }
        trace!(user = %user, node = %node, "Presence: set location");
        Ok(())
    }

    async fn get_location(&self, user: UserId) -> Result<NodeId, PresenceError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn
            .get(keys::user_location(&user))
            .await
            .map_err(backend)?;
        value.map(NodeId::new).ok_or(PresenceError::NotFound)
    }

    async fn delete_location(&self, user: UserId, node: &NodeId) -> Result<bool, PresenceError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .delete_if_owner
            .key(keys::user_location(&user))
            .arg(node.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        if deleted > 0 {
            trace!(user = %user, node = %node, "Presence: deleted location");
        }
        Ok(deleted > 0)
    }

    async fn set_members(&self, group: GroupId, members: &[UserId]) -> Result<(), PresenceError> {
        let mut conn = self.conn.clone();
        let encoded =
            serde_json::to_string(members).map_err(|e| PresenceError::Malformed(e.to_string()))?;
        let _: () = conn
            .set(keys::group_members(&group), encoded)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn get_members(&self, group: GroupId) -> Result<Vec<UserId>, PresenceError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn
            .get(keys::group_members(&group))
            .await
            .map_err(backend)?;
        let raw = value.ok_or(PresenceError::NotFound)?;
        decode_members(&raw)
    }

    async fn refresh_locations(&self, users: &[UserId], node: &NodeId) -> Result<(), PresenceError> {
        // Records without a lease never need extending
        let Some(ms) = self.lease_ms() else {
            return Ok(());
        };
        if users.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for user in users {
            pipe.cmd("EVAL")
                .arg(EXPIRE_IF_OWNER)
                .arg(1)
                .arg(keys::user_location(user))
                .arg(node.as_str())
                .arg(ms);
        }
        let extended: Vec<i64> = pipe.query_async(&mut conn).await.map_err(backend)?;
        let extended = extended.iter().filter(|r| **r > 0).count();
        debug!(count = users.len(), extended, node = %node, "Presence leases refreshed");
        Ok(())
    }
}

fn decode_members(raw: &str) -> Result<Vec<UserId>, PresenceError> {
    serde_json::from_str(raw).map_err(|e| PresenceError::Malformed(e.to_string()))
}

impl std::fmt::Debug for RedisPresence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisPresence")
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

/// Cross-node bus over Redis pub/sub.
#[derive(Clone)]
pub struct RedisBus {
    client: Client,
    conn: ConnectionManager,
}

impl RedisBus {
    /// Create a bus. Publishing shares `conn`; each subscription opens its
    /// own pub/sub connection from `client`.
    #[must_use]
    pub fn new(client: Client, conn: ConnectionManager) -> Self {
        Self { client, conn }
    }
}

#[async_trait]
impl CrossNodeTransport for RedisBus {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize, BusError> {
        let mut conn = self.conn.clone();
        let receivers: i64 = conn
            .publish(channel, payload.as_ref())
            .await
            .map_err(|e| BusError::Backend(e.to_string()))?;
        trace!(channel = %channel, receivers, "Bus publish");
        Ok(usize::try_from(receivers).unwrap_or_default())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BusError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BusError::Backend(e.to_string()))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| BusError::Backend(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let name = channel.to_string();
        let forwarder = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload = Bytes::copy_from_slice(msg.get_payload_bytes());
                if tx.send(payload).is_err() {
                    break; // Subscription dropped
                }
            }
            warn!(channel = %name, "Redis subscription ended");
        });

        Ok(Subscription::new(channel, rx, Some(forwarder)))
    }
}

impl std::fmt::Debug for RedisBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBus").finish_non_exhaustive()
    }
}
