//! Presence directory for Switchboard.
//!
//! The directory answers one question for the router: which node currently
//! holds the live connection of a user. It also caches group membership
//! snapshots so group fan-out does not hit the message service on every
//! message.
//!
//! Records are leased. A node extends the records of its registered users
//! on a timer; a node that dies stops refreshing and its records expire.
//! A refresh only extends records that still name the refreshing node, so a
//! stale node can never take a user back from the node it moved to.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use switchboard_protocol::{GroupId, NodeId, UserId};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Presence errors.
#[derive(Debug, Error)]
pub enum PresenceError {
    /// No record for the key. For a user this means "offline".
    #[error("Presence record not found")]
    NotFound,

    /// The backing store failed.
    #[error("Presence backend error: {0}")]
    Backend(String),

    /// A stored value could not be decoded.
    #[error("Malformed presence record: {0}")]
    Malformed(String),
}

/// Distributed `user → node` directory plus group membership cache.
#[async_trait]
pub trait PresenceDirectory: Send + Sync {
    /// Record that `user` is connected to `node`. Last writer wins.
    async fn set_location(&self, user: UserId, node: &NodeId) -> Result<(), PresenceError>;

    /// Look up the node holding `user`.
    ///
    /// Returns [`PresenceError::NotFound`] if the user is offline.
    async fn get_location(&self, user: UserId) -> Result<NodeId, PresenceError>;

    /// Delete the record of `user` if it still names `node`.
    ///
    /// Returns `true` if a record was removed.
    async fn delete_location(&self, user: UserId, node: &NodeId) -> Result<bool, PresenceError>;

    /// Store a membership snapshot for `group`.
    async fn set_members(&self, group: GroupId, members: &[UserId]) -> Result<(), PresenceError>;

    /// Read the membership snapshot of `group`.
    ///
    /// Returns [`PresenceError::NotFound`] if no snapshot is cached.
    async fn get_members(&self, group: GroupId) -> Result<Vec<UserId>, PresenceError>;

    /// Extend the lease of every user in `users` whose record still names
    /// `node`.
    ///
    /// Records that moved to another node or already expired are left alone.
    /// This default reads before it writes; stores with an atomic
    /// compare-and-expire should override it.
    async fn refresh_locations(&self, users: &[UserId], node: &NodeId) -> Result<(), PresenceError> {
        for user in users {
            match self.get_location(*user).await {
                Ok(current) if current == *node => self.set_location(*user, node).await?,
                Ok(_) | Err(PresenceError::NotFound) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Drop records whose lease has run out.
    ///
    /// Returns how many were removed. Stores that expire keys on their own
    /// keep the default no-op.
    async fn sweep_expired(&self) -> Result<usize, PresenceError> {
        Ok(0)
    }
}

/// A single location record.
#[derive(Debug, Clone)]
pub struct PresenceRecord {
    /// Node holding the connection.
    pub node: NodeId,
    /// When the record was last written.
    pub written_at: Instant,
    /// When the record stops counting, if leased.
    pub expires_at: Option<Instant>,
}

impl PresenceRecord {
    fn new(node: NodeId, lease: Option<Duration>) -> Self {
        let now = Instant::now();
        Self {
            node,
            written_at: now,
            expires_at: lease.map(|ttl| now + ttl),
        }
    }

    fn renew(&mut self, lease: Option<Duration>) {
        let now = Instant::now();
        self.written_at = now;
        self.expires_at = lease.map(|ttl| now + ttl);
    }

    /// Check if the lease has run out.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }
}

/// In-process presence directory.
///
/// Used by single-node deployments and shared between hubs in tests to
/// stand in for the external store.
#[derive(Debug, Default)]
pub struct MemoryPresence {
    locations: DashMap<UserId, PresenceRecord>,
    groups: DashMap<GroupId, Vec<UserId>>,
    lease: Option<Duration>,
}

impl MemoryPresence {
    /// Create a directory whose records never expire.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a directory whose records expire `lease` after their last write.
    ///
    /// A zero lease disables expiry.
    #[must_use]
    pub fn with_lease(lease: Duration) -> Self {
        Self {
            lease: (!lease.is_zero()).then_some(lease),
            ..Self::default()
        }
    }

    /// Get the number of live location records.
    #[must_use]
    pub fn location_count(&self) -> usize {
        self.locations.iter().filter(|r| !r.is_expired()).count()
    }

    /// Drop expired records.
    ///
    /// Returns the users whose records were removed.
    pub fn prune_expired(&self) -> Vec<UserId> {
        let expired: Vec<UserId> = self
            .locations
            .iter()
            .filter(|r| r.is_expired())
            .map(|r| *r.key())
            .collect();

        for user in &expired {
            self.locations.remove_if(user, |_, record| record.is_expired());
            debug!(user = %user, "Presence lease expired");
        }

        expired
    }
}

#[async_trait]
impl PresenceDirectory for MemoryPresence {
    async fn set_location(&self, user: UserId, node: &NodeId) -> Result<(), PresenceError> {
        trace!(user = %user, node = %node, "Presence: set location");
        self.locations
            .insert(user, PresenceRecord::new(node.clone(), self.lease));
        Ok(())
    }

    async fn get_location(&self, user: UserId) -> Result<NodeId, PresenceError> {
        match self.locations.get(&user) {
            Some(record) if !record.is_expired() => Ok(record.node.clone()),
            _ => Err(PresenceError::NotFound),
        }
    }

    async fn delete_location(&self, user: UserId, node: &NodeId) -> Result<bool, PresenceError> {
        let removed = self
            .locations
            .remove_if(&user, |_, record| record.node == *node)
            .is_some();
        if removed {
            trace!(user = %user, node = %node, "Presence: deleted location");
        }
        Ok(removed)
    }

    async fn set_members(&self, group: GroupId, members: &[UserId]) -> Result<(), PresenceError> {
        self.groups.insert(group, members.to_vec());
        Ok(())
    }

    async fn get_members(&self, group: GroupId) -> Result<Vec<UserId>, PresenceError> {
        self.groups
            .get(&group)
            .map(|members| members.clone())
            .ok_or(PresenceError::NotFound)
    }

    async fn refresh_locations(&self, users: &[UserId], node: &NodeId) -> Result<(), PresenceError> {
        let mut extended = 0usize;
        for user in users {
            if let Some(mut record) = self.locations.get_mut(user) {
                if record.node == *node && !record.is_expired() {
                    record.renew(self.lease);
                    extended += 1;
                }
            }
        }
        trace!(node = %node, extended, skipped = users.len() - extended, "Presence: refreshed");
        Ok(())
    }

    async fn sweep_expired(&self) -> Result<usize, PresenceError> {
        Ok(self.prune_expired().len())
    }
}
