//! Message service contract.
//!
//! The gateway never writes to storage itself. Every accepted message goes
//! through a [`MessageService`], which validates the request (friendship,
//! group membership), stores it and hands back the authoritative id and
//! timestamp.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use switchboard_protocol::{
    unix_now, GroupId, GroupMessage, MessageId, MessageReceipt, P2PMessage, SendGroupRequest,
    SendP2PRequest, UserId,
};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Persistence errors.
#[derive(Debug, Clone, Error)]
pub enum PersistenceError {
    /// The request was refused, e.g. the recipient is not a friend.
    #[error("Rejected: {0}")]
    Rejected(String),

    /// The referenced group or user does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The service could not be reached.
    #[error("Message service unavailable: {0}")]
    Unavailable(String),

    /// The service failed while storing the message.
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Storage and validation of chat messages.
#[async_trait]
pub trait MessageService: Send + Sync {
    /// Validate and store a point-to-point message.
    async fn send_p2p(&self, request: &SendP2PRequest) -> Result<MessageReceipt, PersistenceError>;

    /// Validate and store a group message.
    async fn send_group(
        &self,
        request: &SendGroupRequest,
    ) -> Result<MessageReceipt, PersistenceError>;

    /// Get the current members of a group.
    async fn group_members(&self, group: GroupId) -> Result<Vec<UserId>, PersistenceError>;
}

/// Identifier of a conversation.
pub type ConversationId = Uuid;

/// Per-conversation bookkeeping.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: ConversationId,
    pub last_message_id: MessageId,
    pub updated_at: i64,
    /// Unread count per participant.
    pub unread: HashMap<UserId, u32>,
}

impl Conversation {
    fn new(last_message_id: MessageId, participants: impl IntoIterator<Item = UserId>) -> Self {
        Self {
            id: Uuid::new_v4(),
            last_message_id,
            updated_at: unix_now(),
            unread: participants.into_iter().map(|user| (user, 0)).collect(),
        }
    }

    fn record(&mut self, message_id: MessageId, timestamp: i64, sender: UserId) {
        self.last_message_id = message_id;
        self.updated_at = timestamp;
        for (user, count) in &mut self.unread {
            if *user != sender {
                *count += 1;
            }
        }
    }

    /// Get the unread count of `user`.
    #[must_use]
    pub fn unread_for(&self, user: UserId) -> u32 {
        self.unread.get(&user).copied().unwrap_or(0)
    }
}

/// Key of a conversation: an ordered user pair or a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ConversationKey {
    Direct(UserId, UserId),
    Group(GroupId),
}

impl ConversationKey {
    fn direct(a: UserId, b: UserId) -> Self {
        if a <= b {
            ConversationKey::Direct(a, b)
        } else {
            ConversationKey::Direct(b, a)
        }
    }
}

/// In-process message service.
///
/// Backs single-node deployments without an external message service, and
/// tests. Can be switched into a failing mode to exercise error paths.
#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    friends: DashMap<UserId, HashSet<UserId>>,
    groups: DashMap<GroupId, Vec<UserId>>,
    direct_log: Mutex<Vec<P2PMessage>>,
    group_log: Mutex<Vec<GroupMessage>>,
    conversations: DashMap<ConversationKey, Conversation>,
    failure: Mutex<Option<PersistenceError>>,
    calls: AtomicUsize,
}

impl MemoryMessageStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `a` and `b` friends of each other.
    pub fn add_friendship(&self, a: UserId, b: UserId) {
        self.friends.entry(a).or_default().insert(b);
        self.friends.entry(b).or_default().insert(a);
    }

    /// Create or replace a group.
    pub fn add_group(&self, group: GroupId, members: Vec<UserId>) {
        self.groups.insert(group, members);
    }

    /// Fail every subsequent send with `error`, or recover with `None`.
    pub fn set_failure(&self, error: Option<PersistenceError>) {
        if let Ok(mut failure) = self.failure.lock() {
            *failure = error;
        }
    }

    /// Get the number of send calls made so far, successful or not.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    /// Get every stored point-to-point message, oldest first.
    #[must_use]
    pub fn direct_messages(&self) -> Vec<P2PMessage> {
        self.direct_log
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    /// Get every stored group message, oldest first.
    #[must_use]
    pub fn group_messages(&self) -> Vec<GroupMessage> {
        self.group_log
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    /// Get the conversation between `a` and `b`.
    #[must_use]
    pub fn direct_conversation(&self, a: UserId, b: UserId) -> Option<Conversation> {
        self.conversations
            .get(&ConversationKey::direct(a, b))
            .map(|c| c.clone())
    }

    /// Get the conversation of a group.
    #[must_use]
    pub fn group_conversation(&self, group: GroupId) -> Option<Conversation> {
        self.conversations
            .get(&ConversationKey::Group(group))
            .map(|c| c.clone())
    }

    fn begin_call(&self) -> Result<(), PersistenceError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let failure = self
            .failure
            .lock()
            .map_err(|_| PersistenceError::Storage("store poisoned".into()))?;
        match failure.as_ref() {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn are_friends(&self, a: UserId, b: UserId) -> bool {
        self.friends
            .get(&a)
            .map(|friends| friends.contains(&b))
            .unwrap_or(false)
    }
}

#[async_trait]
impl MessageService for MemoryMessageStore {
    async fn send_p2p(&self, request: &SendP2PRequest) -> Result<MessageReceipt, PersistenceError> {
        self.begin_call()?;
        if !self.are_friends(request.sender_id, request.receiver_id) {
            return Err(PersistenceError::Rejected(
                "recipient is not a friend of the sender".into(),
            ));
        }

        let receipt = MessageReceipt {
            id: Uuid::new_v4(),
            timestamp: unix_now(),
        };
        let message = P2PMessage::accepted(request, receipt);

        self.conversations
            .entry(ConversationKey::direct(request.sender_id, request.receiver_id))
            .or_insert_with(|| {
                Conversation::new(receipt.id, [request.sender_id, request.receiver_id])
            })
            .record(receipt.id, receipt.timestamp, request.sender_id);

        self.direct_log
            .lock()
            .map_err(|_| PersistenceError::Storage("store poisoned".into()))?
            .push(message);

        debug!(id = %receipt.id, sender = %request.sender_id, "Stored p2p message");
        Ok(receipt)
    }

    async fn send_group(
        &self,
        request: &SendGroupRequest,
    ) -> Result<MessageReceipt, PersistenceError> {
        self.begin_call()?;
        let members = self
            .groups
            .get(&request.group_id)
            .map(|m| m.clone())
            .ok_or_else(|| PersistenceError::NotFound(format!("group {}", request.group_id)))?;
        if !members.contains(&request.sender_id) {
            return Err(PersistenceError::Rejected(
                "sender is not a member of the group".into(),
            ));
        }

        let receipt = MessageReceipt {
            id: Uuid::new_v4(),
            timestamp: unix_now(),
        };
        let message = GroupMessage::accepted(request, receipt);

        self.conversations
            .entry(ConversationKey::Group(request.group_id))
            .or_insert_with(|| Conversation::new(receipt.id, members.iter().copied()))
            .record(receipt.id, receipt.timestamp, request.sender_id);

        self.group_log
            .lock()
            .map_err(|_| PersistenceError::Storage("store poisoned".into()))?
            .push(message);

        debug!(id = %receipt.id, group = %request.group_id, "Stored group message");
        Ok(receipt)
    }

    async fn group_members(&self, group: GroupId) -> Result<Vec<UserId>, PersistenceError> {
        self.groups
            .get(&group)
            .map(|m| m.clone())
            .ok_or_else(|| PersistenceError::NotFound(format!("group {group}")))
    }
}
