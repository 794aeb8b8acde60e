//! Request payloads and delivered-message records.

use crate::ids::{GroupId, MessageId, UserId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Payload of a `send_p2p_message` envelope.
///
/// `sender_id` is never trusted from the client; the router overwrites it
/// with the authenticated identity of the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendP2PRequest {
    /// Sender (implicit, set by the server).
    #[serde(default)]
    pub sender_id: UserId,
    /// Recipient.
    pub receiver_id: UserId,
    /// Message body.
    pub content: String,
    /// Application-defined content type (text, image, ...).
    #[serde(default)]
    pub content_type: i32,
}

/// Payload of a `send_group_message` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendGroupRequest {
    /// Sender (implicit, set by the server).
    #[serde(default)]
    pub sender_id: UserId,
    /// Target group.
    pub group_id: GroupId,
    /// Message body.
    pub content: String,
    /// Application-defined content type.
    #[serde(default)]
    pub content_type: i32,
}

/// Payload of a `typing` envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingRequest {
    /// User who should see the indicator.
    pub receiver_id: UserId,
    /// Whether the sender is currently typing.
    pub is_typing: bool,
}

/// Payload of a `read_receipt` envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    /// Conversation that was read.
    #[serde(default)]
    pub conversation_id: Option<Uuid>,
    /// Last message the reader has seen.
    #[serde(default)]
    pub message_id: Option<MessageId>,
}

/// Identity and time the persistence service assigned to an accepted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageReceipt {
    /// Server-assigned message id.
    pub id: MessageId,
    /// Acceptance time in unix seconds.
    pub timestamp: i64,
}

/// A point-to-point message as delivered to its recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct P2PMessage {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub content_type: i32,
    pub timestamp: i64,
}

impl P2PMessage {
    /// Combine an accepted request with its receipt.
    #[must_use]
    pub fn accepted(request: &SendP2PRequest, receipt: MessageReceipt) -> Self {
        Self {
            id: receipt.id,
            sender_id: request.sender_id,
            receiver_id: request.receiver_id,
            content: request.content.clone(),
            content_type: request.content_type,
            timestamp: receipt.timestamp,
        }
    }
}

/// A group message as delivered to each member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMessage {
    pub id: MessageId,
    pub sender_id: UserId,
    pub group_id: GroupId,
    pub content: String,
    pub content_type: i32,
    pub timestamp: i64,
}

impl GroupMessage {
    /// Combine an accepted request with its receipt.
    #[must_use]
    pub fn accepted(request: &SendGroupRequest, receipt: MessageReceipt) -> Self {
        Self {
            id: receipt.id,
            sender_id: request.sender_id,
            group_id: request.group_id,
            content: request.content.clone(),
            content_type: request.content_type,
            timestamp: receipt.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sender_defaults_to_nil_when_absent() {
        let receiver = Uuid::new_v4();
        let req: SendP2PRequest = serde_json::from_value(json!({
            "receiver_id": receiver,
            "content": "hi"
        }))
        .unwrap();
        assert!(req.sender_id.is_nil());
        assert_eq!(req.receiver_id, receiver);
        assert_eq!(req.content_type, 0);
    }

    #[test]
    fn test_accepted_message_carries_receipt() {
        let req = SendP2PRequest {
            sender_id: Uuid::new_v4(),
            receiver_id: Uuid::new_v4(),
            content: "hello".into(),
            content_type: 1,
        };
        let receipt = MessageReceipt {
            id: Uuid::new_v4(),
            timestamp: 1_700_000_000,
        };
        let msg = P2PMessage::accepted(&req, receipt);
        assert_eq!(msg.id, receipt.id);
        assert_eq!(msg.timestamp, receipt.timestamp);
        assert_eq!(msg.sender_id, req.sender_id);
        assert_eq!(msg.content, "hello");
    }

    #[test]
    fn test_read_receipt_accepts_empty_object() {
        let receipt: ReadReceipt = serde_json::from_value(json!({})).unwrap();
        assert_eq!(receipt, ReadReceipt::default());
    }
}
