//! Durability events handed to the message broker.

use crate::ids::unix_now;
use crate::message::{GroupMessage, P2PMessage};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Event name (and default topic key) of accepted point-to-point messages.
pub const P2P_MESSAGE: &str = "p2p_message";

/// Event name (and default topic key) of accepted group messages.
pub const GROUP_MESSAGE: &str = "group_message";

/// `{"type", "data", "timestamp"}` record published for every accepted message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurabilityEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    pub timestamp: i64,
}

impl DurabilityEvent {
    /// Create an event stamped with the current server time.
    #[must_use]
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: unix_now(),
        }
    }

    /// Event for an accepted point-to-point message.
    #[must_use]
    pub fn p2p(message: &P2PMessage) -> Self {
        Self::new(
            P2P_MESSAGE,
            json!({
                "id": message.id,
                "sender_id": message.sender_id,
                "receiver_id": message.receiver_id,
                "content": message.content,
                "content_type": message.content_type,
                "created_at": message.timestamp,
            }),
        )
    }

    /// Event for an accepted group message.
    #[must_use]
    pub fn group(message: &GroupMessage) -> Self {
        Self::new(
            GROUP_MESSAGE,
            json!({
                "id": message.id,
                "sender_id": message.sender_id,
                "group_id": message.group_id,
                "content": message.content,
                "content_type": message.content_type,
                "created_at": message.timestamp,
            }),
        )
    }
}
