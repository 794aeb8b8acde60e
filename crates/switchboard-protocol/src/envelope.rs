//! Client envelopes.
//!
//! Every frame exchanged with a client is a JSON envelope. Inbound envelopes
//! carry a `type` tag and an opaque `data` object; the tag selects the schema
//! `data` is decoded with. Outbound envelopes add the server timestamp.

use crate::codec::ProtocolError;
use crate::ids::{unix_now, NodeId, UserId};
use crate::message::{
    GroupMessage, MessageReceipt, P2PMessage, ReadReceipt, SendGroupRequest, SendP2PRequest,
    TypingRequest,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Envelope type tags.
pub mod kind {
    // Inbound
    pub const SEND_P2P_MESSAGE: &str = "send_p2p_message";
    pub const SEND_GROUP_MESSAGE: &str = "send_group_message";
    pub const TYPING: &str = "typing";
    pub const READ_RECEIPT: &str = "read_receipt";

    // Outbound
    pub const CONNECTION_ESTABLISHED: &str = "connection_established";
    pub const NEW_P2P_MESSAGE: &str = "new_p2p_message";
    pub const NEW_GROUP_MESSAGE: &str = "new_group_message";
    pub const MESSAGE_SENT: &str = "message_sent";
    pub const TYPING_INDICATOR: &str = "typing_indicator";
    pub const BROADCAST: &str = "broadcast";
    pub const ERROR: &str = "error";
}

/// An envelope received from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEnvelope {
    /// Type tag.
    #[serde(rename = "type")]
    pub kind: String,
    /// Type-specific payload, decoded only once the tag is known.
    #[serde(default)]
    pub data: Value,
}

impl InboundEnvelope {
    /// Create an inbound envelope.
    #[must_use]
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }
}

/// A decoded client request.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    SendP2P(SendP2PRequest),
    SendGroup(SendGroupRequest),
    Typing(TypingRequest),
    ReadReceipt(ReadReceipt),
    /// A tag this server does not understand. Callers drop it.
    Unknown(String),
}

impl ClientRequest {
    /// Decode the payload of an envelope according to its tag.
    ///
    /// Unrecognized tags are not an error; they yield [`ClientRequest::Unknown`].
    ///
    /// # Errors
    ///
    /// Returns an error if the tag is known but the payload does not match it.
    pub fn from_envelope(envelope: InboundEnvelope) -> Result<Self, ProtocolError> {
        let InboundEnvelope { kind, data } = envelope;
        let request = match kind.as_str() {
            kind::SEND_P2P_MESSAGE => Self::SendP2P(payload(&kind, data)?),
            kind::SEND_GROUP_MESSAGE => Self::SendGroup(payload(&kind, data)?),
            kind::TYPING => Self::Typing(payload(&kind, data)?),
            kind::READ_RECEIPT => {
                let receipt = if data.is_null() {
                    ReadReceipt::default()
                } else {
                    payload(&kind, data)?
                };
                Self::ReadReceipt(receipt)
            }
            _ => Self::Unknown(kind),
        };
        Ok(request)
    }

    /// The wire tag of this request.
    #[must_use]
    pub fn tag(&self) -> &str {
        match self {
            Self::SendP2P(_) => kind::SEND_P2P_MESSAGE,
            Self::SendGroup(_) => kind::SEND_GROUP_MESSAGE,
            Self::Typing(_) => kind::TYPING,
            Self::ReadReceipt(_) => kind::READ_RECEIPT,
            Self::Unknown(tag) => tag,
        }
    }
}

fn payload<T: serde::de::DeserializeOwned>(kind: &str, data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|source| ProtocolError::Payload {
        kind: kind.to_string(),
        source,
    })
}

/// An envelope sent to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEnvelope {
    /// Type tag.
    #[serde(rename = "type")]
    pub kind: String,
    /// Type-specific payload.
    pub data: Value,
    /// Server generation time in unix seconds.
    pub timestamp: i64,
}

impl OutboundEnvelope {
    /// Create an envelope stamped with the current server time.
    #[must_use]
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: unix_now(),
        }
    }

    /// Sent once a connection is registered.
    #[must_use]
    pub fn connection_established(user_id: UserId, node_id: &NodeId) -> Self {
        Self::new(
            kind::CONNECTION_ESTABLISHED,
            json!({ "user_id": user_id, "node_id": node_id }),
        )
    }

    /// Delivers a point-to-point message to its recipient.
    #[must_use]
    pub fn new_p2p_message(message: &P2PMessage) -> Self {
        Self::new(
            kind::NEW_P2P_MESSAGE,
            json!({
                "id": message.id,
                "sender_id": message.sender_id,
                "receiver_id": message.receiver_id,
                "content": message.content,
                "content_type": message.content_type,
                "timestamp": message.timestamp,
            }),
        )
    }

    /// Delivers a group message to one member.
    #[must_use]
    pub fn new_group_message(message: &GroupMessage) -> Self {
        Self::new(
            kind::NEW_GROUP_MESSAGE,
            json!({
                "id": message.id,
                "sender_id": message.sender_id,
                "group_id": message.group_id,
                "content": message.content,
                "content_type": message.content_type,
                "timestamp": message.timestamp,
            }),
        )
    }

    /// Acknowledges an accepted message to its sender.
    #[must_use]
    pub fn message_sent(receipt: &MessageReceipt) -> Self {
        Self::new(
            kind::MESSAGE_SENT,
            json!({
                "id": receipt.id,
                "success": true,
                "timestamp": receipt.timestamp,
            }),
        )
    }

    /// Tells `receiver` that `sender` started or stopped typing.
    #[must_use]
    pub fn typing_indicator(sender: UserId, is_typing: bool) -> Self {
        Self::new(
            kind::TYPING_INDICATOR,
            json!({ "user_id": sender, "is_typing": is_typing }),
        )
    }

    /// A system announcement sent to every connection.
    #[must_use]
    pub fn broadcast(content: impl Into<String>) -> Self {
        Self::new(kind::BROADCAST, json!({ "content": content.into() }))
    }

    /// Reports a failed request back to its sender.
    #[must_use]
    pub fn error(message: impl Into<String>, cause: impl Into<String>) -> Self {
        Self::new(
            kind::ERROR,
            json!({ "message": message.into(), "error": cause.into() }),
        )
    }

    /// Whether this envelope has the given tag.
    #[must_use]
    pub fn is(&self, tag: &str) -> bool {
        self.kind == tag
    }
}
