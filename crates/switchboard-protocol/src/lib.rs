//! # switchboard-protocol
//!
//! Wire protocol definitions for the Switchboard chat gateway.
//!
//! Everything that crosses a process boundary is defined here: the JSON
//! envelopes exchanged with clients, the frames nodes relay to each other,
//! the durability events handed to the broker, and the key and channel
//! names used in the shared presence store.
//!
//! ## Envelopes
//!
//! Inbound envelopes are `{"type", "data"}`. The `type` tag is read first and
//! only then is `data` decoded into the matching request:
//!
//! ```rust
//! use switchboard_protocol::{codec, ClientRequest};
//!
//! let raw = br#"{"type":"typing","data":{"receiver_id":"6f1c1f6e-8d2e-4a53-9a5e-3b7d7e0f4c11","is_typing":true}}"#;
//! let envelope = codec::decode_envelope(raw).unwrap();
//! match ClientRequest::from_envelope(envelope).unwrap() {
//!     ClientRequest::Typing(typing) => assert!(typing.is_typing),
//!     other => panic!("unexpected request: {other:?}"),
//! }
//! ```

pub mod codec;
pub mod envelope;
pub mod event;
pub mod ids;
pub mod keys;
pub mod message;
pub mod relay;

pub use codec::{decode, decode_envelope, encode, ProtocolError};
pub use envelope::{kind, ClientRequest, InboundEnvelope, OutboundEnvelope};
pub use event::DurabilityEvent;
pub use ids::{unix_now, GroupId, MessageId, NodeId, UserId};
pub use message::{
    GroupMessage, MessageReceipt, P2PMessage, ReadReceipt, SendGroupRequest, SendP2PRequest,
    TypingRequest,
};
pub use relay::RelayFrame;
