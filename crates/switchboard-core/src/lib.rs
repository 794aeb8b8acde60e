//! # switchboard-core
//!
//! Connection hub, presence directory and message routing for the
//! Switchboard chat gateway.
//!
//! This crate provides the building blocks of one gateway node:
//!
//! - **Connection** - one authenticated client with its read/write pumps
//! - **Hub** - the node's registry of live connections, owned by one task
//! - **Presence** - distributed `user → node` directory
//! - **Bus** - cross-node pub/sub and the relay listeners
//! - **Events** - best-effort durability hand-off to a broker
//! - **Persistence** - the contract of the message service
//! - **Router** - decodes client envelopes and routes them
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  frames   ┌─────────┐  inbound  ┌────────────────┐
//! │ Connection │──────────▶│   Hub   │──────────▶│ MessageRouter  │
//! └────────────┘           └─────────┘           └────────────────┘
//!       ▲                    ▲     │                 │    │     │
//!       │ outbound queue     │     ▼                 │    │     ▼
//!       └────────────────────┘  Presence ◀───────────┘    │  EventPublisher
//!                              Directory                 ▼
//!                                             CrossNodeTransport ──▶ other nodes
//! ```

pub mod bus;
pub mod connection;
pub mod events;
pub mod hub;
pub mod message;
pub mod persistence;
pub mod presence;
pub mod relay;
pub mod router;

pub use bus::{BusError, CrossNodeTransport, MemoryBus, Subscription};
pub use connection::{Connection, ConnectionState, Identity, Outbound, PumpConfig};
pub use events::{DeliveryPolicy, EventError, EventPublisher, EventSink, MemorySink};
pub use hub::{Hub, HubConfig, HubLoop, HubStats, InboundHandler};
pub use message::UserMessage;
pub use persistence::{MemoryMessageStore, MessageService, PersistenceError};
pub use presence::{MemoryPresence, PresenceDirectory, PresenceError};
pub use relay::RelayListener;
pub use router::{MessageRouter, Route, RouterConfig, RouterSnapshot, RouterStats};
