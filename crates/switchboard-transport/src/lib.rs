//! # switchboard-transport
//!
//! Transport abstraction layer for the Switchboard gateway.
//!
//! A client connection is split into two halves, each driven by its own
//! task: a [`FrameReader`] consumed by the read pump and a [`FrameWriter`]
//! fed by the write pump. Implementations:
//!
//! - **WebSocket** - axum upgrades, used by the server
//! - **Memory** - in-process duplex pipe, used by tests and tooling
//!
//! ```rust,ignore
//! use switchboard_transport::{FrameReader, WireMessage};
//!
//! async fn drain(mut reader: impl FrameReader) {
//!     while let Ok(Some(msg)) = reader.recv().await {
//!         // hand msg to the hub
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{FrameReader, FrameWriter, TransportError, WireMessage};

#[cfg(feature = "websocket")]
pub use websocket::{split_websocket, WebSocketReader, WebSocketWriter};
