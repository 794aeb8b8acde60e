//! # Switchboard Server
//!
//! Gateway node of a horizontally scalable chat backend.
//!
//! The binary in `main.rs` is a thin wrapper around [`handlers::run_server`];
//! the modules are public so integration tests can start a node on an
//! ephemeral port with in-memory collaborators.

pub mod auth;
pub mod config;
pub mod event_sink;
pub mod handlers;
pub mod message_service;
pub mod metrics;

#[cfg(feature = "redis")]
pub mod redis_store;

pub use crate::config::Config;
pub use crate::handlers::{app, run_server, serve, start, AppState, Services};
