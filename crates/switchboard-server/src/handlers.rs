//! HTTP and WebSocket handlers for the Switchboard server.
//!
//! This module wires the node together (backends, hub, router, relay
//! listeners) and serves the upgrade endpoint plus a small HTTP API.

use crate::auth::{authenticate_within, Authenticator, HeaderAuthenticator};
use crate::config::{Config, PresenceBackend};
use crate::event_sink::HttpEventSink;
use crate::message_service::HttpMessageService;
use crate::metrics::{self, ConnectionMetricsGuard, MeteredSink};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use switchboard_core::{
    connection, CrossNodeTransport, EventPublisher, Hub, Identity, InboundHandler, MemoryBus,
    MemoryMessageStore, MemoryPresence, MessageRouter, MessageService, PresenceDirectory,
    RelayListener,
};
use switchboard_protocol::{codec, OutboundEnvelope};
use switchboard_transport::split_websocket;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// External collaborators of one node.
pub struct Services {
    pub presence: Arc<dyn PresenceDirectory>,
    pub bus: Arc<dyn CrossNodeTransport>,
    pub messages: Arc<dyn MessageService>,
    pub events: EventPublisher,
    pub authenticator: Arc<dyn Authenticator>,
}

impl Services {
    /// Build the collaborators named by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if a backend cannot be reached or configured.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let (presence, bus) = presence_backend(config).await?;

        let messages: Arc<dyn MessageService> = match &config.message_service.url {
            Some(url) => {
                info!(url = %url, "Using HTTP message service");
                Arc::new(HttpMessageService::new(
                    url.as_str(),
                    std::time::Duration::from_millis(config.message_service.timeout_ms),
                )?)
            }
            None => {
                warn!("No message service configured, using the in-memory store");
                Arc::new(MemoryMessageStore::new())
            }
        };

        let events = if config.events.enabled {
            let sink = HttpEventSink::new(
                config.events.endpoint.as_str(),
                std::time::Duration::from_millis(config.events.timeout_ms),
            )?;
            info!(endpoint = %config.events.endpoint, "Durability events enabled");
            EventPublisher::new(
                Arc::new(MeteredSink::new(Arc::new(sink))),
                config.events.topics.clone(),
                config.delivery_policy(),
            )
        } else {
            EventPublisher::disabled()
        };

        Ok(Self {
            presence,
            bus,
            messages,
            events,
            authenticator: Arc::new(HeaderAuthenticator),
        })
    }

    /// Single-node collaborators backed by `messages`.
    #[must_use]
    pub fn in_memory(config: &Config, messages: Arc<dyn MessageService>) -> Self {
        Self {
            presence: Arc::new(memory_presence(config)),
            bus: Arc::new(MemoryBus::new()),
            messages,
            events: EventPublisher::disabled(),
            authenticator: Arc::new(HeaderAuthenticator),
        }
    }
}

fn memory_presence(config: &Config) -> MemoryPresence {
    config
        .presence_lease()
        .map_or_else(MemoryPresence::new, MemoryPresence::with_lease)
}

async fn presence_backend(
    config: &Config,
) -> Result<(Arc<dyn PresenceDirectory>, Arc<dyn CrossNodeTransport>)> {
    match config.presence.backend {
        PresenceBackend::Memory => {
            info!("Using in-memory presence, this node cannot join a cluster");
            Ok((Arc::new(memory_presence(config)), Arc::new(MemoryBus::new())))
        }
        #[cfg(feature = "redis")]
        PresenceBackend::Redis => {
            use crate::redis_store::{connect, RedisBus, RedisPresence};

            let (client, conn) = connect(&config.presence.redis_url)
                .await
                .context("Failed to connect to Redis")?;
            Ok((
                Arc::new(RedisPresence::new(conn.clone(), config.presence_lease())),
                Arc::new(RedisBus::new(client, conn)),
            ))
        }
        #[cfg(not(feature = "redis"))]
        PresenceBackend::Redis => {
            anyhow::bail!("presence.backend = \"redis\" requires the `redis` feature")
        }
    }
}

/// Shared server state.
pub struct AppState {
    /// Live connections of this node.
    pub hub: Arc<Hub>,
    /// Inbound message router.
    pub router: Arc<MessageRouter>,
    /// Server configuration.
    pub config: Config,
    authenticator: Arc<dyn Authenticator>,
}

/// Start the node's background tasks and return the state the routes share.
///
/// Everything spawned here stops when `shutdown` is cancelled.
///
/// # Errors
///
/// Returns an error if the relay subscriptions cannot be made.
pub async fn start(
    config: Config,
    services: Services,
    shutdown: &CancellationToken,
) -> Result<Arc<AppState>> {
    let node_id = config.node_id();
    info!(node = %node_id, "Starting gateway node");

    let (hub, hub_loop) = Hub::new(
        node_id,
        Arc::clone(&services.presence),
        config.hub_config(),
    );
    let router = Arc::new(MessageRouter::new(
        Arc::clone(&hub),
        services.presence,
        Arc::clone(&services.bus),
        services.messages,
        services.events,
        config.router_config(),
    ));

    let handler: Arc<dyn InboundHandler> = router.clone();
    tokio::spawn(hub_loop.run(handler, shutdown.clone()));

    let listener = RelayListener::subscribe(Arc::clone(&hub), services.bus.as_ref())
        .await
        .context("Failed to subscribe relay channels")?;
    let _relays = listener.spawn(shutdown.clone());

    metrics::spawn_stats_exporter(Arc::clone(&hub), Arc::clone(&router), shutdown.clone());

    Ok(Arc::new(AppState {
        hub,
        router,
        config,
        authenticator: services.authenticator,
    }))
}

/// Build the HTTP routes.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/api/v1/online-users", get(online_users_handler))
        .route("/api/v1/broadcast", post(broadcast_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Serve `state` on `listener` until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> Result<()> {
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config, shutdown: CancellationToken) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let services = Services::from_config(&config).await?;
    let addr = config.bind_addr()?;
    let ws_path = config.transport.websocket_path.clone();
    let state = start(config, services, &shutdown).await?;

    let listener = TcpListener::bind(addr).await?;
    info!("Switchboard server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, ws_path);

    serve(listener, state, shutdown).await
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "node_id": state.hub.node_id(),
        "connections": state.hub.connection_count(),
    }))
}

/// Users registered on this node.
async fn online_users_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({ "online_users": state.hub.online_users() }))
}

#[derive(Debug, Deserialize)]
struct BroadcastRequest {
    content: String,
}

/// Send a system announcement to every connection of this node.
async fn broadcast_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BroadcastRequest>,
) -> Response {
    match codec::encode(&OutboundEnvelope::broadcast(request.content)) {
        Ok(frame) => {
            state.hub.broadcast(frame);
            StatusCode::ACCEPTED.into_response()
        }
        Err(e) => {
            metrics::record_error("encode");
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let identity = match authenticate_within(
        state.authenticator.as_ref(),
        &headers,
        state.config.handshake_timeout(),
    )
    .await
    {
        Ok(identity) => identity,
        Err(e) => {
            debug!(error = %e, "Upgrade rejected");
            metrics::record_error("auth");
            return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
        }
    };

    // Oversized frames are refused while reading, before they are buffered
    let limit = state.config.transport.max_message_size;
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| handle_websocket(socket, identity, state))
}

/// Drive an upgraded socket until both pumps are done.
async fn handle_websocket(socket: WebSocket, identity: Identity, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let pumps = state.config.pump_config();
    let (reader, writer) = split_websocket(socket, pumps.max_message_size);
    let connection = connection::spawn(&state.hub, identity, reader, writer, pumps);
    debug!(connection = connection.id(), user = %connection.user_id(), "WebSocket connected");

    connection.closing().cancelled().await;
    debug!(connection = connection.id(), user = %connection.user_id(), "WebSocket disconnected");
}
