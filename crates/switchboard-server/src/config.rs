//! Server configuration.
//!
//! Configuration is layered, later sources overriding earlier ones:
//! - Built-in defaults
//! - TOML configuration file (`SWITCHBOARD_CONFIG`, or the first of the
//!   default paths that exists)
//! - Environment variables (`SWITCHBOARD_PORT`, `SWITCHBOARD_HEARTBEAT__INTERVAL_MS`, ...)

use anyhow::{bail, Context, Result};
use ::config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use switchboard_core::{DeliveryPolicy, HubConfig, PumpConfig, RouterConfig};
use switchboard_protocol::{event, NodeId};

/// Default configuration file locations, in lookup order.
const CONFIG_PATHS: [&str; 3] = [
    "switchboard.toml",
    "/etc/switchboard/switchboard.toml",
    "~/.config/switchboard/switchboard.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Node identity.
    #[serde(default)]
    pub node: NodeConfig,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Hub configuration.
    #[serde(default)]
    pub hub: HubSettings,

    /// Presence directory and cross-node bus.
    #[serde(default)]
    pub presence: PresenceConfig,

    /// Durability events.
    #[serde(default)]
    pub events: EventsConfig,

    /// Message service.
    #[serde(default)]
    pub message_service: MessageServiceConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Node identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Stable node id. Generated at startup if unset.
    #[serde(default)]
    pub id: Option<String>,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Deadline for authenticating an upgrade request, in milliseconds.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Ping interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Idle read timeout in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,

    /// Single write deadline in milliseconds.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
}

/// Hub configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSettings {
    /// Outbound queue capacity per connection.
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,

    /// Number of inbound dispatch workers.
    #[serde(default = "default_dispatch_workers")]
    pub dispatch_workers: usize,

    /// Inbound queue capacity per dispatch worker. A full queue stalls the
    /// reading connection.
    #[serde(default = "default_inbound_queue_capacity")]
    pub inbound_queue_capacity: usize,
}

/// Which store backs presence and the cross-node bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceBackend {
    /// In-process; single node only.
    #[default]
    Memory,
    /// Shared Redis; needed for more than one node.
    Redis,
}

/// Presence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    #[serde(default)]
    pub backend: PresenceBackend,

    /// Redis connection URL.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Presence record lease in milliseconds. 0 disables expiry.
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_ms: u64,

    /// Lease refresh interval in milliseconds. 0 disables refreshing.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_ms: u64,

    /// Deadline of a single presence call in milliseconds.
    #[serde(default = "default_op_timeout")]
    pub op_timeout_ms: u64,
}

/// Delivery policy name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    #[default]
    AtMostOnce,
    Retry,
}

/// Durability event configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Publish durability events.
    #[serde(default)]
    pub enabled: bool,

    /// Base URL of the broker's REST proxy.
    #[serde(default = "default_events_endpoint")]
    pub endpoint: String,

    /// Event type to topic.
    #[serde(default = "default_topics")]
    pub topics: HashMap<String, String>,

    #[serde(default)]
    pub policy: PolicyKind,

    /// Attempts per event under the retry policy.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Deadline of a single publish request in milliseconds.
    #[serde(default = "default_events_timeout")]
    pub timeout_ms: u64,
}

/// Message service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageServiceConfig {
    /// Base URL of the message service. In-memory store if unset.
    #[serde(default)]
    pub url: Option<String>,

    /// Request deadline in milliseconds.
    #[serde(default = "default_message_service_timeout")]
    pub timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_handshake_timeout() -> u64 {
    45_000
}

fn default_heartbeat_interval() -> u64 {
    54_000 // 9/10 of the idle timeout
}

fn default_heartbeat_timeout() -> u64 {
    60_000
}

fn default_write_timeout() -> u64 {
    10_000
}

fn default_send_queue_capacity() -> usize {
    256
}

fn default_dispatch_workers() -> usize {
    8
}

fn default_inbound_queue_capacity() -> usize {
    128
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_lease_ttl() -> u64 {
    120_000
}

fn default_refresh_interval() -> u64 {
    40_000
}

fn default_op_timeout() -> u64 {
    3_000
}

fn default_events_endpoint() -> String {
    "http://127.0.0.1:8082".to_string()
}

fn default_topics() -> HashMap<String, String> {
    [event::P2P_MESSAGE, event::GROUP_MESSAGE]
        .into_iter()
        .map(|name| (name.to_string(), name.to_string()))
        .collect()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    100
}

fn default_max_backoff() -> u64 {
    2_000
}

fn default_events_timeout() -> u64 {
    5_000
}

fn default_message_service_timeout() -> u64 {
    10_000
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            node: NodeConfig::default(),
            transport: TransportConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            hub: HubSettings::default(),
            presence: PresenceConfig::default(),
            events: EventsConfig::default(),
            message_service: MessageServiceConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            max_message_size: default_max_message_size(),
            handshake_timeout_ms: default_handshake_timeout(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
            write_timeout_ms: default_write_timeout(),
        }
    }
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            send_queue_capacity: default_send_queue_capacity(),
            dispatch_workers: default_dispatch_workers(),
            inbound_queue_capacity: default_inbound_queue_capacity(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            backend: PresenceBackend::default(),
            redis_url: default_redis_url(),
            lease_ttl_ms: default_lease_ttl(),
            refresh_interval_ms: default_refresh_interval(),
            op_timeout_ms: default_op_timeout(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_events_endpoint(),
            topics: default_topics(),
            policy: PolicyKind::default(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            timeout_ms: default_events_timeout(),
        }
    }
}

impl Default for MessageServiceConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: default_message_service_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from file, environment and defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or the
    /// result fails validation.
    pub fn load() -> Result<Self> {
        let explicit = std::env::var("SWITCHBOARD_CONFIG").ok();
        let file = match explicit {
            Some(path) => Some(shellexpand::tilde(&path).into_owned()),
            None => CONFIG_PATHS
                .iter()
                .map(|path| shellexpand::tilde(path).into_owned())
                .find(|path| Path::new(path).exists()),
        };

        let mut builder = ::config::Config::builder();
        if let Some(path) = &file {
            builder = builder.add_source(File::new(path, FileFormat::Toml).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("SWITCHBOARD")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .with_context(|| match &file {
                Some(path) => format!("Failed to load config from {path}"),
                None => "Failed to load config from environment".to_string(),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string, without environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed or fails validation.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = ::config::Config::builder()
            .add_source(File::from_str(contents, FileFormat::Toml))
            .build()
            .and_then(|c| c.try_deserialize())
            .context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat.interval_ms == 0 {
            bail!("heartbeat.interval_ms must be positive");
        }
        if self.heartbeat.write_timeout_ms == 0 {
            bail!("heartbeat.write_timeout_ms must be positive");
        }
        if self.heartbeat.interval_ms >= self.heartbeat.timeout_ms {
            bail!(
                "heartbeat.interval_ms ({}) must be less than heartbeat.timeout_ms ({})",
                self.heartbeat.interval_ms,
                self.heartbeat.timeout_ms
            );
        }
        if self.hub.send_queue_capacity == 0 {
            bail!("hub.send_queue_capacity must be positive");
        }
        if self.hub.dispatch_workers == 0 || self.hub.inbound_queue_capacity == 0 {
            bail!("hub.dispatch_workers and hub.inbound_queue_capacity must be positive");
        }
        if self.transport.max_message_size == 0 {
            bail!("transport.max_message_size must be positive");
        }
        if self.presence.lease_ttl_ms > 0 {
            // A lease nobody refreshes expires under every connected user
            if self.presence.refresh_interval_ms == 0 {
                bail!("presence.refresh_interval_ms must be positive when presence.lease_ttl_ms is set");
            }
            if self.presence.refresh_interval_ms >= self.presence.lease_ttl_ms {
                bail!("presence.refresh_interval_ms must be less than presence.lease_ttl_ms");
            }
        }
        if self.presence.backend == PresenceBackend::Redis && !cfg!(feature = "redis") {
            bail!("presence.backend = \"redis\" requires the `redis` feature");
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a valid address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    /// Get this node's id, generating one if none is configured.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node
            .id
            .as_ref()
            .map(NodeId::new)
            .unwrap_or_else(NodeId::generate)
    }

    /// Get the handshake deadline.
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.transport.handshake_timeout_ms)
    }

    /// Get the connection pump settings.
    #[must_use]
    pub fn pump_config(&self) -> PumpConfig {
        PumpConfig {
            idle_timeout: Duration::from_millis(self.heartbeat.timeout_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat.interval_ms),
            write_timeout: Duration::from_millis(self.heartbeat.write_timeout_ms),
            max_message_size: self.transport.max_message_size,
        }
    }

    /// Get the hub settings.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        let refresh = (self.presence.refresh_interval_ms > 0)
            .then(|| Duration::from_millis(self.presence.refresh_interval_ms));
        HubConfig {
            send_queue_capacity: self.hub.send_queue_capacity,
            dispatch_workers: self.hub.dispatch_workers,
            inbound_queue_capacity: self.hub.inbound_queue_capacity,
            presence_refresh: refresh,
            presence_timeout: Duration::from_millis(self.presence.op_timeout_ms),
        }
    }

    /// Get the router settings.
    #[must_use]
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            persistence_timeout: Duration::from_millis(self.message_service.timeout_ms),
            presence_timeout: Duration::from_millis(self.presence.op_timeout_ms),
        }
    }

    /// Get the durability delivery policy.
    #[must_use]
    pub fn delivery_policy(&self) -> DeliveryPolicy {
        match self.events.policy {
            PolicyKind::AtMostOnce => DeliveryPolicy::AtMostOnce,
            PolicyKind::Retry => DeliveryPolicy::Retry {
                max_attempts: self.events.max_attempts,
                initial_backoff: Duration::from_millis(self.events.initial_backoff_ms),
                max_backoff: Duration::from_millis(self.events.max_backoff_ms),
            },
        }
    }

    /// Get the presence lease, if records expire.
    #[must_use]
    pub fn presence_lease(&self) -> Option<Duration> {
        (self.presence.lease_ttl_ms > 0).then(|| Duration::from_millis(self.presence.lease_ttl_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.presence.backend, PresenceBackend::Memory);
        assert!(!config.events.enabled);
        assert!(config.validate().is_ok());

        let pumps = config.pump_config();
        assert_eq!(pumps.idle_timeout, Duration::from_secs(60));
        assert_eq!(pumps.heartbeat_interval, Duration::from_secs(54));
        assert_eq!(pumps.write_timeout, Duration::from_secs(10));
        assert_eq!(config.handshake_timeout(), Duration::from_secs(45));
        assert_eq!(config.hub_config().send_queue_capacity, 256);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 8080);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [node]
            id = "gateway-7"

            [heartbeat]
            interval_ms = 20000
            timeout_ms = 30000

            [events]
            enabled = true
            policy = "retry"
            max_attempts = 5

            [events.topics]
            p2p_message = "chat.p2p"
        "#;

        let config = Config::from_toml(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.node_id(), NodeId::new("gateway-7"));
        assert_eq!(
            config.pump_config().heartbeat_interval,
            Duration::from_secs(20)
        );
        assert_eq!(config.events.topics["p2p_message"], "chat.p2p");
        assert!(matches!(
            config.delivery_policy(),
            DeliveryPolicy::Retry { max_attempts: 5, .. }
        ));
    }

    #[test]
    fn test_heartbeat_must_be_shorter_than_idle_timeout() {
        let toml_str = r#"
            [heartbeat]
            interval_ms = 60000
            timeout_ms = 60000
        "#;
        assert!(Config::from_toml(toml_str).is_err());
    }

    #[test]
    fn test_zero_refresh_disables_lease_refresh() {
        let toml_str = r#"
            [presence]
            lease_ttl_ms = 0
            refresh_interval_ms = 0
        "#;
        let config = Config::from_toml(toml_str).unwrap();
        assert!(config.hub_config().presence_refresh.is_none());
        assert!(config.presence_lease().is_none());
    }

    #[test]
    fn test_zero_heartbeat_interval_is_rejected() {
        let toml_str = r#"
            [heartbeat]
            interval_ms = 0
        "#;
        let err = Config::from_toml(toml_str).unwrap_err();
        assert!(err.to_string().contains("heartbeat.interval_ms"));
    }

    #[test]
    fn test_lease_without_refresh_is_rejected() {
        let toml_str = r#"
            [presence]
            lease_ttl_ms = 120000
            refresh_interval_ms = 0
        "#;
        let err = Config::from_toml(toml_str).unwrap_err();
        assert!(err.to_string().contains("refresh_interval_ms must be positive"));
    }

    #[test]
    fn test_inbound_queue_capacity() {
        let toml_str = r#"
            [hub]
            dispatch_workers = 2
            inbound_queue_capacity = 16
        "#;
        let hub = Config::from_toml(toml_str).unwrap().hub_config();
        assert_eq!(hub.dispatch_workers, 2);
        assert_eq!(hub.inbound_queue_capacity, 16);

        let toml_str = r#"
            [hub]
            inbound_queue_capacity = 0
        "#;
        assert!(Config::from_toml(toml_str).is_err());
    }

    #[test]
    fn test_generated_node_id() {
        let config = Config::default();
        assert!(config.node_id().as_str().starts_with("node-"));
    }
}
