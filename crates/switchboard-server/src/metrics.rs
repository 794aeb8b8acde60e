//! Metrics collection and export for Switchboard.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use async_trait::async_trait;
use bytes::Bytes;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::{EventError, EventSink, Hub, MessageRouter};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "switchboard_connections_total";
    pub const DISCONNECTIONS_TOTAL: &str = "switchboard_disconnections_total";
    pub const CONNECTIONS_ACTIVE: &str = "switchboard_connections_active";
    pub const FRAMES_TOTAL: &str = "switchboard_frames_total";
    pub const DELIVERIES_TOTAL: &str = "switchboard_deliveries_total";
    pub const EVICTIONS_TOTAL: &str = "switchboard_evictions_total";
    pub const PERSISTENCE_FAILURES_TOTAL: &str = "switchboard_persistence_failures_total";
    pub const EVENT_FAILURES_TOTAL: &str = "switchboard_event_failures_total";
    pub const ERRORS_TOTAL: &str = "switchboard_errors_total";
}

/// How often core statistics are copied into the exporter.
const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_counter!(
        names::DISCONNECTIONS_TOTAL,
        "Total number of closed connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of registered connections"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Application frames by direction");
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Routed deliveries by path (local, remote, offline)"
    );
    metrics::describe_counter!(
        names::EVICTIONS_TOTAL,
        "Connections closed for a full outbound queue or replaced"
    );
    metrics::describe_counter!(
        names::PERSISTENCE_FAILURES_TOTAL,
        "Messages the message service did not accept"
    );
    metrics::describe_counter!(
        names::EVENT_FAILURES_TOTAL,
        "Durability records the broker did not accept"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record an accepted upgrade.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
}

/// Record a closed upgrade.
pub fn record_disconnection() {
    counter!(names::DISCONNECTIONS_TOTAL).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type.to_string()).increment(1);
}

/// Copy hub and router statistics into the exporter until `shutdown`.
pub fn spawn_stats_exporter(
    hub: Arc<Hub>,
    router: Arc<MessageRouter>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STATS_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => export_stats(&hub, &router),
            }
        }
    })
}

fn export_stats(hub: &Hub, router: &MessageRouter) {
    let hub_stats = hub.stats();
    let routes = router.stats();

    gauge!(names::CONNECTIONS_ACTIVE).set(hub_stats.connections as f64);
    counter!(names::FRAMES_TOTAL, "direction" => "inbound").absolute(hub_stats.inbound_total);
    counter!(names::FRAMES_TOTAL, "direction" => "outbound").absolute(hub_stats.outbound_total);
    counter!(names::EVICTIONS_TOTAL).absolute(hub_stats.evictions_total);
    counter!(names::DELIVERIES_TOTAL, "path" => "local").absolute(routes.delivered_local);
    counter!(names::DELIVERIES_TOTAL, "path" => "remote").absolute(routes.relayed);
    counter!(names::DELIVERIES_TOTAL, "path" => "offline").absolute(routes.offline);
    counter!(names::PERSISTENCE_FAILURES_TOTAL).absolute(routes.persistence_failures);
}

/// Guard for tracking one upgraded socket's lifetime.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

/// Event sink wrapper counting broker failures.
pub struct MeteredSink {
    inner: Arc<dyn EventSink>,
}

impl MeteredSink {
    /// Wrap `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn EventSink>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl EventSink for MeteredSink {
    async fn send(&self, topic: &str, key: &str, payload: Bytes) -> Result<(), EventError> {
        let result = self.inner.send(topic, key, payload).await;
        if result.is_err() {
            counter!(names::EVENT_FAILURES_TOTAL, "topic" => topic.to_string()).increment(1);
        }
        result
    }
}
