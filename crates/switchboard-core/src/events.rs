//! Durability event publishing.
//!
//! Accepted messages are handed to a broker as `{type, data, timestamp}`
//! records so downstream consumers can index or archive them. Publishing is
//! fire-and-forget: the caller never waits for the broker and a failure is
//! only logged.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use switchboard_protocol::{codec, DurabilityEvent, ProtocolError};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Event publishing errors.
#[derive(Debug, Error)]
pub enum EventError {
    /// No topic is configured for the event type.
    #[error("No topic configured for event type '{0}'")]
    UnknownTopic(String),

    /// The event could not be serialized.
    #[error("Encode error: {0}")]
    Encode(#[from] ProtocolError),

    /// The broker rejected or did not receive the record.
    #[error("Sink error: {0}")]
    Sink(String),
}

/// Destination of durability records.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Send one record to `topic`.
    async fn send(&self, topic: &str, key: &str, payload: Bytes) -> Result<(), EventError>;
}

/// How hard to try before giving up on a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryPolicy {
    /// One attempt.
    #[default]
    AtMostOnce,
    /// Retry with exponential backoff.
    Retry {
        /// Total attempts, including the first.
        max_attempts: u32,
        /// Delay before the second attempt.
        initial_backoff: Duration,
        /// Upper bound on any single delay.
        max_backoff: Duration,
    },
}

impl DeliveryPolicy {
    /// Get the total number of attempts.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        match self {
            DeliveryPolicy::AtMostOnce => 1,
            DeliveryPolicy::Retry { max_attempts, .. } => (*max_attempts).max(1),
        }
    }

    /// Delay before attempt number `attempt + 1`, counting from 1.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        match self {
            DeliveryPolicy::AtMostOnce => Duration::ZERO,
            DeliveryPolicy::Retry {
                initial_backoff,
                max_backoff,
                ..
            } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                initial_backoff.saturating_mul(factor).min(*max_backoff)
            }
        }
    }
}

/// Publishes durability events through an [`EventSink`].
#[derive(Clone)]
pub struct EventPublisher {
    sink: Option<Arc<dyn EventSink>>,
    topics: Arc<HashMap<String, String>>,
    policy: DeliveryPolicy,
}

impl EventPublisher {
    /// Create a publisher.
    ///
    /// `topics` maps an event type (`p2p_message`, `group_message`) to the
    /// broker topic it is written to.
    #[must_use]
    pub fn new(
        sink: Arc<dyn EventSink>,
        topics: HashMap<String, String>,
        policy: DeliveryPolicy,
    ) -> Self {
        Self {
            sink: Some(sink),
            topics: Arc::new(topics),
            policy,
        }
    }

    /// Create a publisher that drops every event.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            sink: None,
            topics: Arc::new(HashMap::new()),
            policy: DeliveryPolicy::AtMostOnce,
        }
    }

    /// Check whether events go anywhere.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// Publish `event` in the background.
    ///
    /// Returns the handle of the publishing task, or `None` if publishing is
    /// disabled. Callers normally drop the handle.
    pub fn publish(&self, event: DurabilityEvent, key: impl Into<String>) -> Option<JoinHandle<()>> {
        self.sink.as_ref()?;
        let publisher = self.clone();
        let key = key.into();

        Some(tokio::spawn(async move {
            let kind = event.kind.clone();
            if let Err(e) = publisher.publish_now(&event, &key).await {
                warn!(event = %kind, key = %key, error = %e, "Durability event dropped");
            }
        }))
    }

    /// Publish `event` and wait for the outcome, honouring the delivery policy.
    ///
    /// # Errors
    ///
    /// Returns the last error if every attempt failed.
    pub async fn publish_now(&self, event: &DurabilityEvent, key: &str) -> Result<(), EventError> {
        let Some(sink) = &self.sink else {
            return Ok(());
        };
        let topic = self
            .topics
            .get(&event.kind)
            .ok_or_else(|| EventError::UnknownTopic(event.kind.clone()))?;
        let payload = codec::encode(event)?;

        let attempts = self.policy.max_attempts();
        let mut attempt = 1;
        loop {
            match sink.send(topic, key, payload.clone()).await {
                Ok(()) => {
                    debug!(topic = %topic, key = %key, attempt, "Durability event published");
                    return Ok(());
                }
                Err(e) if attempt < attempts => {
                    let delay = self.policy.backoff(attempt);
                    debug!(topic = %topic, attempt, error = %e, ?delay, "Publish failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("enabled", &self.is_enabled())
            .field("topics", &self.topics)
            .field("policy", &self.policy)
            .finish()
    }
}

/// A record captured by [`MemorySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkRecord {
    pub topic: String,
    pub key: String,
    pub payload: Bytes,
}

/// Sink that keeps records in memory.
///
/// Can be told to fail the next `n` sends.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<SinkRecord>>,
    failures: Mutex<u32>,
}

impl MemorySink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` sends fail.
    pub fn fail_next(&self, n: u32) {
        if let Ok(mut failures) = self.failures.lock() {
            *failures = n;
        }
    }

    /// Get a copy of every record received so far.
    #[must_use]
    pub fn records(&self) -> Vec<SinkRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn send(&self, topic: &str, key: &str, payload: Bytes) -> Result<(), EventError> {
        {
            let mut failures = self
                .failures
                .lock()
                .map_err(|_| EventError::Sink("sink poisoned".into()))?;
            if *failures > 0 {
                *failures -= 1;
                return Err(EventError::Sink("injected failure".into()));
            }
        }

        self.records
            .lock()
            .map_err(|_| EventError::Sink("sink poisoned".into()))?
            .push(SinkRecord {
                topic: topic.to_string(),
                key: key.to_string(),
                payload,
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use switchboard_protocol::event;

    fn topics() -> HashMap<String, String> {
        HashMap::from([(event::P2P_MESSAGE.to_string(), "chat.p2p".to_string())])
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let policy = DeliveryPolicy::Retry {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
        };
        assert_eq!(policy.max_attempts(), 5);
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(DeliveryPolicy::AtMostOnce.max_attempts(), 1);
    }

    #[tokio::test]
    async fn test_publish_maps_type_to_topic() {
        let sink = Arc::new(MemorySink::new());
        let publisher = EventPublisher::new(sink.clone(), topics(), DeliveryPolicy::AtMostOnce);

        let event = DurabilityEvent::new(event::P2P_MESSAGE, json!({"id": "m1"}));
        publisher.publish_now(&event, "m1").await.unwrap();

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].topic, "chat.p2p");
        assert_eq!(records[0].key, "m1");
        let decoded: serde_json::Value = serde_json::from_slice(&records[0].payload).unwrap();
        assert_eq!(decoded["type"], "p2p_message");
        assert_eq!(decoded["data"]["id"], "m1");
    }

    #[tokio::test]
    async fn test_unknown_topic_is_an_error() {
        let publisher =
            EventPublisher::new(Arc::new(MemorySink::new()), topics(), DeliveryPolicy::AtMostOnce);
        let event = DurabilityEvent::new(event::GROUP_MESSAGE, json!({}));
        assert!(matches!(
            publisher.publish_now(&event, "k").await,
            Err(EventError::UnknownTopic(kind)) if kind == "group_message"
        ));
    }

    #[tokio::test]
    async fn test_at_most_once_gives_up_after_one_failure() {
        let sink = Arc::new(MemorySink::new());
        sink.fail_next(1);
        let publisher = EventPublisher::new(sink.clone(), topics(), DeliveryPolicy::AtMostOnce);

        let event = DurabilityEvent::new(event::P2P_MESSAGE, json!({}));
        assert!(publisher.publish_now(&event, "k").await.is_err());
        assert!(sink.records().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_policy_recovers() {
        let sink = Arc::new(MemorySink::new());
        sink.fail_next(2);
        let policy = DeliveryPolicy::Retry {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
        };
        let publisher = EventPublisher::new(sink.clone(), topics(), policy);

        let event = DurabilityEvent::new(event::P2P_MESSAGE, json!({}));
        publisher
            .publish(event, "k")
            .expect("publisher enabled")
            .await
            .unwrap();
        assert_eq!(sink.records().len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_publisher_spawns_nothing() {
        let publisher = EventPublisher::disabled();
        assert!(!publisher.is_enabled());
        let event = DurabilityEvent::new(event::P2P_MESSAGE, json!({}));
        assert!(publisher.publish(event.clone(), "k").is_none());
        assert!(publisher.publish_now(&event, "k").await.is_ok());
    }
}
