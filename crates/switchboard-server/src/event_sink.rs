//! HTTP event sink.
//!
//! Writes durability records through a broker REST proxy:
//! `POST {endpoint}/topics/{topic}` with `{"records": [{"key", "value"}]}`.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use switchboard_core::{EventError, EventSink};
use tracing::trace;

/// Content type understood by the REST proxy for JSON records.
const RECORDS_CONTENT_TYPE: &str = "application/vnd.kafka.json.v2+json";

/// Event sink backed by a broker REST proxy.
#[derive(Debug, Clone)]
pub struct HttpEventSink {
    client: Client,
    endpoint: String,
}

impl HttpEventSink {
    /// Create a sink posting to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, EventError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EventError::Sink(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }
}

/// Wrap one record in the proxy's request body.
fn records_body(key: &str, payload: &[u8]) -> Result<Value, EventError> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|e| EventError::Sink(format!("Payload is not JSON: {e}")))?;
    Ok(json!({ "records": [{ "key": key, "value": value }] }))
}

#[async_trait]
impl EventSink for HttpEventSink {
    async fn send(&self, topic: &str, key: &str, payload: Bytes) -> Result<(), EventError> {
        let url = format!("{}/topics/{}", self.endpoint, topic);
        let body = records_body(key, &payload)?;

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, RECORDS_CONTENT_TYPE)
            .body(body.to_string())
            .send()
            .await
            .map_err(|e| EventError::Sink(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            trace!(topic = %topic, key = %key, "Record accepted by broker");
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(EventError::Sink(format!(
                "broker returned status {}: {}",
                status.as_u16(),
                body
            )))
        }
    }
}
