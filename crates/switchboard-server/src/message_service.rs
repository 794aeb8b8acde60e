//! HTTP client for the external message service.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use switchboard_core::{MessageService, PersistenceError};
use switchboard_protocol::{GroupId, MessageReceipt, SendGroupRequest, SendP2PRequest, UserId};
use tracing::debug;

#[derive(Debug, Deserialize)]
struct MembersResponse {
    members: Vec<UserId>,
}

/// Message service reached over HTTP.
///
/// - `POST {url}/api/v1/messages/p2p`
/// - `POST {url}/api/v1/messages/group`
/// - `GET {url}/api/v1/groups/{id}/members`
#[derive(Debug, Clone)]
pub struct HttpMessageService {
    client: Client,
    base_url: String,
}

impl HttpMessageService {
    /// Create a client for the service at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, PersistenceError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PersistenceError::Unavailable(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post_message<T: serde::Serialize + Sync>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<MessageReceipt, PersistenceError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| PersistenceError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }

        let receipt = response
            .json::<MessageReceipt>()
            .await
            .map_err(|e| PersistenceError::Storage(format!("Malformed response: {e}")))?;
        debug!(url = %url, id = %receipt.id, "Message service accepted message");
        Ok(receipt)
    }
}

fn status_error(status: StatusCode, body: String) -> PersistenceError {
    let detail = if body.is_empty() {
        format!("message service returned status {}", status.as_u16())
    } else {
        format!("message service returned status {}: {}", status.as_u16(), body)
    };
    match status {
        StatusCode::NOT_FOUND => PersistenceError::NotFound(detail),
        s if s.is_client_error() => PersistenceError::Rejected(detail),
        _ => PersistenceError::Storage(detail),
    }
}

#[async_trait]
impl MessageService for HttpMessageService {
    async fn send_p2p(&self, request: &SendP2PRequest) -> Result<MessageReceipt, PersistenceError> {
        self.post_message("/api/v1/messages/p2p", request).await
    }

    async fn send_group(
        &self,
        request: &SendGroupRequest,
    ) -> Result<MessageReceipt, PersistenceError> {
        self.post_message("/api/v1/messages/group", request).await
    }

    async fn group_members(&self, group: GroupId) -> Result<Vec<UserId>, PersistenceError> {
        let url = format!("{}/api/v1/groups/{}/members", self.base_url, group);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PersistenceError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }

        response
            .json::<MembersResponse>()
            .await
            .map(|r| r.members)
            .map_err(|e| PersistenceError::Storage(format!("Malformed response: {e}")))
    }
}
