//! Upgrade request authentication.
//!
//! Token verification happens in the authenticating proxy in front of the
//! gateway. The proxy forwards the verified identity in trusted headers.

use async_trait::async_trait;
use axum::http::HeaderMap;
use std::time::Duration;
use switchboard_core::Identity;
use thiserror::Error;
use uuid::Uuid;

/// Header carrying the authenticated user id.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Header carrying the authenticated user name.
pub const USER_NAME_HEADER: &str = "x-user-name";

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing {0} header")]
    Missing(&'static str),

    #[error("Invalid user id: {0}")]
    InvalidUserId(String),

    #[error("Authentication timed out")]
    Timeout,
}

/// Extracts an identity from an upgrade request.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, AuthError>;
}

/// Trusts the identity headers set by the upstream proxy.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeaderAuthenticator;

#[async_trait]
impl Authenticator for HeaderAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, AuthError> {
        let raw = headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(AuthError::Missing(USER_ID_HEADER))?;
        let user_id =
            Uuid::parse_str(raw.trim()).map_err(|_| AuthError::InvalidUserId(raw.to_string()))?;
        let username = headers
            .get(USER_NAME_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        Ok(Identity::new(user_id, username))
    }
}

/// Authenticate within the handshake deadline.
///
/// # Errors
///
/// Returns the authenticator's error, or [`AuthError::Timeout`].
pub async fn authenticate_within(
    authenticator: &dyn Authenticator,
    headers: &HeaderMap,
    deadline: Duration,
) -> Result<Identity, AuthError> {
    tokio::time::timeout(deadline, authenticator.authenticate(headers))
        .await
        .map_err(|_| AuthError::Timeout)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[tokio::test]
    async fn test_header_identity() {
        let user = Uuid::new_v4();
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, HeaderValue::from_str(&user.to_string()).unwrap());
        headers.insert(USER_NAME_HEADER, HeaderValue::from_static("alice"));

        let identity = HeaderAuthenticator.authenticate(&headers).await.unwrap();
        assert_eq!(identity.user_id, user);
        assert_eq!(identity.username, "alice");
    }

    #[tokio::test]
    async fn test_missing_or_invalid_user() {
        let mut headers = HeaderMap::new();
        assert!(matches!(
            HeaderAuthenticator.authenticate(&headers).await,
            Err(AuthError::Missing(_))
        ));

        headers.insert(USER_ID_HEADER, HeaderValue::from_static("not-a-uuid"));
        assert!(matches!(
            HeaderAuthenticator.authenticate(&headers).await,
            Err(AuthError::InvalidUserId(_))
        ));
    }

    struct Stalled;

    #[async_trait]
    impl Authenticator for Stalled {
        async fn authenticate(&self, _headers: &HeaderMap) -> Result<Identity, AuthError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_deadline() {
        let result =
            authenticate_within(&Stalled, &HeaderMap::new(), Duration::from_secs(45)).await;
        assert!(matches!(result, Err(AuthError::Timeout)));
    }
}
