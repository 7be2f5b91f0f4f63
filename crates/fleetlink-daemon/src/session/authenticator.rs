//! Integrator authentication against the cloud API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::error::AuthError;
use super::token::Credential;

/// Path of the token endpoint relative to the API base URL.
pub const TOKEN_PATH: &str = "/integrator/get_access_token";

/// Performs one authentication round trip.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self) -> Result<Credential, AuthError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenRequest<'a> {
    integrator_tag: &'a str,
    secret_token: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    token: String,
    /// Unix seconds.
    expires_at: i64,
}

/// Authenticates with the integrator tag and secret over HTTPS.
pub struct HttpAuthenticator {
    http: reqwest::Client,
    endpoint: String,
    tag: String,
    secret: String,
}

impl HttpAuthenticator {
    pub fn new(
        api_base: &str,
        tag: impl Into<String>,
        secret: impl Into<String>,
    ) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| AuthError::Network(e.to_string()))?;
        Ok(Self {
            http,
            endpoint: format!("{}{TOKEN_PATH}", api_base.trim_end_matches('/')),
            tag: tag.into(),
            secret: secret.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl std::fmt::Debug for HttpAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpAuthenticator")
            .field("endpoint", &self.endpoint)
            .field("tag", &self.tag)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Authenticator for HttpAuthenticator {
    async fn authenticate(&self) -> Result<Credential, AuthError> {
        let request = TokenRequest {
            integrator_tag: &self.tag,
            secret_token: &self.secret,
        };
        let response = self
            .http
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;
        debug!(status, endpoint = %self.endpoint, "Authentication response received");
        parse_auth_response(status, &body)
    }
}

/// Turn an HTTP status and body into a credential or a typed error.
pub fn parse_auth_response(status: u16, body: &str) -> Result<Credential, AuthError> {
    if !(200..300).contains(&status) {
        warn!(status, body = %body, "Authentication endpoint returned error");
        return Err(AuthError::Rejected {
            status,
            body: body.to_string(),
        });
    }
    let parsed: TokenResponse =
        serde_json::from_str(body).map_err(|e| AuthError::InvalidResponse(e.to_string()))?;
    if parsed.token.is_empty() {
        return Err(AuthError::InvalidResponse("empty token".to_string()));
    }
    let expires_at = DateTime::<Utc>::from_timestamp(parsed.expires_at, 0).ok_or_else(|| {
        AuthError::InvalidResponse(format!("expiresAt out of range: {}", parsed.expires_at))
    })?;
    Ok(Credential::new(parsed.token, expires_at))
}
