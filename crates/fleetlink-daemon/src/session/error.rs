//! Session error types.

use chrono::{DateTime, Utc};

/// Errors from authentication and credential handling.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    #[error("Network error during authentication: {0}")]
    Network(String),

    #[error("Authentication rejected (status {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Invalid authentication response: {0}")]
    InvalidResponse(String),

    #[error("No credential held")]
    NoCredential,

    #[error("Credential expired at {expires_at}")]
    Expired { expires_at: DateTime<Utc> },

    #[error("No region configured for host {host}")]
    UnknownRegion { host: String },
}

impl AuthError {
    /// Whether retrying later may succeed without operator action.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Expired { .. } | Self::NoCredential)
    }
}
