//! Push channel error types.

/// Errors from a push channel.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel closed")]
    Closed,

    #[error("Failed to connect to {host}: {reason}")]
    Connect { host: String, reason: String },

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Read failed: {0}")]
    Read(String),

    #[error("Failed to encode message: {0}")]
    Encode(String),

    #[error("Malformed event: {0}")]
    Decode(String),
}

impl ChannelError {
    /// Transport-level failures a reconnect may cure.
    pub const fn is_transient(&self) -> bool {
        !matches!(self, Self::Encode(_) | Self::Decode(_))
    }
}
