//! Fleet orchestration error types.

use crate::channel::ChannelError;
use crate::session::AuthError;

/// Errors from fleet-level operations.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("Device not found: {device_id}")]
    DeviceNotFound { device_id: String },

    #[error("No control access to device {device_id}")]
    NoControlAccess { device_id: String },

    #[error("Not connected to host {host}")]
    NotConnected { host: String },

    #[error("Group not found: {group_id}")]
    GroupNotFound { group_id: String },

    #[error("Group already exists: {group_id}")]
    GroupExists { group_id: String },

    #[error("Invalid group: {0}")]
    InvalidGroup(String),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Snapshot error: {0}")]
    Snapshot(String),
}

impl FleetError {
    /// Whether retrying later may succeed without changing grants or input.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NotConnected { .. } => true,
            Self::Channel(e) => e.is_transient(),
            Self::Auth(e) => e.is_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(
            FleetError::NotConnected {
                host: "relay-1-eu".into()
            }
            .is_transient()
        );
        assert!(FleetError::Channel(ChannelError::Closed).is_transient());
        assert!(
            !FleetError::NoControlAccess {
                device_id: "d1".into()
            }
            .is_transient()
        );
        assert!(
            !FleetError::DeviceNotFound {
                device_id: "d1".into()
            }
            .is_transient()
        );
    }
}
