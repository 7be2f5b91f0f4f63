//! Fleet-wide connectivity and command dispatch.

pub mod batch;
pub mod error;
pub mod groups;
pub mod orchestrator;
pub mod status;

use async_trait::async_trait;
use serde_json::Value;

pub use batch::{BatchCommand, CommandResult};
pub use error::FleetError;
pub use groups::DeviceGroup;
pub use orchestrator::FleetOrchestrator;
pub use status::DeviceStatus;

/// The slice of the fleet that bulk jobs drive.
#[async_trait]
pub trait FleetControl: Send + Sync {
    /// Authorize and send one command.
    async fn send_command(
        &self,
        device_id: &str,
        action: &str,
        params: &Value,
    ) -> Result<(), FleetError>;

    /// Add a device to a group. Returns false if it was already a member.
    fn add_to_group(&self, group_id: &str, device_id: &str) -> Result<bool, FleetError>;
}
