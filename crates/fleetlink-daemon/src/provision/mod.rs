//! Bulk provisioning: templates applied to device lists as cancellable tasks.

pub mod engine;
pub mod error;
pub mod types;

pub use engine::ProvisioningEngine;
pub use error::ProvisionError;
pub use types::{
    ConfigTemplate, DeviceProvisionResult, DeviceRegistration, ProvisioningProgress,
    ProvisioningTask, RegistrationReport, ResultStatus, TaskStatus, TemplateAction,
};
