//! Provisioning error types.

use crate::fleet::FleetError;

use super::types::TaskStatus;

/// Errors from the provisioning engine.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("Template not found: {template_id}")]
    TemplateNotFound { template_id: String },

    #[error("Invalid template: {0}")]
    InvalidTemplate(String),

    #[error("Template {template_id} does not support device type {device_type}")]
    TemplateIncompatible {
        template_id: String,
        device_type: String,
    },

    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: String },

    #[error("Task {task_id} is {status}, not pending")]
    TaskNotPending { task_id: String, status: TaskStatus },

    #[error("Task {task_id} is {status} and cannot be canceled")]
    TaskNotCancelable { task_id: String, status: TaskStatus },

    #[error("Task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task {task_id} was canceled")]
    Canceled { task_id: String },

    #[error("Provisioning canceled")]
    Interrupted,

    #[error("Device not found: {device_id}")]
    DeviceNotFound { device_id: String },

    #[error("No control access to device {device_id}")]
    NoControlAccess { device_id: String },

    #[error("Action {action} failed: {source}")]
    Action {
        action: String,
        #[source]
        source: FleetError,
    },

    #[error("Snapshot error: {0}")]
    Snapshot(String),
}
