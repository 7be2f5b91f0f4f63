//! Provisioning templates, tasks and progress records.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use fleetlink_core::AccountDevice;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::ProvisionError;

/// One step of a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateAction {
    pub action: String,
    #[serde(default)]
    pub params: Value,
    /// Pause after this action before the next one (milliseconds).
    #[serde(default)]
    pub delay_ms: u64,
}

impl TemplateAction {
    pub fn new(action: impl Into<String>, params: Value) -> Self {
        Self {
            action: action.into(),
            params,
            delay_ms: 0,
        }
    }

    #[must_use]
    pub const fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }
}

/// A named, ordered set of actions applied to devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigTemplate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub settings: Map<String, Value>,
    /// Compatible device types. Empty means every type.
    #[serde(default)]
    pub device_types: Vec<String>,
    pub actions: Vec<TemplateAction>,
}

impl ConfigTemplate {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        actions: Vec<TemplateAction>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            settings: Map::new(),
            device_types: Vec::new(),
            actions,
        }
    }

    #[must_use]
    pub fn with_device_types(mut self, device_types: Vec<String>) -> Self {
        self.device_types = device_types;
        self
    }

    pub fn is_compatible(&self, device_type: &str) -> bool {
        self.device_types.is_empty() || self.device_types.iter().any(|t| t == device_type)
    }
}

/// Lifecycle of a provisioning task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Legal transitions: pending to running or canceled, running to any
    /// terminal state.
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running | Self::Canceled)
                | (Self::Running, Self::Completed | Self::Failed | Self::Canceled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One bulk application of a template to a device list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningTask {
    pub id: String,
    pub template_id: String,
    pub device_ids: Vec<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ProvisioningTask {
    /// Move to `next`, stamping start/completion times.
    pub fn transition_to(&mut self, next: TaskStatus) -> Result<(), ProvisionError> {
        if !self.status.can_transition_to(next) {
            return Err(ProvisionError::InvalidTransition {
                task_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        let now = Utc::now();
        if next == TaskStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        Ok(())
    }
}

/// Per-device outcome classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProvisionResult {
    pub device_id: String,
    pub status: ResultStatus,
    /// Failure or skip reason.
    #[serde(default)]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Running counters plus one result per processed device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningProgress {
    pub task_id: String,
    pub total: usize,
    /// Devices that succeeded.
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub results: BTreeMap<String, DeviceProvisionResult>,
}

impl ProvisioningProgress {
    pub fn new(task_id: impl Into<String>, total: usize) -> Self {
        Self {
            task_id: task_id.into(),
            total,
            ..Self::default()
        }
    }

    pub fn record(&mut self, result: DeviceProvisionResult) {
        match result.status {
            ResultStatus::Success => self.completed += 1,
            ResultStatus::Skipped => self.skipped += 1,
            ResultStatus::Failed => self.failed += 1,
        }
        self.results.insert(result.device_id.clone(), result);
    }

    pub const fn processed(&self) -> usize {
        self.completed + self.failed + self.skipped
    }

    /// Status a finished run ends in: failed only when nothing succeeded and
    /// at least one device failed. Skips alone still complete.
    pub const fn final_status(&self) -> TaskStatus {
        if self.completed == 0 && self.failed > 0 {
            TaskStatus::Failed
        } else {
            TaskStatus::Completed
        }
    }
}

/// A device to insert into the index during bulk registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRegistration {
    pub user_id: String,
    pub device: AccountDevice,
}

/// Outcome of [`register_devices`](super::ProvisioningEngine::register_devices).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistrationReport {
    pub registered: Vec<String>,
    /// `(device_id, error)` for devices the index rejected.
    pub rejected: Vec<(String, String)>,
    /// `(device_id, error)` for registered devices that could not join the group.
    pub group_failures: Vec<(String, String)>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn transition_table() {
        use TaskStatus::{Canceled, Completed, Failed, Pending, Running};
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Canceled));
        assert!(!Pending.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(!Running.can_transition_to(Pending));
        for terminal in [Completed, Failed, Canceled] {
            for next in [Pending, Running, Completed, Failed, Canceled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn transition_stamps_times() {
        let mut task = ProvisioningTask {
            id: "t".into(),
            template_id: "tpl".into(),
            device_ids: vec![],
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        };
        task.transition_to(TaskStatus::Running).unwrap();
        assert!(task.started_at.is_some());
        task.transition_to(TaskStatus::Completed).unwrap();
        assert!(task.completed_at.is_some());

        let err = task.transition_to(TaskStatus::Running).unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::InvalidTransition {
                from: TaskStatus::Completed,
                to: TaskStatus::Running,
                ..
            }
        ));
    }

    #[test]
    fn template_compatibility() {
        let any = ConfigTemplate::new("t", "T", vec![TemplateAction::new("relay", json!({}))]);
        assert!(any.is_compatible("SHSW-1"));
        let only = any.with_device_types(vec!["SHSW-1".into()]);
        assert!(only.is_compatible("SHSW-1"));
        assert!(!only.is_compatible("SHHT-1"));
    }

    #[test]
    fn skips_alone_complete_but_all_failures_fail() {
        let mut progress = ProvisioningProgress::new("t", 2);
        assert_eq!(progress.final_status(), TaskStatus::Completed);

        let now = Utc::now();
        let result = |id: &str, status| DeviceProvisionResult {
            device_id: id.into(),
            status,
            error: None,
            started_at: now,
            completed_at: now,
        };
        progress.record(result("a", ResultStatus::Skipped));
        assert_eq!(progress.final_status(), TaskStatus::Completed);
        progress.record(result("b", ResultStatus::Failed));
        assert_eq!(progress.final_status(), TaskStatus::Failed);
        progress.record(result("c", ResultStatus::Success));
        assert_eq!(progress.final_status(), TaskStatus::Completed);
        assert_eq!(progress.processed(), 3);
    }

    #[test]
    fn status_wire_names() {
        assert_eq!(serde_json::to_value(TaskStatus::Canceled).unwrap(), json!("canceled"));
        assert_eq!(TaskStatus::Running.to_string(), "running");
    }
}
