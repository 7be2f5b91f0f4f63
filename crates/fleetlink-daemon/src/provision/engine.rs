//! Bulk provisioning engine.
//!
//! A task applies one template to a list of devices in order, recording one
//! outcome per device. Execution observes two cancellation signals before
//! every device and during every post-action delay: the caller's context and
//! the task's own token, which [`ProvisioningEngine::cancel_task`] trips.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleetlink_core::DeviceIndex;
use fleetlink_core::index::write_atomic;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::fleet::FleetControl;

use super::error::ProvisionError;
use super::types::{
    ConfigTemplate, DeviceProvisionResult, DeviceRegistration, ProvisioningProgress,
    ProvisioningTask, RegistrationReport, ResultStatus, TaskStatus,
};

const SNAPSHOT_VERSION: u32 = 1;

/// Error recorded on tasks that were running when the process stopped.
pub const INTERRUPTED: &str = "interrupted";

struct TaskEntry {
    task: ProvisioningTask,
    progress: ProvisioningProgress,
    cancel: CancellationToken,
}

#[derive(Serialize, Deserialize)]
struct ProvisionSnapshot {
    version: u32,
    #[serde(default)]
    templates: Vec<ConfigTemplate>,
    #[serde(default)]
    tasks: Vec<ProvisioningTask>,
    #[serde(default)]
    progress: Vec<ProvisioningProgress>,
}

/// How one device fared.
enum Outcome {
    Success,
    Skipped(String),
    Failed(String),
}

/// Applies configuration templates across the fleet.
pub struct ProvisioningEngine {
    index: Arc<DeviceIndex>,
    fleet: Arc<dyn FleetControl>,
    templates: RwLock<BTreeMap<String, ConfigTemplate>>,
    tasks: Mutex<HashMap<String, TaskEntry>>,
}

impl ProvisioningEngine {
    pub fn new(index: Arc<DeviceIndex>, fleet: Arc<dyn FleetControl>) -> Self {
        Self {
            index,
            fleet,
            templates: RwLock::new(BTreeMap::new()),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    // =========================================================================
    // Templates
    // =========================================================================

    /// Insert or replace a template.
    pub fn add_template(&self, template: ConfigTemplate) -> Result<(), ProvisionError> {
        if template.id.is_empty() {
            return Err(ProvisionError::InvalidTemplate(
                "template id must not be empty".into(),
            ));
        }
        if template.actions.is_empty() {
            return Err(ProvisionError::InvalidTemplate(format!(
                "template {} has no actions",
                template.id
            )));
        }
        if let Some(action) = template.actions.iter().find(|a| a.action.is_empty()) {
            return Err(ProvisionError::InvalidTemplate(format!(
                "template {} has an unnamed action (params {})",
                template.id, action.params
            )));
        }
        debug!(template_id = %template.id, actions = template.actions.len(), "Template stored");
        self.templates.write().insert(template.id.clone(), template);
        Ok(())
    }

    pub fn template(&self, id: &str) -> Option<ConfigTemplate> {
        self.templates.read().get(id).cloned()
    }

    /// All templates sorted by id.
    pub fn templates(&self) -> Vec<ConfigTemplate> {
        self.templates.read().values().cloned().collect()
    }

    pub fn remove_template(&self, id: &str) -> bool {
        self.templates.write().remove(id).is_some()
    }

    fn require_template(&self, id: &str) -> Result<ConfigTemplate, ProvisionError> {
        self.template(id)
            .ok_or_else(|| ProvisionError::TemplateNotFound {
                template_id: id.to_string(),
            })
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    /// Create a pending task. Duplicate device ids are dropped, keeping the
    /// first occurrence.
    pub fn create_task(
        &self,
        template_id: &str,
        device_ids: &[String],
    ) -> Result<ProvisioningTask, ProvisionError> {
        self.require_template(template_id)?;

        let mut seen = HashSet::new();
        let device_ids: Vec<String> = device_ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect();

        let task = ProvisioningTask {
            id: uuid::Uuid::new_v4().to_string(),
            template_id: template_id.to_string(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            device_ids,
        };
        let entry = TaskEntry {
            progress: ProvisioningProgress::new(&task.id, task.device_ids.len()),
            task: task.clone(),
            cancel: CancellationToken::new(),
        };
        self.tasks.lock().insert(task.id.clone(), entry);
        info!(
            task_id = %task.id,
            template_id,
            devices = task.device_ids.len(),
            "Provisioning task created"
        );
        Ok(task)
    }

    pub fn task(&self, task_id: &str) -> Option<ProvisioningTask> {
        self.tasks.lock().get(task_id).map(|e| e.task.clone())
    }

    /// All tasks, oldest first.
    pub fn tasks(&self) -> Vec<ProvisioningTask> {
        let mut tasks: Vec<_> = self.tasks.lock().values().map(|e| e.task.clone()).collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    pub fn progress(&self, task_id: &str) -> Option<ProvisioningProgress> {
        self.tasks.lock().get(task_id).map(|e| e.progress.clone())
    }

    /// Cancel a pending or running task. A running task stops before its
    /// next device.
    pub fn cancel_task(&self, task_id: &str) -> Result<(), ProvisionError> {
        let mut tasks = self.tasks.lock();
        let entry = tasks
            .get_mut(task_id)
            .ok_or_else(|| ProvisionError::TaskNotFound {
                task_id: task_id.to_string(),
            })?;
        if !entry.task.status.can_transition_to(TaskStatus::Canceled) {
            return Err(ProvisionError::TaskNotCancelable {
                task_id: task_id.to_string(),
                status: entry.task.status,
            });
        }
        entry.task.transition_to(TaskStatus::Canceled)?;
        entry.cancel.cancel();
        info!(task_id, "Provisioning task canceled");
        Ok(())
    }

    /// Run a pending task to completion, failure or cancellation.
    pub async fn execute_task(
        &self,
        task_id: &str,
        ctx: &CancellationToken,
    ) -> Result<ProvisioningProgress, ProvisionError> {
        let (template_id, device_ids, cancel) = {
            let mut tasks = self.tasks.lock();
            let entry = tasks
                .get_mut(task_id)
                .ok_or_else(|| ProvisionError::TaskNotFound {
                    task_id: task_id.to_string(),
                })?;
            if entry.task.status != TaskStatus::Pending {
                return Err(ProvisionError::TaskNotPending {
                    task_id: task_id.to_string(),
                    status: entry.task.status,
                });
            }
            entry.task.transition_to(TaskStatus::Running)?;
            (
                entry.task.template_id.clone(),
                entry.task.device_ids.clone(),
                entry.cancel.clone(),
            )
        };

        let template = match self.require_template(&template_id) {
            Ok(template) => template,
            Err(e) => {
                self.finish(task_id, TaskStatus::Failed, Some(e.to_string()));
                return Err(e);
            }
        };
        info!(
            task_id,
            template_id = %template.id,
            devices = device_ids.len(),
            "Provisioning task started"
        );

        for device_id in &device_ids {
            if ctx.is_cancelled() || cancel.is_cancelled() {
                self.finish(task_id, TaskStatus::Canceled, None);
                warn!(task_id, "Provisioning task canceled mid-run");
                return Err(ProvisionError::Canceled {
                    task_id: task_id.to_string(),
                });
            }

            let started_at = Utc::now();
            let outcome = self
                .provision_device(&template, device_id, ctx, &cancel)
                .await;
            let (status, error) = match outcome {
                Outcome::Success => (ResultStatus::Success, None),
                Outcome::Skipped(reason) => (ResultStatus::Skipped, Some(reason)),
                Outcome::Failed(reason) => (ResultStatus::Failed, Some(reason)),
            };
            debug!(task_id, device_id = %device_id, ?status, "Device processed");

            if let Some(entry) = self.tasks.lock().get_mut(task_id) {
                entry.progress.record(DeviceProvisionResult {
                    device_id: device_id.clone(),
                    status,
                    error,
                    started_at,
                    completed_at: Utc::now(),
                });
            }
        }

        // A cancel that interrupted the last device's delay still cancels.
        if ctx.is_cancelled() || cancel.is_cancelled() {
            self.finish(task_id, TaskStatus::Canceled, None);
            warn!(task_id, "Provisioning task canceled mid-run");
            return Err(ProvisionError::Canceled {
                task_id: task_id.to_string(),
            });
        }

        let progress = self
            .progress(task_id)
            .unwrap_or_else(|| ProvisioningProgress::new(task_id, device_ids.len()));
        if !self.finish(task_id, progress.final_status(), None) {
            // Canceled while the last device was in flight.
            return Err(ProvisionError::Canceled {
                task_id: task_id.to_string(),
            });
        }
        info!(
            task_id,
            completed = progress.completed,
            skipped = progress.skipped,
            failed = progress.failed,
            "Provisioning task finished"
        );
        Ok(progress)
    }

    /// Move a running task to `status`. Returns false if it already left
    /// `running` (e.g. canceled concurrently).
    fn finish(&self, task_id: &str, status: TaskStatus, error: Option<String>) -> bool {
        let mut tasks = self.tasks.lock();
        let Some(entry) = tasks.get_mut(task_id) else {
            return false;
        };
        if entry.task.transition_to(status).is_err() {
            return false;
        }
        entry.task.error = error;
        true
    }

    async fn provision_device(
        &self,
        template: &ConfigTemplate,
        device_id: &str,
        ctx: &CancellationToken,
        cancel: &CancellationToken,
    ) -> Outcome {
        let Some(device) = self.index.device(device_id) else {
            return Outcome::Failed(format!("device not found: {device_id}"));
        };
        if !template.is_compatible(&device.device_type) {
            return Outcome::Skipped(format!(
                "device type {} not supported by template {}",
                device.device_type, template.id
            ));
        }
        if !device.can_control() {
            return Outcome::Skipped("no control access".to_string());
        }

        match self.run_actions(template, device_id, ctx, cancel).await {
            Ok(()) => Outcome::Success,
            Err(e) => Outcome::Failed(e.to_string()),
        }
    }

    /// Run the template's actions in order, pausing between them. Stops at
    /// the first failure.
    async fn run_actions(
        &self,
        template: &ConfigTemplate,
        device_id: &str,
        ctx: &CancellationToken,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        let last = template.actions.len().saturating_sub(1);
        for (i, action) in template.actions.iter().enumerate() {
            self.fleet
                .send_command(device_id, &action.action, &action.params)
                .await
                .map_err(|source| ProvisionError::Action {
                    action: action.action.clone(),
                    source,
                })?;

            if i < last && action.delay_ms > 0 {
                tokio::select! {
                    () = tokio::time::sleep(Duration::from_millis(action.delay_ms)) => {}
                    () = ctx.cancelled() => return Err(ProvisionError::Interrupted),
                    () = cancel.cancelled() => return Err(ProvisionError::Interrupted),
                }
            }
        }
        Ok(())
    }

    /// Apply a template to one device right away, outside any task.
    pub async fn apply_template(
        &self,
        template_id: &str,
        device_id: &str,
    ) -> Result<(), ProvisionError> {
        let template = self.require_template(template_id)?;
        let device = self
            .index
            .device(device_id)
            .ok_or_else(|| ProvisionError::DeviceNotFound {
                device_id: device_id.to_string(),
            })?;
        if !template.is_compatible(&device.device_type) {
            return Err(ProvisionError::TemplateIncompatible {
                template_id: template_id.to_string(),
                device_type: device.device_type,
            });
        }
        if !device.can_control() {
            return Err(ProvisionError::NoControlAccess {
                device_id: device_id.to_string(),
            });
        }
        let never = CancellationToken::new();
        self.run_actions(&template, device_id, &never, &never).await
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Insert devices into the index and, best effort, into `group`. A failed
    /// group assignment leaves the registration in place.
    pub fn register_devices(
        &self,
        registrations: Vec<DeviceRegistration>,
        group: Option<&str>,
    ) -> RegistrationReport {
        let mut report = RegistrationReport::default();
        for DeviceRegistration { user_id, device } in registrations {
            let device_id = device.device_id.clone();
            if let Err(e) = self.index.upsert_device(&user_id, device) {
                warn!(device_id = %device_id, error = %e, "Device registration rejected");
                report.rejected.push((device_id, e.to_string()));
                continue;
            }
            if let Some(group_id) = group
                && let Err(e) = self.fleet.add_to_group(group_id, &device_id)
            {
                debug!(device_id = %device_id, group_id, error = %e, "Group assignment failed");
                report.group_failures.push((device_id.clone(), e.to_string()));
            }
            report.registered.push(device_id);
        }
        info!(
            registered = report.registered.len(),
            rejected = report.rejected.len(),
            group_failures = report.group_failures.len(),
            "Bulk registration finished"
        );
        report
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    pub fn export_snapshot(&self) -> Result<Vec<u8>, ProvisionError> {
        let (tasks, progress) = {
            let tasks = self.tasks.lock();
            let mut entries: Vec<_> = tasks.values().collect();
            entries.sort_by(|a, b| a.task.created_at.cmp(&b.task.created_at));
            (
                entries.iter().map(|e| e.task.clone()).collect(),
                entries.iter().map(|e| e.progress.clone()).collect(),
            )
        };
        let snapshot = ProvisionSnapshot {
            version: SNAPSHOT_VERSION,
            templates: self.templates(),
            tasks,
            progress,
        };
        serde_json::to_vec_pretty(&snapshot).map_err(|e| ProvisionError::Snapshot(e.to_string()))
    }

    /// Replace templates, tasks and progress. Tasks that were running are
    /// marked failed with [`INTERRUPTED`].
    pub fn import_snapshot(&self, bytes: &[u8]) -> Result<(), ProvisionError> {
        let snapshot: ProvisionSnapshot =
            serde_json::from_slice(bytes).map_err(|e| ProvisionError::Snapshot(e.to_string()))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(ProvisionError::Snapshot(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }

        let mut progress: HashMap<String, ProvisioningProgress> = snapshot
            .progress
            .into_iter()
            .map(|p| (p.task_id.clone(), p))
            .collect();
        let mut tasks = HashMap::new();
        let mut interrupted = 0usize;
        for mut task in snapshot.tasks {
            if task.status == TaskStatus::Running {
                task.status = TaskStatus::Failed;
                task.completed_at = Some(Utc::now());
                task.error = Some(INTERRUPTED.to_string());
                interrupted += 1;
            }
            let entry = TaskEntry {
                progress: progress
                    .remove(&task.id)
                    .unwrap_or_else(|| ProvisioningProgress::new(&task.id, task.device_ids.len())),
                task,
                cancel: CancellationToken::new(),
            };
            tasks.insert(entry.task.id.clone(), entry);
        }
        let templates: BTreeMap<_, _> = snapshot
            .templates
            .into_iter()
            .map(|t| (t.id.clone(), t))
            .collect();

        let (template_count, task_count) = (templates.len(), tasks.len());
        *self.templates.write() = templates;
        *self.tasks.lock() = tasks;
        info!(
            templates = template_count,
            tasks = task_count,
            interrupted,
            "Provisioning state restored"
        );
        Ok(())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ProvisionError> {
        let bytes = self.export_snapshot()?;
        write_atomic(path, &bytes).map_err(|e| ProvisionError::Snapshot(e.to_string()))
    }

    /// Returns whether a snapshot file was found and loaded.
    pub fn load_from(&self, path: &Path) -> Result<bool, ProvisionError> {
        if !path.exists() {
            return Ok(false);
        }
        let bytes = std::fs::read(path).map_err(|e| ProvisionError::Snapshot(e.to_string()))?;
        self.import_snapshot(&bytes)?;
        Ok(true)
    }
}
