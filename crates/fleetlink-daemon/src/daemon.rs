//! Runtime glue for the `fleetlink` binary: state file layout and the
//! dead-channel supervisor.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::channel::ReconnectPolicy;
use crate::fleet::FleetOrchestrator;
use crate::provision::ProvisioningEngine;

/// Snapshot files under the state directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub index: PathBuf,
    pub fleet: PathBuf,
    pub provisioning: PathBuf,
}

impl StatePaths {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            index: state_dir.join("index.json"),
            fleet: state_dir.join("fleet.json"),
            provisioning: state_dir.join("provisioning.json"),
        }
    }

    /// Restore every snapshot that exists. A missing file is not an error.
    pub fn load_all(
        &self,
        fleet: &FleetOrchestrator,
        provisioning: &ProvisioningEngine,
    ) -> anyhow::Result<()> {
        let index = fleet.index().load_from(&self.index)?;
        let groups = fleet.load_from(&self.fleet)?;
        let tasks = provisioning.load_from(&self.provisioning)?;
        info!(index, groups, tasks, "State snapshots loaded");
        Ok(())
    }

    /// Persist every snapshot. Keeps going past failures; returns how many
    /// snapshots failed to save.
    pub fn save_all(&self, fleet: &FleetOrchestrator, provisioning: &ProvisioningEngine) -> usize {
        let mut failed = 0;
        if let Err(e) = fleet.index().save_to(&self.index) {
            warn!(path = %self.index.display(), error = %e, "Failed to save index");
            failed += 1;
        }
        if let Err(e) = fleet.save_to(&self.fleet) {
            warn!(path = %self.fleet.display(), error = %e, "Failed to save fleet state");
            failed += 1;
        }
        if let Err(e) = provisioning.save_to(&self.provisioning) {
            warn!(
                path = %self.provisioning.display(),
                error = %e,
                "Failed to save provisioning state"
            );
            failed += 1;
        }
        failed
    }
}

/// Periodically replace dead channels and connect newly granted hosts,
/// backing off while reconnects keep failing. Returns on shutdown or once the
/// policy runs out of attempts.
pub async fn supervise_channels(
    fleet: Arc<FleetOrchestrator>,
    policy: ReconnectPolicy,
    check_interval: Duration,
    unhealthy_after: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;
    let mut timer = tokio::time::interval(check_interval);
    timer.tick().await; // Skip first immediate tick

    loop {
        tokio::select! {
            _ = timer.tick() => {}
            _ = shutdown.changed() => {
                info!("Channel supervisor shutting down");
                return;
            }
        }

        let mut errors = fleet.reconnect_dead().await;
        if fleet.connected_hosts().len() < fleet.index().hosts().len() {
            errors.extend(fleet.connect_all().await);
        }

        let summary = fleet.health_summary(unhealthy_after);
        debug!(
            connected = fleet.connected_hosts().len(),
            devices = summary.total,
            unhealthy = summary.unhealthy,
            "Fleet check"
        );

        if errors.is_empty() {
            attempt = 0;
            continue;
        }
        if !policy.should_retry(attempt) {
            error!(
                attempts = attempt,
                failed_hosts = errors.len(),
                "Giving up on unreachable hosts"
            );
            return;
        }
        let delay = policy.delay_for_attempt(attempt);
        attempt += 1;
        warn!(
            failed_hosts = errors.len(),
            attempt,
            delay_ms = delay.as_millis(),
            "Reconnect failed, backing off"
        );
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {
                info!("Channel supervisor shutting down during backoff");
                return;
            }
        }
    }
}
