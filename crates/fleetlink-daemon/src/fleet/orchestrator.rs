//! Fleet orchestrator: one push channel per relay host, command routing
//! through the device index, and inbound event bookkeeping.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fleetlink_core::index::write_atomic;
use fleetlink_core::{DeviceHealth, DeviceIndex, HealthMonitor, HealthSummary};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::channel::actions::{RELAY_ACTION, relay_params};
use crate::channel::{ChannelHandlers, ChannelOptions, PushChannel};
use crate::session::TokenSource;

use super::FleetControl;
use super::batch::{BatchCommand, CommandResult, is_relay_capable};
use super::error::FleetError;
use super::groups::{DeviceGroup, GroupRegistry};
use super::status::{DeviceStatus, StatusCache};

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct FleetSnapshot {
    version: u32,
    #[serde(default)]
    groups: Vec<DeviceGroup>,
    #[serde(default)]
    statuses: Vec<DeviceStatus>,
}

/// Owns the live push channels and routes commands to them.
pub struct FleetOrchestrator {
    index: Arc<DeviceIndex>,
    health: Arc<HealthMonitor>,
    tokens: Arc<dyn TokenSource>,
    options: ChannelOptions,
    channels: Mutex<HashMap<String, PushChannel>>,
    groups: Mutex<GroupRegistry>,
    statuses: Arc<Mutex<StatusCache>>,
}

impl FleetOrchestrator {
    pub fn new(
        index: Arc<DeviceIndex>,
        health: Arc<HealthMonitor>,
        tokens: Arc<dyn TokenSource>,
        options: ChannelOptions,
    ) -> Self {
        Self {
            index,
            health,
            tokens,
            options,
            channels: Mutex::new(HashMap::new()),
            groups: Mutex::new(GroupRegistry::default()),
            statuses: Arc::new(Mutex::new(StatusCache::default())),
        }
    }

    pub fn index(&self) -> &Arc<DeviceIndex> {
        &self.index
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    // =========================================================================
    // Connections
    // =========================================================================

    /// Channel for `host` if one exists and has not been closed.
    fn open_channel(&self, host: &str) -> Option<PushChannel> {
        self.channels
            .lock()
            .get(host)
            .filter(|c| !c.is_closed())
            .cloned()
    }

    /// Connect to `host`, reusing a live channel when there is one.
    pub async fn connect(&self, host: &str) -> Result<PushChannel, FleetError> {
        if let Some(existing) = self.open_channel(host).filter(PushChannel::is_alive) {
            return Ok(existing);
        }

        let token = self.tokens.token_for_host(host).await?;
        let channel =
            PushChannel::connect(host, &token, &self.options, self.handlers_for(host)).await?;

        let (winner, stale) = {
            let mut channels = self.channels.lock();
            match channels.get(host) {
                Some(existing) if existing.is_alive() => (existing.clone(), Some(channel)),
                _ => {
                    let replaced = channels.insert(host.to_string(), channel.clone());
                    (channel, replaced)
                }
            }
        };
        if let Some(stale) = stale {
            debug!(host = %host, "Closing superseded channel");
            if let Err(e) = stale.close().await {
                debug!(host = %host, error = %e, "Superseded channel close failed");
            }
        }
        Ok(winner)
    }

    /// Connect to every host that has at least one granted device. Failures
    /// are collected per host and do not stop the remaining hosts.
    pub async fn connect_all(&self) -> HashMap<String, FleetError> {
        let hosts = self.index.hosts();
        let mut errors = HashMap::new();
        for host in &hosts {
            if let Err(e) = self.connect(host).await {
                warn!(host = %host, error = %e, "Failed to connect to relay host");
                errors.insert(host.clone(), e);
            }
        }
        info!(
            hosts = hosts.len(),
            failed = errors.len(),
            "Fleet connect finished"
        );
        errors
    }

    /// Hosts whose channel is still registered but lost its transport.
    pub fn dead_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .channels
            .lock()
            .iter()
            .filter(|(_, c)| !c.is_alive())
            .map(|(h, _)| h.clone())
            .collect();
        hosts.sort();
        hosts
    }

    /// Replace every dead channel with a fresh connection.
    pub async fn reconnect_dead(&self) -> HashMap<String, FleetError> {
        let mut errors = HashMap::new();
        for host in self.dead_hosts() {
            info!(host = %host, "Reconnecting dead channel");
            if let Err(e) = self.connect(&host).await {
                warn!(host = %host, error = %e, "Reconnect failed");
                errors.insert(host, e);
            }
        }
        errors
    }

    /// Sorted hosts with a live channel.
    pub fn connected_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .channels
            .lock()
            .iter()
            .filter(|(_, c)| c.is_alive())
            .map(|(h, _)| h.clone())
            .collect();
        hosts.sort();
        hosts
    }

    pub fn is_connected(&self, host: &str) -> bool {
        self.channels.lock().get(host).is_some_and(PushChannel::is_alive)
    }

    /// Remove and close the channel for `host`. Returns whether one existed.
    pub async fn disconnect(&self, host: &str) -> Result<bool, FleetError> {
        let removed = self.channels.lock().remove(host);
        let Some(channel) = removed else {
            return Ok(false);
        };
        channel.close().await?;
        Ok(true)
    }

    /// Close every channel. Keeps going past failures and returns the last one.
    pub async fn disconnect_all(&self) -> Result<(), FleetError> {
        let channels: Vec<PushChannel> = self.channels.lock().drain().map(|(_, c)| c).collect();
        let mut last_error = None;
        for channel in channels {
            if let Err(e) = channel.close().await {
                warn!(host = %channel.host(), error = %e, "Channel close failed");
                last_error = Some(FleetError::from(e));
            }
        }
        last_error.map_or(Ok(()), Err)
    }

    // =========================================================================
    // Inbound events
    // =========================================================================

    fn handlers_for(&self, host: &str) -> ChannelHandlers {
        let status_host = host.to_string();
        let status_cache = Arc::clone(&self.statuses);
        let status_health = Arc::clone(&self.health);

        let settings_host = host.to_string();
        let settings_cache = Arc::clone(&self.statuses);

        let online_host = host.to_string();
        let online_cache = Arc::clone(&self.statuses);
        let online_health = Arc::clone(&self.health);
        let online_index = Arc::clone(&self.index);

        let error_host = host.to_string();

        ChannelHandlers::default()
            .with_status(move |device_id, status, _ts| {
                status_cache
                    .lock()
                    .record_status(device_id, &status_host, status, Utc::now());
                status_health.record_activity(device_id);
            })
            .with_settings(move |device_id, settings, _ts| {
                settings_cache
                    .lock()
                    .record_settings(device_id, &settings_host, settings, Utc::now());
            })
            .with_online(move |device_id, online, _ts| {
                online_cache
                    .lock()
                    .record_online(device_id, &online_host, online, Utc::now());
                if !online_index.update_online_status(device_id, online) {
                    debug!(device_id, "Online event for device missing from index");
                }
                online_health.record_online_status(device_id, online);
            })
            .with_error(move |error| {
                warn!(host = %error_host, error = %error, "Channel lost; awaiting reconnect");
            })
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Authorize `device_id` through the index and send over its host channel.
    pub async fn send_command(
        &self,
        device_id: &str,
        action: &str,
        params: &Value,
    ) -> Result<(), FleetError> {
        let device = self
            .index
            .device(device_id)
            .ok_or_else(|| FleetError::DeviceNotFound {
                device_id: device_id.to_string(),
            })?;
        if !device.can_control() {
            return Err(FleetError::NoControlAccess {
                device_id: device_id.to_string(),
            });
        }
        let channel = self
            .open_channel(&device.host)
            .ok_or_else(|| FleetError::NotConnected {
                host: device.host.clone(),
            })?;
        channel.send_command(device_id, action, params).await?;
        Ok(())
    }

    /// Run every command in order; one result per command, in input order.
    pub async fn send_batch(&self, commands: &[BatchCommand]) -> Vec<CommandResult> {
        let mut results = Vec::with_capacity(commands.len());
        for command in commands {
            let result = match self
                .send_command(&command.device_id, &command.action, &command.params)
                .await
            {
                Ok(()) => CommandResult::ok(&command.device_id),
                Err(e) => {
                    debug!(device_id = %command.device_id, error = %e, "Batch command failed");
                    CommandResult::failed(&command.device_id, e)
                }
            };
            results.push(result);
        }
        results
    }

    /// Send to every member of a group. An unknown group yields one failed
    /// result with an empty device id.
    pub async fn send_group_command(
        &self,
        group_id: &str,
        action: &str,
        params: &Value,
    ) -> Vec<CommandResult> {
        let members = match self.groups.lock().members(group_id) {
            Ok(members) => members,
            Err(e) => return vec![CommandResult::failed("", e)],
        };
        let commands: Vec<BatchCommand> = members
            .into_iter()
            .map(|device_id| BatchCommand::new(device_id, action, params.clone()))
            .collect();
        self.send_batch(&commands).await
    }

    fn relay_batch<'a>(
        device_ids: impl IntoIterator<Item = &'a str>,
        on: bool,
    ) -> Vec<BatchCommand> {
        device_ids
            .into_iter()
            .map(|id| BatchCommand::new(id, RELAY_ACTION, relay_params(0, on)))
            .collect()
    }

    async fn all_relays(&self, on: bool) -> Vec<CommandResult> {
        let devices: Vec<_> = self
            .index
            .controllable_devices()
            .into_iter()
            .filter(|d| is_relay_capable(&d.device_type))
            .collect();
        let commands = Self::relay_batch(devices.iter().map(|d| d.device_id.as_str()), on);
        self.send_batch(&commands).await
    }

    pub async fn all_relays_on(&self) -> Vec<CommandResult> {
        self.all_relays(true).await
    }

    pub async fn all_relays_off(&self) -> Vec<CommandResult> {
        self.all_relays(false).await
    }

    async fn group_relays(&self, group_id: &str, on: bool) -> Vec<CommandResult> {
        let members = match self.groups.lock().members(group_id) {
            Ok(members) => members,
            Err(e) => return vec![CommandResult::failed("", e)],
        };
        let targets: Vec<String> = members
            .into_iter()
            .filter(|id| {
                self.index
                    .device(id)
                    .is_some_and(|d| d.can_control() && is_relay_capable(&d.device_type))
            })
            .collect();
        let commands = Self::relay_batch(targets.iter().map(String::as_str), on);
        self.send_batch(&commands).await
    }

    pub async fn group_relays_on(&self, group_id: &str) -> Vec<CommandResult> {
        self.group_relays(group_id, true).await
    }

    pub async fn group_relays_off(&self, group_id: &str) -> Vec<CommandResult> {
        self.group_relays(group_id, false).await
    }

    // =========================================================================
    // Groups
    // =========================================================================

    pub fn create_group(
        &self,
        id: &str,
        name: &str,
        device_ids: &[String],
    ) -> Result<DeviceGroup, FleetError> {
        self.groups.lock().create(id, name, device_ids)
    }

    pub fn delete_group(&self, id: &str) -> bool {
        self.groups.lock().delete(id)
    }

    pub fn group(&self, id: &str) -> Option<DeviceGroup> {
        self.groups.lock().get(id).cloned()
    }

    pub fn groups(&self) -> Vec<DeviceGroup> {
        self.groups.lock().list()
    }

    pub fn add_to_group(&self, group_id: &str, device_id: &str) -> Result<bool, FleetError> {
        self.groups.lock().add_device(group_id, device_id)
    }

    pub fn remove_from_group(&self, group_id: &str, device_id: &str) -> Result<bool, FleetError> {
        self.groups.lock().remove_device(group_id, device_id)
    }

    // =========================================================================
    // Status and health
    // =========================================================================

    pub fn device_status(&self, device_id: &str) -> Option<DeviceStatus> {
        self.statuses.lock().get(device_id).cloned()
    }

    pub fn statuses(&self) -> Vec<DeviceStatus> {
        self.statuses.lock().all()
    }

    pub fn device_health(&self, device_id: &str) -> Option<DeviceHealth> {
        self.health.device_health(device_id)
    }

    pub fn unhealthy_devices(&self, threshold: Duration) -> Vec<DeviceHealth> {
        self.health.unhealthy(threshold)
    }

    pub fn health_summary(&self, threshold: Duration) -> HealthSummary {
        self.health.summary(threshold)
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Serialize groups and the status cache.
    pub fn export_snapshot(&self) -> Result<Vec<u8>, FleetError> {
        let snapshot = FleetSnapshot {
            version: SNAPSHOT_VERSION,
            groups: self.groups(),
            statuses: self.statuses(),
        };
        serde_json::to_vec_pretty(&snapshot).map_err(|e| FleetError::Snapshot(e.to_string()))
    }

    /// Replace groups and the status cache. Malformed input changes nothing.
    pub fn import_snapshot(&self, bytes: &[u8]) -> Result<(), FleetError> {
        let snapshot: FleetSnapshot =
            serde_json::from_slice(bytes).map_err(|e| FleetError::Snapshot(e.to_string()))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(FleetError::Snapshot(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        let groups = snapshot.groups.len();
        let statuses = snapshot.statuses.len();
        self.groups.lock().replace_all(snapshot.groups);
        self.statuses.lock().replace_all(snapshot.statuses);
        info!(groups, statuses, "Fleet state restored from snapshot");
        Ok(())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), FleetError> {
        let bytes = self.export_snapshot()?;
        write_atomic(path, &bytes).map_err(|e| FleetError::Snapshot(e.to_string()))
    }

    /// Returns whether a snapshot file was found and loaded.
    pub fn load_from(&self, path: &Path) -> Result<bool, FleetError> {
        if !path.exists() {
            return Ok(false);
        }
        let bytes = std::fs::read(path).map_err(|e| FleetError::Snapshot(e.to_string()))?;
        self.import_snapshot(&bytes)?;
        Ok(true)
    }
}

#[async_trait]
impl FleetControl for FleetOrchestrator {
    async fn send_command(
        &self,
        device_id: &str,
        action: &str,
        params: &Value,
    ) -> Result<(), FleetError> {
        Self::send_command(self, device_id, action, params).await
    }

    fn add_to_group(&self, group_id: &str, device_id: &str) -> Result<bool, FleetError> {
        Self::add_to_group(self, group_id, device_id)
    }
}
