//! Per-device health bookkeeping.
//!
//! Entries are created lazily on first observation and never expire; the map
//! is bounded by fleet size.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Health counters for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceHealth {
    pub device_id: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub activity_count: u64,
    pub online_count: u64,
    pub offline_count: u64,
    pub online: bool,
}

impl DeviceHealth {
    fn new(device_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.to_string(),
            first_seen: now,
            last_seen: now,
            activity_count: 0,
            online_count: 0,
            offline_count: 0,
            online: false,
        }
    }

    /// Not seen within `threshold` of `now`, or currently offline.
    pub fn is_unhealthy_at(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
        !self.online || now.signed_duration_since(self.last_seen) > threshold
    }
}

/// Aggregate health counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthSummary {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub unhealthy: usize,
}

/// Thread-safe health tracker keyed by device id.
#[derive(Debug, Default)]
pub struct HealthMonitor {
    devices: Mutex<HashMap<String, DeviceHealth>>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record inbound activity (a status event) for a device.
    pub fn record_activity(&self, device_id: &str) {
        self.record_activity_at(device_id, Utc::now());
    }

    pub(crate) fn record_activity_at(&self, device_id: &str, now: DateTime<Utc>) {
        let mut devices = self.devices.lock();
        let entry = devices
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceHealth::new(device_id, now));
        entry.activity_count += 1;
        entry.online = true;
        entry.last_seen = now;
    }

    /// Record an online/offline transition.
    pub fn record_online_status(&self, device_id: &str, online: bool) {
        self.record_online_status_at(device_id, online, Utc::now());
    }

    pub(crate) fn record_online_status_at(
        &self,
        device_id: &str,
        online: bool,
        now: DateTime<Utc>,
    ) {
        let mut devices = self.devices.lock();
        let entry = devices
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceHealth::new(device_id, now));
        if online {
            entry.online_count += 1;
        } else {
            entry.offline_count += 1;
        }
        entry.online = online;
        entry.last_seen = now;
    }

    pub fn device_health(&self, device_id: &str) -> Option<DeviceHealth> {
        self.devices.lock().get(device_id).cloned()
    }

    /// All tracked devices, sorted by device id.
    pub fn all(&self) -> Vec<DeviceHealth> {
        let mut all: Vec<_> = self.devices.lock().values().cloned().collect();
        all.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        all
    }

    /// Devices not seen within `threshold` or currently offline, sorted by id.
    pub fn unhealthy(&self, threshold: Duration) -> Vec<DeviceHealth> {
        self.unhealthy_at(threshold, Utc::now())
    }

    pub(crate) fn unhealthy_at(
        &self,
        threshold: Duration,
        now: DateTime<Utc>,
    ) -> Vec<DeviceHealth> {
        let mut unhealthy: Vec<_> = self
            .devices
            .lock()
            .values()
            .filter(|h| h.is_unhealthy_at(threshold, now))
            .cloned()
            .collect();
        unhealthy.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        unhealthy
    }

    pub fn summary(&self, threshold: Duration) -> HealthSummary {
        let now = Utc::now();
        let devices = self.devices.lock();
        let mut summary = HealthSummary {
            total: devices.len(),
            ..HealthSummary::default()
        };
        for health in devices.values() {
            if health.online {
                summary.online += 1;
            } else {
                summary.offline += 1;
            }
            if health.is_unhealthy_at(threshold, now) {
                summary.unhealthy += 1;
            }
        }
        summary
    }
}
