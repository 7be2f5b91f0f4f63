//! Last-known device status cache fed by inbound channel events.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What the fleet last heard from a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub device_id: String,
    /// Relay host the last event arrived on.
    pub host: String,
    #[serde(default)]
    pub status: Option<Value>,
    #[serde(default)]
    pub settings: Option<Value>,
    #[serde(default)]
    pub online: bool,
    pub last_seen: DateTime<Utc>,
}

impl DeviceStatus {
    fn new(device_id: &str, host: &str, now: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.to_string(),
            host: host.to_string(),
            status: None,
            settings: None,
            online: false,
            last_seen: now,
        }
    }
}

/// Entries are created on first event and never removed.
#[derive(Debug, Default, Clone)]
pub struct StatusCache {
    entries: HashMap<String, DeviceStatus>,
}

impl StatusCache {
    fn entry(&mut self, device_id: &str, host: &str, now: DateTime<Utc>) -> &mut DeviceStatus {
        let entry = self
            .entries
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceStatus::new(device_id, host, now));
        host.clone_into(&mut entry.host);
        entry.last_seen = now;
        entry
    }

    /// A status event also proves the device is online.
    pub fn record_status(
        &mut self,
        device_id: &str,
        host: &str,
        status: &Value,
        now: DateTime<Utc>,
    ) {
        let entry = self.entry(device_id, host, now);
        entry.status = Some(status.clone());
        entry.online = true;
    }

    pub fn record_settings(
        &mut self,
        device_id: &str,
        host: &str,
        settings: &Value,
        now: DateTime<Utc>,
    ) {
        self.entry(device_id, host, now).settings = Some(settings.clone());
    }

    pub fn record_online(&mut self, device_id: &str, host: &str, online: bool, now: DateTime<Utc>) {
        self.entry(device_id, host, now).online = online;
    }

    pub fn get(&self, device_id: &str) -> Option<&DeviceStatus> {
        self.entries.get(device_id)
    }

    /// All entries sorted by device id.
    pub fn all(&self) -> Vec<DeviceStatus> {
        let mut all: Vec<_> = self.entries.values().cloned().collect();
        all.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        all
    }

    pub fn replace_all(&mut self, statuses: Vec<DeviceStatus>) {
        self.entries = statuses
            .into_iter()
            .map(|s| (s.device_id.clone(), s))
            .collect();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn settings_do_not_change_online_state() {
        let mut cache = StatusCache::default();
        let t0 = Utc::now();
        cache.record_settings("d1", "h", &json!({"name": "x"}), t0);
        assert!(!cache.get("d1").unwrap().online);

        let t1 = t0 + chrono::Duration::seconds(5);
        cache.record_status("d1", "h", &json!({"ison": true}), t1);
        let entry = cache.get("d1").unwrap();
        assert!(entry.online);
        assert_eq!(entry.last_seen, t1);
        assert_eq!(entry.settings, Some(json!({"name": "x"})));

        cache.record_settings("d1", "h", &json!({"name": "y"}), t1);
        assert!(cache.get("d1").unwrap().online);
    }

    #[test]
    fn online_changes_flag_and_last_seen() {
        let mut cache = StatusCache::default();
        let t0 = Utc::now();
        cache.record_status("d1", "h", &json!({}), t0);
        let t1 = t0 + chrono::Duration::seconds(1);
        cache.record_online("d1", "h", false, t1);
        let entry = cache.get("d1").unwrap();
        assert!(!entry.online);
        assert_eq!(entry.last_seen, t1);
        assert_eq!(cache.all().len(), 1);
    }
}
