//! Account and device records held by the index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::access::can_control;

/// A device an end user granted the integrator access to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountDevice {
    /// Unique across the whole fleet.
    pub device_id: String,
    pub device_type: String,
    /// Relay host terminating this device's push channel.
    pub host: String,
    /// Two-character access-group code.
    pub access_groups: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub online: bool,
    pub granted_at: DateTime<Utc>,
}

impl AccountDevice {
    pub fn new(
        device_id: impl Into<String>,
        device_type: impl Into<String>,
        host: impl Into<String>,
        access_groups: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_type: device_type.into(),
            host: host.into(),
            access_groups: access_groups.into(),
            name: String::new(),
            online: false,
            granted_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Whether the access grant allows sending commands.
    pub fn can_control(&self) -> bool {
        can_control(&self.access_groups)
    }
}

/// An end-user account and the devices it granted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub user_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub devices: Vec<AccountDevice>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Account {
    pub fn new(user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            name: None,
            email: None,
            devices: Vec::new(),
            created_at: now,
            last_activity: now,
        }
    }

    #[must_use]
    pub fn with_devices(mut self, devices: Vec<AccountDevice>) -> Self {
        self.devices = devices;
        self
    }

    pub fn device(&self, device_id: &str) -> Option<&AccountDevice> {
        self.devices.iter().find(|d| d.device_id == device_id)
    }

    pub(crate) fn device_mut(&mut self, device_id: &str) -> Option<&mut AccountDevice> {
        self.devices.iter_mut().find(|d| d.device_id == device_id)
    }
}
