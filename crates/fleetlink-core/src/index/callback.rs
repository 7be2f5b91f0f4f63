//! Grant/revoke webhook payloads.

use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::IndexError;
use super::model::AccountDevice;

/// Payload the cloud posts when an end user grants or revokes a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCallback {
    pub user_id: String,
    pub device_id: String,
    #[serde(default)]
    pub device_type: String,
    #[serde(default)]
    pub access_groups: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub name: String,
    pub action: String,
}

/// Recognized callback actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Add,
    Remove,
}

impl CallbackAction {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Remove => "remove",
        }
    }
}

impl FromStr for CallbackAction {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(Self::Add),
            "remove" => Ok(Self::Remove),
            other => Err(IndexError::UnknownCallbackAction(other.to_string())),
        }
    }
}

impl std::fmt::Display for CallbackAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl DeviceCallback {
    /// Parse the action field.
    pub fn parsed_action(&self) -> Result<CallbackAction, IndexError> {
        self.action.parse()
    }

    /// The device record a grant creates.
    pub fn to_device(&self) -> AccountDevice {
        AccountDevice {
            device_id: self.device_id.clone(),
            device_type: self.device_type.clone(),
            host: self.host.clone(),
            access_groups: self.access_groups.clone(),
            name: self.name.clone(),
            online: false,
            granted_at: Utc::now(),
        }
    }
}
