//! Batch command types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Device types that expose a switchable relay on channel 0.
pub const RELAY_DEVICE_TYPES: &[&str] = &[
    "SHSW-1", "SHSW-PM", "SHSW-21", "SHSW-25", "SHSW-44", "SHSW-L", "SHPLG-1", "SHPLG-S",
    "SHPLG-U1", "SHPLG2-1", "SHUNI-1",
];

pub fn is_relay_capable(device_type: &str) -> bool {
    RELAY_DEVICE_TYPES.contains(&device_type)
}

/// One command in a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchCommand {
    pub device_id: String,
    pub action: String,
    #[serde(default)]
    pub params: Value,
}

impl BatchCommand {
    pub fn new(device_id: impl Into<String>, action: impl Into<String>, params: Value) -> Self {
        Self {
            device_id: device_id.into(),
            action: action.into(),
            params,
        }
    }
}

/// Outcome of one command in a batch or group send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub device_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResult {
    pub fn ok(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            success: true,
            error: None,
        }
    }

    pub fn failed(device_id: impl Into<String>, error: impl ToString) -> Self {
        Self {
            device_id: device_id.into(),
            success: false,
            error: Some(error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_capability() {
        assert!(is_relay_capable("SHSW-1"));
        assert!(is_relay_capable("SHPLG-S"));
        assert!(!is_relay_capable("SHHT-1"));
        assert!(!is_relay_capable(""));
    }

    #[test]
    fn result_constructors() {
        let results = vec![CommandResult::ok("a"), CommandResult::failed("b", "boom")];
        assert!(results[0].success && !results[1].success);
        assert_eq!(results[1].error.as_deref(), Some("boom"));
    }
}
