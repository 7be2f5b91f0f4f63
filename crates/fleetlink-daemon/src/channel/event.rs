//! Wire messages carried by the push channel.
//!
//! Inbound messages are JSON objects routed by a string `event` discriminator
//! of the form `<Source>:<Kind>`. Only the kind is interpreted.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use super::error::ChannelError;

/// Discriminator of outbound commands.
pub const ACTION_REQUEST_EVENT: &str = "Integrator:ActionRequest";

/// A decoded inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Device status changed; `status` is passed through untouched.
    StatusChanged {
        device_id: String,
        status: Value,
        timestamp: DateTime<Utc>,
    },
    /// Device settings changed; `settings` is passed through untouched.
    SettingsChanged {
        device_id: String,
        settings: Value,
        timestamp: DateTime<Utc>,
    },
    OnlineChanged {
        device_id: String,
        online: bool,
        timestamp: DateTime<Utc>,
    },
    /// Valid JSON with an event name this layer does not handle.
    Unrecognized { event: String },
}

impl ChannelEvent {
    /// Decode one inbound JSON message.
    pub fn decode(message: &Value) -> Result<Self, ChannelError> {
        let event = message
            .get("event")
            .and_then(Value::as_str)
            .ok_or_else(|| ChannelError::Decode("missing event discriminator".to_string()))?;
        let kind = event.rsplit_once(':').map_or(event, |(_, kind)| kind);

        match kind {
            "StatusOnChange" => Ok(Self::StatusChanged {
                device_id: device_id(message)?,
                status: message.get("status").cloned().unwrap_or(Value::Null),
                timestamp: timestamp(message),
            }),
            "Settings" => Ok(Self::SettingsChanged {
                device_id: device_id(message)?,
                settings: message.get("settings").cloned().unwrap_or(Value::Null),
                timestamp: timestamp(message),
            }),
            "Online" => Ok(Self::OnlineChanged {
                device_id: device_id(message)?,
                online: online_flag(message.get("online"))?,
                timestamp: timestamp(message),
            }),
            _ => Ok(Self::Unrecognized {
                event: event.to_string(),
            }),
        }
    }

    pub fn device_id(&self) -> Option<&str> {
        match self {
            Self::StatusChanged { device_id, .. }
            | Self::SettingsChanged { device_id, .. }
            | Self::OnlineChanged { device_id, .. } => Some(device_id),
            Self::Unrecognized { .. } => None,
        }
    }
}

fn device_id(message: &Value) -> Result<String, ChannelError> {
    message
        .get("device_id")
        .or_else(|| message.get("device"))
        .and_then(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .ok_or_else(|| ChannelError::Decode("missing device id".to_string()))
}

/// `online` arrives as a boolean or as `0`/`1`.
fn online_flag(value: Option<&Value>) -> Result<bool, ChannelError> {
    match value {
        Some(Value::Bool(b)) => Ok(*b),
        Some(Value::Number(n)) => Ok(n.as_f64().is_some_and(|v| v != 0.0)),
        other => Err(ChannelError::Decode(format!("invalid online flag: {other:?}"))),
    }
}

/// Event time in unix seconds, or now when absent.
#[allow(clippy::cast_possible_truncation)]
fn timestamp(message: &Value) -> DateTime<Utc> {
    message
        .get("ts")
        .or_else(|| message.get("timestamp"))
        .and_then(Value::as_f64)
        .and_then(|secs| DateTime::from_timestamp(secs.trunc() as i64, 0))
        .unwrap_or_else(Utc::now)
}

/// Outbound device command.
#[derive(Debug, Clone, Serialize)]
pub struct ActionRequest<'a> {
    pub event: &'static str,
    pub device_id: &'a str,
    pub action: &'a str,
    pub params: &'a Value,
}

impl<'a> ActionRequest<'a> {
    pub const fn new(device_id: &'a str, action: &'a str, params: &'a Value) -> Self {
        Self {
            event: ACTION_REQUEST_EVENT,
            device_id,
            action,
            params,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_change_passes_payload_through() {
        let event = ChannelEvent::decode(&json!({
            "event": "Shelly:StatusOnChange",
            "device_id": "d1",
            "status": {"relays": [{"ison": true}]},
            "ts": 1_700_000_000
        }))
        .unwrap();
        match event {
            ChannelEvent::StatusChanged {
                device_id,
                status,
                timestamp,
            } => {
                assert_eq!(device_id, "d1");
                assert_eq!(status["relays"][0]["ison"], json!(true));
                assert_eq!(timestamp.timestamp(), 1_700_000_000);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn legacy_device_field_and_numeric_online() {
        let event = ChannelEvent::decode(&json!({
            "event": "Shelly:Online",
            "device": "d2",
            "online": 0
        }))
        .unwrap();
        assert!(matches!(
            event,
            ChannelEvent::OnlineChanged { ref device_id, online: false, .. } if device_id == "d2"
        ));
    }

    #[test]
    fn settings_event() {
        let event = ChannelEvent::decode(&json!({
            "event": "Shelly:Settings",
            "device_id": "d3",
            "settings": {"name": "Porch"}
        }))
        .unwrap();
        assert_eq!(event.device_id(), Some("d3"));
        assert!(matches!(event, ChannelEvent::SettingsChanged { .. }));
    }

    #[test]
    fn unknown_event_is_unrecognized_not_error() {
        let event = ChannelEvent::decode(&json!({"event": "Shelly:Firmware", "device_id": "d1"}))
            .unwrap();
        assert_eq!(
            event,
            ChannelEvent::Unrecognized {
                event: "Shelly:Firmware".into()
            }
        );
        assert!(event.device_id().is_none());
    }

    #[test]
    fn malformed_events_are_decode_errors() {
        assert!(ChannelEvent::decode(&json!({"device_id": "d1"})).is_err());
        assert!(ChannelEvent::decode(&json!({"event": "Shelly:StatusOnChange"})).is_err());
        assert!(
            ChannelEvent::decode(&json!({"event": "Shelly:Online", "device_id": "d1"})).is_err()
        );
    }

    #[test]
    fn action_request_wire_shape() {
        let params = json!({"id": 0, "turn": "on"});
        let encoded = serde_json::to_value(ActionRequest::new("d1", "relay", &params)).unwrap();
        assert_eq!(
            encoded,
            json!({
                "event": "Integrator:ActionRequest",
                "device_id": "d1",
                "action": "relay",
                "params": {"id": 0, "turn": "on"}
            })
        );
    }
}
