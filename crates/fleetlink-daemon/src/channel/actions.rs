//! Convenience wrappers for common device actions.

use serde_json::{Value, json};

use super::client::PushChannel;
use super::error::ChannelError;

pub const RELAY_ACTION: &str = "relay";
pub const COVER_ACTION: &str = "roller";
pub const LIGHT_ACTION: &str = "light";

/// Direction for a cover (roller shutter) motion command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverMotion {
    Open,
    Close,
    Stop,
}

impl CoverMotion {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Close => "close",
            Self::Stop => "stop",
        }
    }
}

const fn turn(on: bool) -> &'static str {
    if on { "on" } else { "off" }
}

pub fn relay_params(channel: u32, on: bool) -> Value {
    json!({ "id": channel, "turn": turn(on) })
}

/// `position` is a percentage; values above 100 are clamped.
pub fn cover_position_params(channel: u32, position: u8) -> Value {
    json!({ "id": channel, "go": "to_pos", "roller_pos": position.min(100) })
}

pub fn cover_motion_params(channel: u32, motion: CoverMotion) -> Value {
    json!({ "id": channel, "go": motion.as_str() })
}

pub fn light_params(channel: u32, on: bool, brightness: Option<u8>) -> Value {
    let mut params = json!({ "id": channel, "turn": turn(on) });
    if let Some(level) = brightness {
        params["brightness"] = json!(level.min(100));
    }
    params
}

impl PushChannel {
    pub async fn relay(&self, device_id: &str, channel: u32, on: bool) -> Result<(), ChannelError> {
        self.send_command(device_id, RELAY_ACTION, &relay_params(channel, on))
            .await
    }

    pub async fn cover_to_position(
        &self,
        device_id: &str,
        channel: u32,
        position: u8,
    ) -> Result<(), ChannelError> {
        self.send_command(
            device_id,
            COVER_ACTION,
            &cover_position_params(channel, position),
        )
        .await
    }

    pub async fn cover_open(&self, device_id: &str, channel: u32) -> Result<(), ChannelError> {
        self.cover_move(device_id, channel, CoverMotion::Open).await
    }

    pub async fn cover_close(&self, device_id: &str, channel: u32) -> Result<(), ChannelError> {
        self.cover_move(device_id, channel, CoverMotion::Close).await
    }

    pub async fn cover_stop(&self, device_id: &str, channel: u32) -> Result<(), ChannelError> {
        self.cover_move(device_id, channel, CoverMotion::Stop).await
    }

    async fn cover_move(
        &self,
        device_id: &str,
        channel: u32,
        motion: CoverMotion,
    ) -> Result<(), ChannelError> {
        self.send_command(device_id, COVER_ACTION, &cover_motion_params(channel, motion))
            .await
    }

    /// Dimmable light on/off, optionally setting brightness (0-100).
    pub async fn light(
        &self,
        device_id: &str,
        channel: u32,
        on: bool,
        brightness: Option<u8>,
    ) -> Result<(), ChannelError> {
        self.send_command(device_id, LIGHT_ACTION, &light_params(channel, on, brightness))
            .await
    }
}
