//! Push channel options and the caller-side reconnect schedule.

use std::time::Duration;

use fleetlink_core::config::ChannelConfig;

/// How a push channel is dialed and kept alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOptions {
    pub port: u16,
    /// Request path of the relay's streaming endpoint.
    pub path: String,
    /// `wss://` when true, plain `ws://` otherwise.
    pub secure: bool,
    /// Period between protocol pings.
    pub keepalive_interval: Duration,
    /// Deadline for writing one ping.
    pub ping_timeout: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self::from(&ChannelConfig::default())
    }
}

impl From<&ChannelConfig> for ChannelOptions {
    fn from(config: &ChannelConfig) -> Self {
        Self {
            port: config.port,
            path: config.path.clone(),
            secure: config.secure,
            keepalive_interval: Duration::from_secs(config.keepalive_secs),
            ping_timeout: Duration::from_secs(config.ping_timeout_secs),
        }
    }
}

impl ChannelOptions {
    /// Channel URL for `host`, carrying `token` as the `t` query credential.
    pub fn url(&self, host: &str, token: &str) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        let sep = if self.path.contains('?') { '&' } else { '?' };
        format!(
            "{scheme}://{host}:{}{}{sep}t={}",
            self.port,
            self.path,
            urlencoding::encode(token)
        )
    }
}

/// Exponential backoff for re-dialing dead channels.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Applied to the delay after each failed attempt.
    pub multiplier: f64,
    /// Give up after this many consecutive failures (None = never).
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt `attempt` (0-indexed).
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.powi(attempt.min(64) as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    pub const fn should_retry(&self, attempt: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempt < max,
            None => true,
        }
    }
}
