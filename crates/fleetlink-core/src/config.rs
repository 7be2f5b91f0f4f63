//! Configuration resolution for fleetlink.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/fleetlink/settings.json) or an explicit file
//! 3. Environment variables (`FLEETLINK_*`)
//! 4. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::consent::DEFAULT_CONSENT_HOST;
use crate::error::{Error, Result};

/// Complete fleetlink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub integrator: IntegratorConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub health: HealthConfig,
    /// Regional API endpoints. Empty means single-region operation against
    /// `integrator.api_base`.
    #[serde(default)]
    pub regions: Vec<RegionConfig>,
    /// Region used for relay hosts whose region code is unknown.
    #[serde(default)]
    pub default_region: Option<String>,
    /// Directory holding index/fleet/provisioning snapshots.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            integrator: IntegratorConfig::default(),
            session: SessionConfig::default(),
            channel: ChannelConfig::default(),
            health: HealthConfig::default(),
            regions: Vec::new(),
            default_region: None,
            state_dir: None,
            log_level: default_log_level(),
        }
    }
}

/// Integrator identity and cloud endpoints.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegratorConfig {
    /// Integrator tag issued by the cloud vendor.
    pub tag: String,
    /// Secret token paired with the tag.
    #[serde(default, skip_serializing)]
    pub secret: String,
    /// Base URL of the authentication API.
    pub api_base: String,
    /// Host serving the end-user consent page.
    pub consent_host: String,
    /// Webhook URL the cloud calls on grant/revoke.
    pub callback_url: Option<String>,
    /// Local address the grant/revoke intake listens on (e.g. `0.0.0.0:8089`).
    pub callback_listen: Option<String>,
}

impl Default for IntegratorConfig {
    fn default() -> Self {
        Self {
            tag: String::new(),
            secret: String::new(),
            api_base: "https://api.shelly.cloud".to_string(),
            consent_host: DEFAULT_CONSENT_HOST.to_string(),
            callback_url: None,
            callback_listen: None,
        }
    }
}

impl std::fmt::Debug for IntegratorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegratorConfig")
            .field("tag", &self.tag)
            .field("secret", &"<redacted>")
            .field("api_base", &self.api_base)
            .field("consent_host", &self.consent_host)
            .field("callback_url", &self.callback_url)
            .field("callback_listen", &self.callback_listen)
            .finish()
    }
}

/// Token lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Refresh when less than this much lifetime remains (seconds).
    pub refresh_buffer_secs: u64,
    /// Minimum spacing between re-authentication attempts (seconds). Also the
    /// auto-refresh tick.
    pub min_refresh_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            refresh_buffer_secs: 5 * 60,
            min_refresh_interval_secs: 60,
        }
    }
}

impl SessionConfig {
    pub const fn refresh_buffer(&self) -> Duration {
        Duration::from_secs(self.refresh_buffer_secs)
    }

    pub const fn min_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.min_refresh_interval_secs)
    }
}

/// Push channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub port: u16,
    pub path: String,
    /// Use `wss://` (true) or plain `ws://` (false).
    pub secure: bool,
    pub keepalive_secs: u64,
    pub ping_timeout_secs: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            port: 6113,
            path: "/shelly/wss/hk_sock".to_string(),
            secure: true,
            keepalive_secs: 30,
            ping_timeout_secs: 5,
        }
    }
}

/// Health tracking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// A device not seen for this long counts as unhealthy (seconds).
    pub unhealthy_after_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            unhealthy_after_secs: 10 * 60,
        }
    }
}

/// One geographic authentication region.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegionConfig {
    /// Region code as it appears in relay hostnames (e.g. `eu`).
    pub name: String,
    pub api_base: String,
}

impl Config {
    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.integrator.tag.is_empty() {
            return Err(Error::Config("integrator tag is required".to_string()));
        }
        if self.integrator.secret.is_empty() {
            return Err(Error::Config("integrator secret is required".to_string()));
        }
        if self.session.min_refresh_interval_secs == 0 {
            return Err(Error::Config(
                "session.min_refresh_interval_secs must be positive".to_string(),
            ));
        }
        if self.channel.keepalive_secs == 0 || self.channel.ping_timeout_secs == 0 {
            return Err(Error::Config(
                "channel keepalive and ping timeout must be positive".to_string(),
            ));
        }
        if let Some(default) = &self.default_region
            && !self.regions.iter().any(|r| &r.name == default)
        {
            return Err(Error::Config(format!(
                "default region {default} is not among the configured regions"
            )));
        }
        Ok(())
    }

    /// Directory used for snapshots, falling back to the platform data dir.
    pub fn resolved_state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("fleetlink")
        })
    }
}

/// Load configuration with hierarchical resolution.
///
/// When `explicit` is given it replaces the global settings file.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    let file = explicit.map(Path::to_path_buf).or_else(global_config_path);
    if let Some(path) = file {
        if path.exists() {
            let overlay = load_config_file(&path)?;
            merge_config(&mut config, overlay);
        } else if explicit.is_some() {
            return Err(Error::Config(format!(
                "Config file {} does not exist",
                path.display()
            )));
        }
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("fleetlink").join("settings.json"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    // A file never stores the secret, so keep whatever is already known.
    let secret = std::mem::take(&mut base.integrator.secret);
    base.integrator = overlay.integrator;
    if base.integrator.secret.is_empty() {
        base.integrator.secret = secret;
    }

    base.session = overlay.session;
    base.channel = overlay.channel;
    base.health = overlay.health;

    if !overlay.regions.is_empty() {
        base.regions = overlay.regions;
    }
    if overlay.default_region.is_some() {
        base.default_region = overlay.default_region;
    }
    if overlay.state_dir.is_some() {
        base.state_dir = overlay.state_dir;
    }
    base.log_level = overlay.log_level;
}

/// Apply `FLEETLINK_*` overrides using the given variable lookup.
pub fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(val) = var("FLEETLINK_INTEGRATOR_TAG") {
        config.integrator.tag = val;
    }
    if let Some(val) = var("FLEETLINK_INTEGRATOR_SECRET") {
        config.integrator.secret = val;
    }
    if let Some(val) = var("FLEETLINK_API_BASE") {
        config.integrator.api_base = val;
    }
    if let Some(val) = var("FLEETLINK_CALLBACK_URL") {
        config.integrator.callback_url = Some(val);
    }
    if let Some(val) = var("FLEETLINK_CALLBACK_LISTEN") {
        config.integrator.callback_listen = Some(val);
    }
    if let Some(n) = var("FLEETLINK_CHANNEL_PORT").and_then(|v| v.parse().ok()) {
        config.channel.port = n;
    }
    if let Some(val) = var("FLEETLINK_CHANNEL_SECURE") {
        config.channel.secure = !matches!(val.as_str(), "0" | "false" | "no");
    }
    if let Some(n) = var("FLEETLINK_REFRESH_BUFFER_SECS").and_then(|v| v.parse().ok()) {
        config.session.refresh_buffer_secs = n;
    }
    if let Some(val) = var("FLEETLINK_STATE_DIR") {
        config.state_dir = Some(PathBuf::from(val));
    }
    if let Some(val) = var("FLEETLINK_LOG_LEVEL") {
        config.log_level = val;
    }
}
