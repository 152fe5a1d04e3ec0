//! Configuration persistence
//!
//! TOML-based configuration for the meshcall client. The default file lives
//! in the platform-specific config directory:
//! - Linux: ~/.config/meshcall/config.toml
//! - Windows: %APPDATA%\meshcall\config.toml
//! - macOS: ~/Library/Application Support/meshcall/config.toml
//!
//! Every field has a default, so a partial file (or none at all) is valid.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application name used for configuration directory
const APP_NAME: &str = "meshcall";

/// Default public broker (WebSocket endpoint)
const DEFAULT_BROKER_URL: &str = "wss://broker.emqx.io:8084/mqtt";

/// Errors loading or saving configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Failed to access config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    /// WebSocket URL of the broker (ws:// or wss://)
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Prefix of every room topic
    pub topic_prefix: String,
    /// Time allowed for the CONNACK after opening the socket
    pub connect_timeout_ms: u64,
    /// PINGREQ interval
    pub keepalive_secs: u16,
    /// Unanswered PINGREQs tolerated before the link is declared dead
    pub max_missed_pings: u32,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_multiplier: f64,
    pub reconnect_jitter: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_BROKER_URL.to_string(),
            username: None,
            password: None,
            topic_prefix: APP_NAME.to_string(),
            connect_timeout_ms: 5_000,
            keepalive_secs: 20,
            max_missed_pings: 2,
            reconnect_initial_ms: 1_000,
            reconnect_max_ms: 30_000,
            reconnect_multiplier: 2.0,
            reconnect_jitter: true,
        }
    }
}

impl BrokerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.keepalive_secs))
    }
}

/// Presence settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PresenceConfig {
    /// How often the local peer re-announces itself
    pub announce_interval_secs: u64,
    /// Silence after which a peer is treated as gone
    pub peer_timeout_secs: u64,
    /// Platform string sent in `announce`
    pub platform: String,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            announce_interval_secs: 10,
            peer_timeout_secs: 30,
            platform: std::env::consts::OS.to_string(),
        }
    }
}

impl PresenceConfig {
    pub fn announce_interval(&self) -> Duration {
        Duration::from_secs(self.announce_interval_secs)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs)
    }
}

/// Negotiation settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NegotiationConfig {
    /// Time an ICE restart gets before the peer is declared failed
    pub ice_restart_timeout_ms: u64,
    /// Time an offer waits for its answer; one resend, then failed
    pub offer_timeout_ms: u64,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            ice_restart_timeout_ms: 15_000,
            offer_timeout_ms: 10_000,
        }
    }
}

impl NegotiationConfig {
    pub fn ice_restart_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_restart_timeout_ms)
    }

    pub fn offer_timeout(&self) -> Duration {
        Duration::from_millis(self.offer_timeout_ms)
    }
}

/// Remote microphone mapping settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RemoteMicConfig {
    pub enabled: bool,
    /// Time the target has to accept or reject
    pub request_timeout_ms: u64,
    /// Time allowed for the virtual driver install
    pub install_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Must be greater than `heartbeat_interval_ms`
    pub heartbeat_timeout_ms: u64,
    /// How long rejected/expired results stay visible
    pub result_display_ms: u64,
    /// Virtual audio driver passed to the installer
    pub driver_provider: String,
}

impl Default for RemoteMicConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            request_timeout_ms: 30_000,
            install_timeout_ms: 120_000,
            heartbeat_interval_ms: 2_000,
            heartbeat_timeout_ms: 7_000,
            result_display_ms: 3_000,
            driver_provider: default_driver_provider().to_string(),
        }
    }
}

fn default_driver_provider() -> &'static str {
    match std::env::consts::OS {
        "macos" => "blackhole",
        "windows" => "vb-cable",
        _ => "null-sink",
    }
}

/// Health monitor settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    pub stats_interval_ms: u64,
    pub network_interval_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            stats_interval_ms: 2_000,
            network_interval_ms: 1_000,
            max_reconnect_attempts: 5,
        }
    }
}

impl HealthConfig {
    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    pub fn network_interval(&self) -> Duration {
        Duration::from_millis(self.network_interval_ms)
    }
}

/// Complete client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MeshConfig {
    pub broker: BrokerConfig,
    pub presence: PresenceConfig,
    pub negotiation: NegotiationConfig,
    pub remote_mic: RemoteMicConfig,
    pub health: HealthConfig,
}

impl MeshConfig {
    /// Validate the configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = &self.broker.url;
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(ConfigError::Invalid(format!(
                "Invalid broker URL: {}. Must start with ws:// or wss://",
                url
            )));
        }

        let prefix = &self.broker.topic_prefix;
        if prefix.is_empty() || prefix.contains(['+', '#']) {
            return Err(ConfigError::Invalid(format!(
                "Invalid topic prefix: {:?}",
                prefix
            )));
        }

        if self.broker.keepalive_secs == 0 {
            return Err(ConfigError::Invalid(
                "keepalive_secs must be greater than 0".to_string(),
            ));
        }

        if self.broker.max_missed_pings == 0 {
            return Err(ConfigError::Invalid(
                "max_missed_pings must be greater than 0".to_string(),
            ));
        }

        if self.broker.reconnect_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "reconnect_multiplier must be at least 1.0".to_string(),
            ));
        }

        if self.presence.peer_timeout_secs <= self.presence.announce_interval_secs {
            return Err(ConfigError::Invalid(
                "peer_timeout_secs must be greater than announce_interval_secs".to_string(),
            ));
        }

        let negotiation = &self.negotiation;
        if negotiation.offer_timeout_ms == 0 || negotiation.ice_restart_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "negotiation timeouts must be greater than 0".to_string(),
            ));
        }

        let mic = &self.remote_mic;
        if mic.heartbeat_timeout_ms <= mic.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "heartbeat_timeout_ms ({}) must be greater than heartbeat_interval_ms ({})",
                mic.heartbeat_timeout_ms, mic.heartbeat_interval_ms
            )));
        }

        if mic.request_timeout_ms == 0 || mic.install_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "remote mic timeouts must be greater than 0".to_string(),
            ));
        }

        if self.health.stats_interval_ms == 0 || self.health.network_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "health poll intervals must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Get the default configuration file path
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Load configuration from `path`
pub fn load_config(path: &Path) -> Result<MeshConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let config: MeshConfig = toml::from_str(&content)?;
    config.validate()?;

    Ok(config)
}

/// Load from the default location, falling back to defaults when no file exists
pub fn load_default_config() -> Result<MeshConfig, ConfigError> {
    match default_config_path() {
        Some(path) if path.exists() => load_config(&path),
        _ => Ok(MeshConfig::default()),
    }
}

/// Save configuration to `path`, creating parent directories
pub fn save_config(config: &MeshConfig, path: &Path) -> Result<(), ConfigError> {
    config.validate()?;

    if let Some(dir) = path.parent() {
        if !dir.exists() {
            fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
    }

    let content = toml::to_string_pretty(config)?;
    fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(())
}
