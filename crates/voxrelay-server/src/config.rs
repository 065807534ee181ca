//! Server configuration loading from file and environment variables.

use crate::codec::FrameCodec;
use crate::heartbeat::HeartbeatSettings;
use crate::session::RelaySettings;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;
use voxrelay_audio::{CombinerConfig, VadConfig};
use voxrelay_engine::EngineConfig;

/// Default bound on one client payload (decoded audio or text): 1 MiB.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Upstream engine settings.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Outbound audio combining.
    #[serde(default)]
    pub combiner: CombinerConfig,

    /// Inbound voice activity detection.
    #[serde(default)]
    pub vad: VadConfig,

    /// Client liveness probing.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Largest accepted client payload in bytes.
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "voxrelay_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Heartbeat timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub interval_secs: u64,

    /// Time allowed for a probe to reach the client socket.
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub timeout_secs: u64,

    /// Bound on any single write to the client socket.
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_max_message_bytes() -> usize {
    DEFAULT_MAX_MESSAGE_BYTES
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_heartbeat_interval_secs() -> u64 {
    20
}

fn default_heartbeat_timeout_secs() -> u64 {
    10
}

fn default_send_timeout_secs() -> u64 {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval_secs(),
            timeout_secs: default_heartbeat_timeout_secs(),
            send_timeout_secs: default_send_timeout_secs(),
        }
    }
}

impl HeartbeatConfig {
    pub fn settings(&self) -> HeartbeatSettings {
        HeartbeatSettings {
            interval: Duration::from_secs(self.interval_secs),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}

impl Config {
    /// Checks every section. Called once at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.max_message_bytes == 0 {
            return Err(ConfigError::Invalid(
                "server.max_message_bytes must be greater than zero".to_string(),
            ));
        }
        if self.heartbeat.interval_secs == 0
            || self.heartbeat.timeout_secs == 0
            || self.heartbeat.send_timeout_secs == 0
        {
            return Err(ConfigError::Invalid(
                "heartbeat timings must be greater than zero".to_string(),
            ));
        }
        self.engine
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        self.combiner
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        self.vad
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(())
    }

    pub fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.server.max_message_bytes)
    }

    /// Settings every session relay is built with.
    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings::new(
            &self.engine,
            self.codec(),
            self.combiner.clone(),
            self.vad.clone(),
            self.heartbeat.settings(),
        )
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Loads configuration from a TOML file, falling back to defaults, then
/// applies environment overrides and validates the result.
///
/// Environment variable overrides:
/// - `VOXRELAY_HOST` overrides `server.host`
/// - `VOXRELAY_PORT` overrides `server.port`
/// - `VOXRELAY_LOG_LEVEL` overrides `logging.level`
/// - `VOXRELAY_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `VOXRELAY_ENGINE_MODEL` overrides `engine.model`
/// - `VOXRELAY_ENGINE_VOICE` overrides `engine.voice`
/// - `GEMINI_API_KEY` overrides `engine.api_key`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed,
/// or if the merged configuration is invalid.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Applies overrides from `lookup`, which maps a variable name to its value.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(host) = lookup("VOXRELAY_HOST") {
        match host.parse() {
            Ok(parsed) => config.server.host = parsed,
            Err(_) => tracing::warn!(value = %host, "ignoring unparsable VOXRELAY_HOST"),
        }
    }
    if let Some(port) = lookup("VOXRELAY_PORT") {
        match port.parse() {
            Ok(parsed) => config.server.port = parsed,
            Err(_) => tracing::warn!(value = %port, "ignoring unparsable VOXRELAY_PORT"),
        }
    }
    if let Some(level) = lookup("VOXRELAY_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = lookup("VOXRELAY_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(model) = lookup("VOXRELAY_ENGINE_MODEL") {
        config.engine.model = model;
    }
    if let Some(voice) = lookup("VOXRELAY_ENGINE_VOICE") {
        config.engine.voice = voice;
    }
    if let Some(key) = lookup("GEMINI_API_KEY") {
        config.engine.api_key = key;
    }
}
