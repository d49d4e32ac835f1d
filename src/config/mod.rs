//! # Configuration Management Module
//!
//! TOML configuration for the serial device, the history file, the chat session
//! and logging.
//!
//! ```rust,no_run
//! use vlcchat::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     Config::create_default("config.toml").await?;
//!     let config = Config::load("config.toml").await?;
//!     println!("Serial Port: {}", config.device.port);
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [device]
//! port = "/dev/ttyACM0"
//! baud_rate = 115200
//! mac = "AB"
//! n_retransmissions = 5
//! fec_threshold = 30
//! channel_busy_threshold = 20
//!
//! [storage]
//! history_file = ".data/history.json"
//!
//! [session]
//! ack_timeout_ms = 5000
//!
//! [logging]
//! level = "info"
//! ```
//!
//! Only `device.port` and `device.mac` are required; everything else has a default.

use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::validation::normalize_address;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub device: DeviceConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Local device address, sent with `a[MAC]` at startup
    pub mac: String,
    #[serde(default = "default_retransmissions")]
    pub n_retransmissions: u32,
    /// Raised to the device minimum of 10 when sent
    #[serde(default = "default_fec_threshold")]
    pub fec_threshold: u32,
    #[serde(default = "default_channel_busy_threshold")]
    pub channel_busy_threshold: u32,
    /// Device-side log verbosity; `c[2,0,L]` is only sent when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<u8>,
    /// Time the device needs after the port opens (it resets on connect).
    #[serde(default = "default_startup_settle_ms")]
    pub startup_settle_ms: u64,
    /// Pause after each configuration command
    #[serde(default = "default_command_gap_ms")]
    pub command_gap_ms: u64,
    /// Per-read serial timeout; bounds how long `stop()` waits for the reader.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// How long a received message waits for its statistics line.
    #[serde(default = "default_receive_stats_grace_ms")]
    pub receive_stats_grace_ms: u64,
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

fn default_baud_rate() -> u32 {
    115200
}
fn default_retransmissions() -> u32 {
    5
}
fn default_fec_threshold() -> u32 {
    30
}
fn default_channel_busy_threshold() -> u32 {
    20
}
fn default_startup_settle_ms() -> u64 {
    2000
}
fn default_command_gap_ms() -> u64 {
    100
}
fn default_read_timeout_ms() -> u64 {
    100
}
fn default_receive_stats_grace_ms() -> u64 {
    1000
}
fn default_stop_timeout_ms() -> u64 {
    2000
}

impl DeviceConfig {
    /// Settings for `port` and `mac` with every other field at its default.
    pub fn new(port: impl Into<String>, mac: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: default_baud_rate(),
            mac: mac.into(),
            n_retransmissions: default_retransmissions(),
            fec_threshold: default_fec_threshold(),
            channel_busy_threshold: default_channel_busy_threshold(),
            log_level: None,
            startup_settle_ms: default_startup_settle_ms(),
            command_gap_ms: default_command_gap_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            receive_stats_grace_ms: default_receive_stats_grace_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
        }
    }

    pub fn startup_settle(&self) -> Duration {
        Duration::from_millis(self.startup_settle_ms)
    }

    pub fn command_gap(&self) -> Duration {
        Duration::from_millis(self.command_gap_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn receive_stats_grace(&self) -> Duration {
        Duration::from_millis(self.receive_stats_grace_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_history_file")]
    pub history_file: String,
    /// Rewrite the history file after every change
    #[serde(default = "default_autosave")]
    pub autosave: bool,
}

fn default_history_file() -> String {
    ".data/history.json".to_string()
}
fn default_autosave() -> bool {
    true
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            history_file: default_history_file(),
            autosave: default_autosave(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// A sent message still outstanding after this long is marked failed.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
}

fn default_ack_timeout_ms() -> u64 {
    5000
}

impl SessionConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: default_ack_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl Config {
    /// Load, normalize and validate configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let mut config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        config.validate()?;
        config.device.mac = normalize_address(&config.device.mac)?;
        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        normalize_address(&self.device.mac)
            .map_err(|e| anyhow!("device.mac is invalid: {}", e))?;
        if self.device.port.trim().is_empty() {
            return Err(anyhow!("device.port must not be empty"));
        }
        if self.device.baud_rate == 0 {
            return Err(anyhow!("device.baud_rate must be greater than zero"));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device: DeviceConfig::new("/dev/ttyACM0", "AB"),
            storage: StorageConfig::default(),
            session: SessionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
