//! Configuration loading.
//!
//! Settings come from three layers, later ones winning:
//! 1. Built-in defaults
//! 2. JSON file (`<config_dir>/busbridge/config.json`, or an explicit path)
//! 3. `BUSBRIDGE_*` environment variables

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::bridge::DEFAULT_MAX_FRAME_SIZE;

/// Bridge address used when nothing else is configured.
pub const DEFAULT_ADDRESS: &str = "127.0.0.1:7000";

/// Default per-subscription delivery queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Configuration for a bridge connection.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Bridge address (`host:port`).
    pub address: String,
    /// Maximum frame payload size in bytes.
    pub max_frame_size: u32,
    /// Delivery queue capacity for each dispatcher subscription.
    pub queue_capacity: usize,
    /// Seconds between keepalive pings. `0` disables pings.
    pub ping_interval_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            ping_interval_secs: 0,
        }
    }
}

impl BridgeConfig {
    /// Default config file location, if the platform has a config directory.
    ///
    /// macOS: `~/Library/Application Support/busbridge/config.json`,
    /// Linux: `~/.config/busbridge/config.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("busbridge").join("config.json"))
    }

    /// Load configuration from a JSON file. Missing fields take defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config: {}", path.display()))
    }

    /// Load from the default path, or fall back to defaults if no file exists.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load_or_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Apply `BUSBRIDGE_*` environment variable overrides.
    ///
    /// # Errors
    ///
    /// Returns an error naming the variable if a numeric value does not parse.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    ///
    /// Recognized keys: `BUSBRIDGE_ADDRESS`, `BUSBRIDGE_MAX_FRAME_SIZE`,
    /// `BUSBRIDGE_QUEUE_CAPACITY`, `BUSBRIDGE_PING_INTERVAL_SECS`.
    ///
    /// # Errors
    ///
    /// Returns an error naming the key if a numeric value does not parse.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(address) = lookup("BUSBRIDGE_ADDRESS") {
            self.address = address;
        }
        if let Some(value) = lookup("BUSBRIDGE_MAX_FRAME_SIZE") {
            self.max_frame_size = parse_number("BUSBRIDGE_MAX_FRAME_SIZE", &value)?;
        }
        if let Some(value) = lookup("BUSBRIDGE_QUEUE_CAPACITY") {
            self.queue_capacity = parse_number("BUSBRIDGE_QUEUE_CAPACITY", &value)?;
        }
        if let Some(value) = lookup("BUSBRIDGE_PING_INTERVAL_SECS") {
            self.ping_interval_secs = parse_number("BUSBRIDGE_PING_INTERVAL_SECS", &value)?;
        }
        Ok(())
    }

    /// Keepalive interval, or `None` if pings are disabled.
    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_secs > 0).then(|| Duration::from_secs(self.ping_interval_secs))
    }
}

fn parse_number<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid value for {key}: {value:?}"))
}
