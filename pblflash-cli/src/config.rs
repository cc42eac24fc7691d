//! Configuration file support for pcl.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (PCL_*)
//! 3. Local config file (./pcl.toml)
//! 4. Global config file (~/.config/pcl/config.toml)
//!
//! A file named with `--config` replaces 3 and 4 and must load.

use anyhow::Context;
use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the local configuration file.
pub const LOCAL_CONFIG: &str = "pcl.toml";

/// Serial connection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub port: Option<String>,
    /// Line rate overriding the protocol default.
    pub baud: Option<u32>,
}

/// Relay daemon location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Daemon host.
    pub host: Option<String>,
    /// Daemon TCP port.
    pub service: Option<u16>,
}

/// Target device settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Expected product identifier.
    pub product_id: Option<u16>,
    /// Node address; selects the addressed protocol.
    pub address: Option<u8>,
}

/// Flash defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Image loaded when none is given on the command line.
    pub file: Option<PathBuf>,
    /// Run the application check after programming.
    #[serde(default)]
    pub check: bool,
    /// Start the application after programming.
    #[serde(default)]
    pub execute: bool,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Serial connection.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Relay daemon.
    #[serde(default)]
    pub relay: RelaySettings,
    /// Target device.
    #[serde(default)]
    pub device: DeviceConfig,
    /// Flash defaults.
    #[serde(default)]
    pub flash: FlashConfig,
}

impl Config {
    /// Load configuration from the global and local files.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load an optional configuration file; problems are logged and ignored.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "pcl").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.connection.port.is_some() {
            self.connection.port = other.connection.port;
        }
        if other.connection.baud.is_some() {
            self.connection.baud = other.connection.baud;
        }

        if other.relay.host.is_some() {
            self.relay.host = other.relay.host;
        }
        if other.relay.service.is_some() {
            self.relay.service = other.relay.service;
        }

        if other.device.product_id.is_some() {
            self.device.product_id = other.device.product_id;
        }
        if other.device.address.is_some() {
            self.device.address = other.device.address;
        }

        if other.flash.file.is_some() {
            self.flash.file = other.flash.file;
        }
        if other.flash.check {
            self.flash.check = true;
        }
        if other.flash.execute {
            self.flash.execute = true;
        }
    }
}
