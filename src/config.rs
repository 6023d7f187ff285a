//! Configuration handling for ovpn-pilot

use crate::launcher::{DaemonLauncher, Elevation};
use crate::management::{ChannelTimeouts, Retry, SessionSettings};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Name of the config file looked up in the working directory
pub const LOCAL_CONFIG: &str = "ovpn-pilot.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub management: ManagementConfig,
    pub daemon: DaemonConfig,
    pub profiles: ProfilesConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagementConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub poll_window_ms: u64,
    pub write_timeout_ms: u64,
    pub drain_limit_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub binary: String,
    pub elevation: Elevation,
    pub settle_ms: u64,
    pub connect_attempts: u32,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilesConfig {
    /// Root holding one sub-directory of `.ovpn` files per server
    pub dir: Option<PathBuf>,
    pub port_priorities: Vec<u16>,
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7505,
            connect_timeout_ms: 2000,
            poll_window_ms: 100,
            write_timeout_ms: 2000,
            drain_limit_ms: 5000,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            binary: "openvpn".to_string(),
            elevation: Elevation::Auto,
            settle_ms: 1000,
            connect_attempts: 30,
            poll_interval_ms: 1000,
        }
    }
}

impl Default for ProfilesConfig {
    fn default() -> Self {
        Self {
            dir: None,
            port_priorities: vec![443, 1194],
        }
    }
}

impl ProfilesConfig {
    /// Configured directory with `~` expanded, or `~/.openvpn/configs`
    pub fn root(&self) -> Option<PathBuf> {
        match &self.dir {
            Some(dir) => Some(expand_home(dir)),
            None => dirs::home_dir().map(|home| home.join(".openvpn").join("configs")),
        }
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Per-user config file location
    pub fn user_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("ovpn-pilot").join("config.toml"))
    }

    /// Load from the working directory, then the user config dir, else defaults
    pub fn discover() -> Result<Self, ConfigError> {
        let local = PathBuf::from(LOCAL_CONFIG);
        if local.exists() {
            debug!("Loading config from {}", local.display());
            return Self::load(&local);
        }

        if let Some(user) = Self::user_path().filter(|p| p.exists()) {
            debug!("Loading config from {}", user.display());
            return Self::load(&user);
        }

        info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn session_settings(&self) -> SessionSettings {
        let m = &self.management;
        SessionSettings {
            host: m.host.clone(),
            port: m.port,
            timeouts: ChannelTimeouts {
                connect: Duration::from_millis(m.connect_timeout_ms),
                poll: Duration::from_millis(m.poll_window_ms),
                write: Duration::from_millis(m.write_timeout_ms),
                drain_limit: Duration::from_millis(m.drain_limit_ms),
            },
            settle: Duration::from_millis(self.daemon.settle_ms),
            connect_retry: Retry::new(
                self.daemon.connect_attempts,
                Duration::from_millis(self.daemon.poll_interval_ms),
            ),
        }
    }

    pub fn launcher(&self) -> DaemonLauncher {
        DaemonLauncher::new(self.daemon.binary.clone(), self.daemon.elevation)
    }
}
