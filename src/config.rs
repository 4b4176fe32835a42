use crate::backoff::ReconnectPolicy;
use crate::transport::DEFAULT_MAX_FRAME_LEN;
use anyhow::Context;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// Bound on each connect attempt, each write, and the flush on close
    /// Default is 5000 (5 seconds)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Largest accepted frame in bytes, excluding the newline delimiter
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,

    /// Treat the connection as failed after this long without an incoming frame
    /// 0 disables the check
    #[serde(default)]
    pub read_idle_timeout_ms: u64,

    #[serde(default = "default_true")]
    pub keepalive: bool,

    /// Disable Nagle's algorithm on TCP streams
    #[serde(default = "default_true")]
    pub nodelay: bool,

    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_max_frame_len() -> usize {
    DEFAULT_MAX_FRAME_LEN
}

fn default_true() -> bool {
    true
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_frame_len: default_max_frame_len(),
            read_idle_timeout_ms: 0,
            keepalive: true,
            nodelay: true,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ConnectionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn read_idle_timeout(&self) -> Option<Duration> {
        match self.read_idle_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_read_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_idle_timeout_ms = timeout.map_or(0, |t| t.as_millis() as u64);
        self
    }

    /// Load config from ~/.config/connkit/config.toml
    /// Returns default settings if file doesn't exist or fails to parse
    pub fn load() -> Self {
        let Some(path) = config_path() else {
            log::warn!("Could not determine config directory, using defaults");
            return Self::default();
        };

        if !path.exists() {
            log::debug!("No config file found at {}, using defaults", path.display());
            return Self::default();
        }

        match Self::load_from(&path) {
            Ok(config) => {
                log::info!("Loaded config from: {}", path.display());
                config
            }
            Err(e) => {
                log::warn!("{:#}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Load config from an explicit path
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Save config to an explicit path
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let toml = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(path, toml)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        log::info!("Saved config to: {}", path.display());

        Ok(())
    }
}

/// Get the path to the config file: ~/.config/connkit/config.toml
pub fn config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "connkit").map(|dirs| dirs.config_dir().join("config.toml"))
}
