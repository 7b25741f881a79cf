//! Runtime configuration, read from an optional TOML file.
//!
//! Every key has a default, so an empty or missing file yields a working
//! configuration. Lookup order is an explicit path, then
//! `$XDG_CONFIG_HOME/bootstick/config.toml`, then the built-in defaults.
use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub devices: DevicePolicy,
    pub timing: Timing,
    pub copy: CopySettings,
    pub privilege: PrivilegeSettings,
}

/// Which devices may be offered as targets at all.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DevicePolicy {
    /// Only surface devices attached through the USB bus.
    pub usb_only: bool,
    /// Accept USB devices whose `removable` flag is not set (many USB SSDs).
    pub include_non_removable: bool,
}

impl Default for DevicePolicy {
    fn default() -> Self {
        Self {
            usb_only: true,
            include_non_removable: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Timing {
    pub poll_interval_ms: u64,
    pub settle_delay_ms: u64,
    pub format_tick_ms: u64,
    pub monitor_interval_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            settle_delay_ms: 500,
            format_tick_ms: 100,
            monitor_interval_ms: 1000,
        }
    }
}

impl Timing {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn format_tick(&self) -> Duration {
        Duration::from_millis(self.format_tick_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CopySettings {
    /// Block size handed to `dd`, in its own suffix notation.
    pub block_size: String,
}

impl Default for CopySettings {
    fn default() -> Self {
        Self {
            block_size: "4M".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PrivilegeSettings {
    /// Escalation launchers, tried in order.
    pub launchers: Vec<PathBuf>,
}

impl Default for PrivilegeSettings {
    fn default() -> Self {
        Self {
            launchers: vec![
                PathBuf::from("/usr/bin/pkexec"),
                PathBuf::from("/bin/pkexec"),
            ],
        }
    }
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Configuration(format!("invalid config: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::from_toml(&text)
    }

    /// Loads `path` if given, otherwise the per-user file if it exists,
    /// otherwise the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.is_file() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("bootstick").join("config.toml"))
    }
}
