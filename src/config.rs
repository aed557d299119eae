use crate::error::{PortlockError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE_NAME: &str = "portlock.toml";
const DEFAULT_WAIT_MILLIS: u32 = u32::MAX;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PortlockConfig {
    #[serde(default)]
    pub locking: LockingConfig,
}

/// Selects how lock requests are satisfied. `Auto` probes the target
/// filesystem and picks the mandatory fast path only where native locks are
/// trustworthy; the other two values bypass the probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LockingMode {
    #[default]
    Auto,
    Portable,
    Mandatory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockingConfig {
    #[serde(default)]
    pub mode: LockingMode,

    /// Wait budget applied when the caller does not pass one.
    /// `0` means try-once, `0xFFFFFFFF` means wait forever.
    #[serde(default = "default_wait_millis")]
    pub default_wait_millis: u32,

    /// Directory holding legacy single-holder device locks (Unix).
    #[serde(default = "default_device_lock_dir")]
    pub device_lock_dir: PathBuf,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            mode: LockingMode::default(),
            default_wait_millis: DEFAULT_WAIT_MILLIS,
            device_lock_dir: default_device_lock_dir(),
        }
    }
}

fn default_wait_millis() -> u32 {
    DEFAULT_WAIT_MILLIS
}

fn default_device_lock_dir() -> PathBuf {
    PathBuf::from("/var/lock")
}

impl PortlockConfig {
    pub fn load(config_home: &Path) -> Result<Self> {
        let config_path = config_home.join(CONFIG_FILE_NAME);

        if !config_path.exists() {
            log::debug!("Config file not found at {config_path:?}, using defaults");
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&config_path)?;
        let config: PortlockConfig = toml::from_str(&contents).map_err(|e| {
            PortlockError::ConfigError(format!("Failed to parse portlock.toml: {e}"))
        })?;

        log::debug!("Loaded config from {config_path:?}");
        Ok(config)
    }

    pub fn save(&self, config_home: &Path) -> Result<()> {
        let config_path = config_home.join(CONFIG_FILE_NAME);

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| PortlockError::ConfigError(format!("Failed to serialize config: {e}")))?;

        fs::write(&config_path, contents)?;
        log::debug!("Saved config to {config_path:?}");
        Ok(())
    }
}
