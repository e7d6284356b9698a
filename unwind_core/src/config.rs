//! Configuration file support for unwind.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/unwind/config.toml`.

use crate::timing::TimerSettings;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub user: UserConfig,

    #[serde(default)]
    pub timers: TimersConfig,

    #[serde(default)]
    pub analytics: AnalyticsConfig,
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Who is signed in on this device
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserConfig {
    /// Unset means nobody is signed in
    #[serde(default)]
    pub user_id: Option<String>,

    #[serde(default = "default_device_type")]
    pub device_type: String,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            user_id: None,
            device_type: default_device_type(),
        }
    }
}

/// Session timer periods
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimersConfig {
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,

    #[serde(default = "default_autosave_seconds")]
    pub autosave_seconds: u64,

    #[serde(default = "default_remote_sync_debounce_ms")]
    pub remote_sync_debounce_ms: u64,
}

impl Default for TimersConfig {
    fn default() -> Self {
        Self {
            tick_seconds: default_tick_seconds(),
            autosave_seconds: default_autosave_seconds(),
            remote_sync_debounce_ms: default_remote_sync_debounce_ms(),
        }
    }
}

impl From<&TimersConfig> for TimerSettings {
    fn from(config: &TimersConfig) -> Self {
        TimerSettings {
            tick_seconds: config.tick_seconds,
            autosave_seconds: config.autosave_seconds,
            remote_sync_debounce_ms: config.remote_sync_debounce_ms,
        }
    }
}

/// Analytics output
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Also append events to `analytics.jsonl` in the data directory
    #[serde(default)]
    pub jsonl: bool,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            jsonl: false,
        }
    }
}

/// Upper bounds for the timer periods
pub const MAX_TICK_SECONDS: u64 = 60;
pub const MAX_AUTOSAVE_SECONDS: u64 = 3600;
pub const MAX_REMOTE_SYNC_DEBOUNCE_MS: u64 = 600_000;

fn check_range(field: &str, value: u64, min: u64, max: u64) -> Result<()> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "{} must be between {} and {}, got {}",
            field, min, max, value
        )))
    }
}

// Default value functions
fn default_data_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".local/share")
    });
    base.join("unwind")
}

fn default_device_type() -> String {
    "cli".into()
}

fn default_tick_seconds() -> u64 {
    1
}

fn default_autosave_seconds() -> u64 {
    5
}

fn default_remote_sync_debounce_ms() -> u64 {
    1500
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".config")
        });
        base.join("unwind").join("config.toml")
    }

    /// Reject timer periods the session manager cannot run with
    pub fn validate(&self) -> Result<()> {
        let timers = &self.timers;
        check_range("timers.tick_seconds", timers.tick_seconds, 1, MAX_TICK_SECONDS)?;
        check_range(
            "timers.autosave_seconds",
            timers.autosave_seconds,
            1,
            MAX_AUTOSAVE_SECONDS,
        )?;
        check_range(
            "timers.remote_sync_debounce_ms",
            timers.remote_sync_debounce_ms,
            0,
            MAX_REMOTE_SYNC_DEBOUNCE_MS,
        )?;
        Ok(())
    }

    pub fn timer_settings(&self) -> TimerSettings {
        TimerSettings::from(&self.timers)
    }

    /// Save the current configuration to the default path
    pub fn save(&self) -> Result<()> {
        let config_path = Self::default_config_path();
        self.save_to(&config_path)
    }

    /// Save the current configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }
}
