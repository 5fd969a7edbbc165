//! Daemon configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub daemon: DaemonSettings,
    #[serde(default)]
    pub usb: UsbSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonSettings {
    #[serde(default = "DaemonSettings::default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub service_mode: bool,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            service_mode: false,
        }
    }
}

impl DaemonSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

/// Settings of the libusb backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Timeout of one control transfer, in milliseconds
    #[serde(default = "UsbSettings::default_transfer_timeout_ms")]
    pub transfer_timeout_ms: u64,
    /// Claim the audio control interface around each request, detaching a
    /// bound kernel driver meanwhile
    #[serde(default = "UsbSettings::default_claim_interface")]
    pub claim_interface: bool,
    /// How long one libusb event pump may block, in milliseconds
    #[serde(default = "UsbSettings::default_event_poll_ms")]
    pub event_poll_ms: u64,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            transfer_timeout_ms: Self::default_transfer_timeout_ms(),
            claim_interface: Self::default_claim_interface(),
            event_poll_ms: Self::default_event_poll_ms(),
        }
    }
}

impl UsbSettings {
    fn default_transfer_timeout_ms() -> u64 {
        5000
    }

    fn default_claim_interface() -> bool {
        true
    }

    fn default_event_poll_ms() -> u64 {
        100
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn event_poll(&self) -> Duration {
        Duration::from_millis(self.event_poll_ms)
    }
}

impl DaemonConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![Self::default_path(), PathBuf::from("/etc/rzrst/rzrst.toml")];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Invalid config file: {}", config_path.display()))?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: DaemonConfig = toml::from_str(content).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("rzrst").join("rzrst.toml")
        } else {
            PathBuf::from(".config/rzrst/rzrst.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        validate_log_level(&self.daemon.log_level)?;

        if self.usb.transfer_timeout_ms == 0 {
            return Err(anyhow!("usb.transfer_timeout_ms must be greater than 0"));
        }

        if self.usb.event_poll_ms == 0 {
            return Err(anyhow!("usb.event_poll_ms must be greater than 0"));
        }

        Ok(())
    }
}

/// Check `level` is one of the levels the daemon accepts
pub fn validate_log_level(level: &str) -> Result<()> {
    if !VALID_LEVELS.contains(&level) {
        return Err(anyhow!(
            "Invalid log level '{}', must be one of: {}",
            level,
            VALID_LEVELS.join(", ")
        ));
    }
    Ok(())
}

/// Load configuration from a path that may start with `~`
pub fn load_config(path: &str) -> Result<DaemonConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    DaemonConfig::load(Some(path_buf))
}
