use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use bluer::Uuid;
use serde::Deserialize;

use crate::bluetooth::gatt::GattUuids;
use crate::session::SessionTiming;

const DEFAULT_SERVICE_UUID: &str = "0000ff12-0000-1000-8000-00805f9b34fb";
const DEFAULT_WRITE_UUID: &str = "0000ff13-0000-1000-8000-00805f9b34fb";
const DEFAULT_NOTIFY_UUID: &str = "0000ff14-0000-1000-8000-00805f9b34fb";

/// Application configuration stored as TOML. Read only; never written back.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// BLE address of the earbuds (not the audio address).
    pub device_address: Option<String>,
    pub service_uuid: String,
    pub write_uuid: String,
    pub notify_uuid: String,
    /// How long to wait for a reply to each command.
    pub response_timeout_ms: u64,
    /// Pause after each command for the DSP to apply it.
    pub settle_delay_ms: u64,
    /// Directory holding AutoEQ preset files.
    pub presets_dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device_address: None,
            service_uuid: DEFAULT_SERVICE_UUID.into(),
            write_uuid: DEFAULT_WRITE_UUID.into(),
            notify_uuid: DEFAULT_NOTIFY_UUID.into(),
            response_timeout_ms: 5000,
            settle_delay_ms: 300,
            presets_dir: None,
        }
    }
}

impl AppConfig {
    /// Config file path: ~/.config/fairbuds/config.toml
    pub fn path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fairbuds");
        config_dir.join("config.toml")
    }

    /// Load config from the given file (or the default path), or return defaults.
    pub fn load(path: Option<&Path>) -> Self {
        let default_path = Self::path();
        let path = path.unwrap_or(&default_path);
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(contents) => match Self::parse(&contents) {
                    Ok(config) => return config,
                    Err(e) => tracing::warn!("Failed to parse config {}: {}", path.display(), e),
                },
                Err(e) => tracing::warn!("Failed to read config {}: {}", path.display(), e),
            }
        }
        Self::default()
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn gatt_uuids(&self) -> Result<GattUuids> {
        let parse = |s: &str| Uuid::parse_str(s).with_context(|| format!("Invalid UUID '{}'", s));
        Ok(GattUuids {
            service: parse(&self.service_uuid)?,
            write: parse(&self.write_uuid)?,
            notify: parse(&self.notify_uuid)?,
        })
    }

    pub fn timing(&self) -> SessionTiming {
        SessionTiming {
            response_timeout: Duration::from_millis(self.response_timeout_ms),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            ..SessionTiming::default()
        }
    }

    /// Configured presets directory, else `<data dir>/fairbuds/presets` if it
    /// exists, else `./presets`.
    pub fn presets_dir(&self) -> PathBuf {
        if let Some(dir) = &self.presets_dir {
            return dir.clone();
        }
        dirs::data_dir()
            .map(|d| d.join("fairbuds").join("presets"))
            .filter(|d| d.is_dir())
            .unwrap_or_else(|| PathBuf::from("presets"))
    }
}
