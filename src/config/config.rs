use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::sequencer::TestParameters;

pub const DEFAULT_BAUD_RATE: u32 = 250_000;
pub const DEFAULT_READ_TIMEOUT_SECS: f64 = 1.0;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    /// Fixed serial device path; `None` means probe candidates at connect.
    pub port: Option<String>,
    pub baudrate: u32,
    pub timeout_secs: f64,
    pub poll_interval_secs: u64,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            port: None,
            baudrate: DEFAULT_BAUD_RATE,
            timeout_secs: DEFAULT_READ_TIMEOUT_SECS,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".into() }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct VnaConfig {
    /// Key injected to trigger a sweep on the VNA software.
    pub trigger_key: String,
}

impl Default for VnaConfig {
    fn default() -> Self {
        Self { trigger_key: "F12".into() }
    }
}

/// Application configuration, persisted as `config.json` next to the binary.
/// Missing sections fall back to defaults so old files keep loading.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub hardware: HardwareConfig,
    pub logging: LoggingConfig,
    pub vna: VnaConfig,
    pub test: TestParameters,
}

impl Config {
    /// Load configuration from `path`, creating the file with defaults when it
    /// does not exist. Parse failures fall back to defaults rather than abort.
    pub fn load_or_create(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(text) => match serde_json::from_str::<Config>(&text) {
                    Ok(config) => {
                        info!("configuration loaded from {}", path.display());
                        return config;
                    }
                    Err(e) => error!("error parsing config {}: {}", path.display(), e),
                },
                Err(e) => error!("error reading config {}: {}", path.display(), e),
            }
            return Config::default();
        }

        let config = Config::default();
        config.save(path);
        info!("created new configuration file at {}", path.display());
        config
    }

    pub fn save(&self, path: &Path) {
        match serde_json::to_string_pretty(self) {
            Ok(text) => {
                if let Err(e) = std::fs::write(path, text) {
                    error!("error saving config {}: {}", path.display(), e);
                }
            }
            Err(e) => error!("error serializing config: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_serial_parameters() {
        let config = Config::default();
        assert_eq!(config.hardware.baudrate, 250_000);
        assert_eq!(config.hardware.timeout_secs, 1.0);
        assert_eq!(config.hardware.poll_interval_secs, 10);
        assert!(config.hardware.port.is_none());
    }

    #[test]
    fn test_round_trip_through_json() {
        let config = Config::default();
        let text = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&text).unwrap();
        assert_eq!(back.hardware.baudrate, config.hardware.baudrate);
        assert_eq!(back.vna.trigger_key, "F12");
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let text = r#"{ "hardware": { "baudrate": 115200 } }"#;
        let config: Config = serde_json::from_str(text).unwrap();
        assert_eq!(config.hardware.baudrate, 115_200);
        assert_eq!(config.hardware.poll_interval_secs, 10);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_or_create_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let _ = Config::load_or_create(&path);
        assert!(path.exists());
        let reloaded = Config::load_or_create(&path);
        assert_eq!(reloaded.hardware.baudrate, 250_000);
    }
}
