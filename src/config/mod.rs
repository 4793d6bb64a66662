//! Application configuration
//!
//! TOML file under the platform config directory. A missing file yields
//! defaults; a file that fails to parse is reported as [`Error::Config`]
//! so the caller can decide between aborting and falling back.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_ANNOUNCE_INTERVAL_MS, DEFAULT_CONTROL_PORT, DEFAULT_DISCOVERY_PORT,
    DEFAULT_INPUT_COUNT, DEFAULT_METERING_INTERVAL_MS, DEFAULT_MIN_DB, DEFAULT_OUTPUT_COUNT,
};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub discovery: DiscoveryConfig,
    pub remote: RemoteConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Display name announced over discovery
    pub name: String,
    pub control_port: u16,
    pub inputs: u16,
    pub outputs: u16,
    /// Metering display floor in dB
    pub min_db: f32,
    pub metering_interval_ms: u64,
    /// Palette/theme hint distributed to remote surfaces
    pub palette: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "Crosspoint Matrix".to_string(),
            control_port: DEFAULT_CONTROL_PORT,
            inputs: DEFAULT_INPUT_COUNT,
            outputs: DEFAULT_OUTPUT_COUNT,
            min_db: DEFAULT_MIN_DB,
            metering_interval_ms: DEFAULT_METERING_INTERVAL_MS,
            palette: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub port: u16,
    pub announce_interval_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_DISCOVERY_PORT,
            announce_interval_ms: DEFAULT_ANNOUNCE_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Name of the engine the remote last connected to, for automatic
    /// reconnection on the next launch
    pub last_target_description: Option<String>,
}

impl AppConfig {
    /// Platform config file path, `None` when no home directory exists
    pub fn config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "lan-matrix-remote")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from the platform config path. Missing file yields defaults.
    pub fn load() -> Result<Self> {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => {
                tracing::warn!("no config directory available, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(?path, "no config file, using defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))
    }

    /// Persist to the platform config path, creating parent directories
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()
            .ok_or_else(|| Error::Config("no config directory available".to_string()))?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        tracing::info!(?path, "config saved");
        Ok(())
    }
}

/// Last connected engine name, if any was persisted
pub fn load_last_target_description() -> Option<String> {
    AppConfig::load().ok()?.remote.last_target_description
}

/// Persist the engine name the remote connected to
pub fn save_target_description(description: &str) -> Result<()> {
    let mut config = AppConfig::load().unwrap_or_default();
    config.remote.last_target_description = Some(description.to_string());
    config.save()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.engine.inputs, DEFAULT_INPUT_COUNT);
        assert_eq!(config.engine.outputs, DEFAULT_OUTPUT_COUNT);
        assert_eq!(config.engine.control_port, DEFAULT_CONTROL_PORT);
        assert_eq!(config.discovery.port, DEFAULT_DISCOVERY_PORT);
        assert!(config.remote.last_target_description.is_none());
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = AppConfig::default();
        config.engine.name = "Studio B".to_string();
        config.engine.inputs = 16;
        config.remote.last_target_description = Some("Studio B".to_string());

        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let parsed: AppConfig = toml::from_str("[engine]\ninputs = 12\n").unwrap();
        assert_eq!(parsed.engine.inputs, 12);
        assert_eq!(parsed.engine.outputs, DEFAULT_OUTPUT_COUNT);
        assert_eq!(parsed.discovery.port, DEFAULT_DISCOVERY_PORT);
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let path = std::env::temp_dir().join("lan-matrix-remote-test-missing.toml");
        let _ = std::fs::remove_file(&path);
        assert_eq!(AppConfig::load_from(&path).unwrap(), AppConfig::default());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = std::env::temp_dir().join("lan-matrix-remote-test-config");
        let path = dir.join("config.toml");
        let mut config = AppConfig::default();
        config.engine.min_db = -80.0;
        config.save_to(&path).unwrap();
        assert_eq!(AppConfig::load_from(&path).unwrap(), config);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_garbage_file_is_config_error() {
        let dir = std::env::temp_dir().join("lan-matrix-remote-test-garbage");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "not [valid toml").unwrap();
        assert!(matches!(
            AppConfig::load_from(&path),
            Err(Error::Config(_))
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
