//! Engine configuration

use anyhow::Result;
use serde::{Deserialize, Serialize};
use skyboard_types::{SourceSettings, UnitSystem};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Current version of the config format
pub const CONFIG_VERSION: u32 = 1;

/// Engine-wide configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Version of the config format
    pub version: u32,
    /// Units values are displayed in
    #[serde(default)]
    pub units: UnitSystem,
    /// Per-source settings by registry name
    #[serde(default)]
    pub sources: HashMap<String, SourceSettings>,
}

impl EngineConfig {
    /// Load configuration from disk
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            log::info!("No config at {}, using defaults", config_path.display());
            return Ok(Self::default());
        }

        Self::load_from_path(&config_path)
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_path()?)
    }

    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("org", "skyboard", "skyboard")
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;

        Ok(dirs.config_dir().join("config.json"))
    }

    /// Load configuration from a specific file path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        if config.version > CONFIG_VERSION {
            log::warn!(
                "Config {} has version {}, newer than {}",
                path.display(),
                config.version,
                CONFIG_VERSION
            );
        }
        Ok(config)
    }

    /// Save configuration to a specific file path
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Settings for `name`, if the config has an entry for it
    pub fn source(&self, name: &str) -> Option<&SourceSettings> {
        self.sources.get(name)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            units: UnitSystem::default(),
            sources: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load_path() {
        let path = std::env::temp_dir()
            .join(format!("skyboard-config-{}", std::process::id()))
            .join("config.json");

        let mut config = EngineConfig {
            units: UnitSystem::Imperial,
            ..EngineConfig::default()
        };
        config.sources.insert(
            "simulated".to_string(),
            SourceSettings {
                default_for: vec!["environment.temperature".to_string()],
                ..SourceSettings::default()
            },
        );
        config.save_to_path(&path).unwrap();

        let loaded = EngineConfig::load_from_path(&path).unwrap();
        assert_eq!(loaded, config);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_minimal_file() {
        let config: EngineConfig = serde_json::from_str(r#"{"version": 1}"#).unwrap();
        assert_eq!(config.units, UnitSystem::Metric);
        assert!(config.sources.is_empty());
    }
}
