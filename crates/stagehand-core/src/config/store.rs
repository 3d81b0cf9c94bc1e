//! Config store for loading and saving stagehand.toml.

use std::path::{Path, PathBuf};

use anyhow::Context;

use super::{StagehandConfig, parser};

/// File name of the configuration inside the config directory.
pub const CONFIG_FILE: &str = "stagehand.toml";

#[derive(Debug, Clone)]
pub struct ConfigStore {
    config_path: PathBuf,
}

impl ConfigStore {
    /// Store at `<config_dir>/stagehand/stagehand.toml`.
    pub fn from_default() -> anyhow::Result<Self> {
        let dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
            .join("stagehand");
        Ok(Self::from_path(dir.join(CONFIG_FILE)))
    }

    pub fn from_path(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load the configuration; a missing file yields the defaults.
    pub fn load(&self) -> anyhow::Result<StagehandConfig> {
        if !self.config_path.exists() {
            tracing::debug!(path = %self.config_path.display(), "no config file, using defaults");
            return Ok(StagehandConfig::new());
        }
        parser::parse_stagehand_toml(&self.config_path)
    }

    pub fn save(&self, config: &StagehandConfig) -> anyhow::Result<()> {
        config.validate()?;
        let content = parser::to_toml(config)?;
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        std::fs::write(&self.config_path, content).with_context(|| {
            format!(
                "Failed to write config file: {}",
                self.config_path.display()
            )
        })?;
        Ok(())
    }
}
