//! Settings file
//!
//! A single YAML document configures provisioning, the runtime connection
//! and where instance records live. Every section is optional.

use crate::container::RuntimeConfig;
use crate::error::Result;
use crate::lab::LabConfig;
use crate::store::sqlite::DEFAULT_DB_FILE;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// labrune settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub lab: LabConfig,
    pub runtime: RuntimeConfig,
    /// SQLite database file; defaults to the data directory
    pub database: Option<PathBuf>,
}

impl Settings {
    /// Load and validate settings from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate settings from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let settings: Settings = serde_yaml::from_str(content)?;
        settings.lab.validate()?;
        Ok(settings)
    }

    /// Database file to open
    pub fn database_path(&self) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(|| data_dir().join(DEFAULT_DB_FILE))
    }
}

/// Base directory for labrune data
pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join("labrune")
}
