use crate::error::{EmberError, Result};
use crate::inference::{BackendConfig, BackendKind, RemoteConfig};
use crate::models::{Catalog, ModelDescriptor, ModelManagerConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub backend: BackendSection,
    #[serde(default)]
    pub remote: RemoteConfig,
    /// Extra descriptors appended to the built-in catalog
    #[serde(default)]
    pub catalog: Vec<ModelDescriptor>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct ModelsConfig {
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_true")]
    pub auto_download: bool,
    #[serde(default = "default_true")]
    pub verify_checksum: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct BackendSection {
    #[serde(default = "default_backend")]
    pub kind: String,
    /// Catalog name of the model to generate with
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(flatten)]
    pub settings: BackendConfig,
}

// Default value functions
fn default_models_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("emberlm/models")
}
fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("emberlm")
}
fn default_true() -> bool {
    true
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_backend() -> String {
    "local".to_string()
}
fn default_model() -> String {
    "tinyllama-1.1b-chat-q4".to_string()
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            models_dir: default_models_dir(),
            cache_dir: default_cache_dir(),
            auto_download: default_true(),
            verify_checksum: default_true(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            kind: default_backend(),
            model: default_model(),
            settings: BackendConfig::default(),
        }
    }
}

impl ModelsConfig {
    /// Settings for a [`crate::models::ModelManager`]
    #[must_use]
    pub fn manager_config(&self) -> ModelManagerConfig {
        let mut config = ModelManagerConfig::in_dir(&self.models_dir);
        config.cache_dir.clone_from(&self.cache_dir);
        config.auto_download = self.auto_download;
        config.verify_checksum = self.verify_checksum;
        config.max_retries = self.max_retries;
        config.timeout = Duration::from_secs(self.timeout_secs);
        config
    }
}

impl BackendSection {
    pub fn kind(&self) -> Result<BackendKind> {
        self.kind.parse()
    }
}

impl Config {
    /// Default config file location
    pub fn path() -> Result<PathBuf> {
        let config_dir = if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
            PathBuf::from(xdg_config)
        } else {
            let home = std::env::var("HOME")
                .map_err(|_| EmberError::Config("HOME env var not set".to_string()))?;
            PathBuf::from(home).join(".config")
        };

        Ok(config_dir.join("emberlm").join("config.toml"))
    }

    /// Load from the default location, falling back to defaults
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            EmberError::Config(format!("Failed to parse {}: {e}", path.display()))
        })?;
        config.backend.kind()?;

        Ok(config)
    }

    /// Write atomically (tmp + rename)
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let toml_str = toml::to_string_pretty(self)
            .map_err(|e| EmberError::Config(format!("Failed to serialize config: {e}")))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, toml_str)?;
        fs::rename(&tmp_path, path)?;

        Ok(())
    }

    /// Built-in catalog extended with the `[[catalog]]` entries
    #[must_use]
    pub fn catalog(&self) -> Catalog {
        Catalog::with_extra(&self.catalog)
    }
}
