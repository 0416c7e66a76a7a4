use crate::error::{EmberError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Information about a verified, installed model file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstalledModel {
    pub name: String,
    pub filename: String,
    pub size_bytes: u64,
    pub checksum: Option<String>,
    pub downloaded_at: String,
}

/// Manifest tracking installed models
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub models: Vec<InstalledModel>,
    pub last_updated: String,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            models: Vec::new(),
            last_updated: chrono::Utc::now().to_rfc3339(),
        }
    }
}

impl Manifest {
    /// Load manifest from file, empty if it doesn't exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;

        serde_json::from_str(&content)
            .map_err(|e| EmberError::Config(format!("Failed to parse manifest: {e}")))
    }

    /// Load the manifest, rebuilding it from the directory contents if it is unreadable
    pub fn load_or_regenerate(path: &Path, models_dir: &Path) -> Result<Self> {
        match Self::load(path) {
            Ok(manifest) => Ok(manifest),
            Err(EmberError::Config(msg)) => {
                tracing::warn!("{msg}; rebuilding manifest from {}", models_dir.display());
                Self::regenerate_from_disk(models_dir)
            }
            Err(e) => Err(e),
        }
    }

    /// Save manifest to file atomically (tmp + rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = path.with_extension("tmp");
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| EmberError::Config(format!("Failed to serialize manifest: {e}")))?;

        fs::write(&tmp_path, content)?;
        fs::rename(&tmp_path, path)?;

        Ok(())
    }

    /// Add or update a model in the manifest
    pub fn add_model(&mut self, model: InstalledModel) {
        self.models.retain(|m| m.name != model.name);
        self.models.push(model);
        self.last_updated = chrono::Utc::now().to_rfc3339();
    }

    /// Remove a model from the manifest, returning whether it was present
    pub fn remove_model(&mut self, name: &str) -> bool {
        let before_len = self.models.len();
        self.models.retain(|m| m.name != name);

        let removed = self.models.len() != before_len;
        if removed {
            self.last_updated = chrono::Utc::now().to_rfc3339();
        }
        removed
    }

    /// Find installed model by name
    #[must_use]
    pub fn find_model(&self, name: &str) -> Option<&InstalledModel> {
        self.models.iter().find(|m| m.name == name)
    }

    /// Regenerate manifest from disk (in case of corruption)
    ///
    /// Entries are named after the file stem since the descriptor name is unknown.
    pub fn regenerate_from_disk(models_dir: &Path) -> Result<Self> {
        let mut manifest = Self::default();

        if !models_dir.exists() {
            return Ok(manifest);
        }

        for entry in fs::read_dir(models_dir)?.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "gguf") {
                let (Some(stem), Some(filename)) = (
                    path.file_stem().and_then(|s| s.to_str()),
                    path.file_name().and_then(|s| s.to_str()),
                ) else {
                    continue;
                };

                let size_bytes = fs::metadata(&path).map_or(0, |m| m.len());
                manifest.add_model(InstalledModel {
                    name: stem.to_string(),
                    filename: filename.to_string(),
                    size_bytes,
                    checksum: None,
                    downloaded_at: chrono::Utc::now().to_rfc3339(),
                });
            }
        }

        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn installed(name: &str, size_bytes: u64) -> InstalledModel {
        InstalledModel {
            name: name.to_string(),
            filename: format!("{name}.gguf"),
            size_bytes,
            checksum: None,
            downloaded_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn test_default_manifest() {
        let manifest = Manifest::default();
        assert!(manifest.models.is_empty());
        assert!(!manifest.last_updated.is_empty());
    }

    #[test]
    fn test_add_model_updates_existing() {
        let mut manifest = Manifest::default();
        manifest.add_model(installed("tiny", 100));
        manifest.add_model(installed("tiny", 200));

        assert_eq!(manifest.models.len(), 1);
        assert_eq!(manifest.models[0].size_bytes, 200);
    }

    #[test]
    fn test_remove_model() {
        let mut manifest = Manifest::default();
        manifest.add_model(installed("tiny", 100));

        assert!(manifest.remove_model("tiny"));
        assert!(manifest.models.is_empty());
        assert!(!manifest.remove_model("tiny"));
    }

    #[test]
    fn test_find_model() {
        let mut manifest = Manifest::default();
        manifest.add_model(installed("tiny", 100));

        assert_eq!(manifest.find_model("tiny").unwrap().filename, "tiny.gguf");
        assert!(manifest.find_model("phi").is_none());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let manifest_path = temp_dir.path().join("manifest.json");

        let mut manifest = Manifest::default();
        let mut model = installed("tiny", 145_000_000);
        model.checksum = Some("abc123".to_string());
        manifest.add_model(model);

        manifest.save(&manifest_path).unwrap();
        assert!(manifest_path.exists());
        assert!(!manifest_path.with_extension("tmp").exists());

        let loaded = Manifest::load(&manifest_path).unwrap();
        assert_eq!(loaded.models.len(), 1);
        assert_eq!(loaded.models[0].checksum.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_load_nonexistent_manifest() {
        let temp_dir = TempDir::new().unwrap();
        let manifest = Manifest::load(&temp_dir.path().join("nonexistent.json")).unwrap();
        assert!(manifest.models.is_empty());
    }

    #[test]
    fn test_corrupt_manifest_is_regenerated() {
        let temp_dir = TempDir::new().unwrap();
        let manifest_path = temp_dir.path().join("manifest.json");
        fs::write(&manifest_path, "{ not json").unwrap();
        fs::write(temp_dir.path().join("tiny.gguf"), "fake").unwrap();

        assert!(Manifest::load(&manifest_path).is_err());
        let manifest = Manifest::load_or_regenerate(&manifest_path, temp_dir.path()).unwrap();
        assert_eq!(manifest.models.len(), 1);
        assert_eq!(manifest.models[0].name, "tiny");
    }

    #[test]
    fn test_regenerate_from_disk() {
        let temp_dir = TempDir::new().unwrap();
        let models_dir = temp_dir.path();

        fs::write(models_dir.join("tiny.gguf"), "fake data").unwrap();
        fs::write(models_dir.join("phi-2.Q4_K_M.gguf"), "fake data longer").unwrap();
        fs::write(models_dir.join("phi-2.Q4_K_M.gguf.partial"), "partial").unwrap();
        fs::write(models_dir.join("other-file.txt"), "ignore").unwrap();

        let manifest = Manifest::regenerate_from_disk(models_dir).unwrap();
        assert_eq!(manifest.models.len(), 2);

        let names: Vec<&str> = manifest.models.iter().map(|m| m.name.as_str()).collect();
        assert!(names.contains(&"tiny"));
        assert!(names.contains(&"phi-2.Q4_K_M"));
    }
}
