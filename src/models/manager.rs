use crate::cancel::CancelFlag;
use crate::error::{DownloadError, EmberError, Result};
use crate::models::catalog::ModelDescriptor;
use crate::models::download::{
    sha256_file, sha256_file_async, ActiveDownloads, DownloadProgress, DownloadSession,
    HttpTransport, ProgressCallback, ProgressReporter, RetryPolicy, Transport,
};
use crate::models::manifest::{InstalledModel, Manifest};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

const PARTIAL_SUFFIX: &str = "partial";
const MANIFEST_FILE: &str = "manifest.json";

/// On-disk state of a model artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelStatus {
    NotFound,
    Downloading,
    Available,
    Corrupted,
    Error,
}

impl ModelStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not found",
            Self::Downloading => "downloading",
            Self::Available => "available",
            Self::Corrupted => "corrupted",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings for a [`ModelManager`]
#[derive(Clone)]
pub struct ModelManagerConfig {
    pub models_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub auto_download: bool,
    pub verify_checksum: bool,
    pub max_retries: u32,
    pub timeout: Duration,
    pub retry_backoff: Duration,
    pub progress_callback: Option<ProgressCallback>,
}

impl fmt::Debug for ModelManagerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelManagerConfig")
            .field("models_dir", &self.models_dir)
            .field("cache_dir", &self.cache_dir)
            .field("auto_download", &self.auto_download)
            .field("verify_checksum", &self.verify_checksum)
            .field("max_retries", &self.max_retries)
            .field("timeout", &self.timeout)
            .field("retry_backoff", &self.retry_backoff)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "Fn { ... }"),
            )
            .finish()
    }
}

impl ModelManagerConfig {
    /// Defaults rooted at `models_dir`, with partial downloads co-located in `models_dir/.cache`
    #[must_use]
    pub fn in_dir(models_dir: impl Into<PathBuf>) -> Self {
        let models_dir = models_dir.into();
        Self {
            cache_dir: models_dir.join(".cache"),
            models_dir,
            auto_download: true,
            verify_checksum: true,
            max_retries: 3,
            timeout: Duration::from_secs(60),
            retry_backoff: Duration::from_millis(500),
            progress_callback: None,
        }
    }

    #[must_use]
    pub fn with_progress_callback(
        mut self,
        callback: impl Fn(&DownloadProgress) + Send + Sync + 'static,
    ) -> Self {
        self.progress_callback = Some(Arc::new(callback));
        self
    }

    const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            timeout: self.timeout,
            backoff: self.retry_backoff,
        }
    }
}

type PinTable = Arc<Mutex<HashMap<PathBuf, usize>>>;

/// Marks a final model file as open by a backend for as long as it lives
#[derive(Debug)]
pub struct ModelPin {
    pins: PinTable,
    path: PathBuf,
}

impl ModelPin {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ModelPin {
    fn drop(&mut self) {
        let mut pins = self.pins.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = pins.get_mut(&self.path) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&self.path);
            }
        }
    }
}

/// Removes a model from the in-flight tables when its download ends
struct ActiveGuard<'a> {
    manager: &'a ModelManager,
    name: String,
    partial_path: PathBuf,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.manager
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.name);
        self.manager
            .active_partials
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.partial_path);
    }
}

/// Downloads, verifies and caches model files
pub struct ModelManager {
    config: ModelManagerConfig,
    transport: Arc<dyn Transport>,
    active: ActiveDownloads,
    active_partials: Mutex<HashSet<PathBuf>>,
    pins: PinTable,
    manifest_lock: Mutex<()>,
}

impl fmt::Debug for ModelManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelManager")
            .field("config", &self.config)
            .field("transport", &"Transport { ... }")
            .finish_non_exhaustive()
    }
}

impl ModelManager {
    /// Create a manager that downloads over HTTP(S)
    pub fn new(config: ModelManagerConfig) -> Result<Self> {
        Self::with_transport(config, Arc::new(HttpTransport::new()?))
    }

    /// Create a manager with a custom byte source
    pub fn with_transport(config: ModelManagerConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        fs::create_dir_all(&config.models_dir)?;
        fs::create_dir_all(&config.cache_dir)?;

        Ok(Self {
            config,
            transport,
            active: ActiveDownloads::default(),
            active_partials: Mutex::default(),
            pins: PinTable::default(),
            manifest_lock: Mutex::new(()),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &ModelManagerConfig {
        &self.config
    }

    /// Final path of a model, whether or not it exists yet
    #[must_use]
    pub fn model_path(&self, descriptor: &ModelDescriptor) -> PathBuf {
        self.config.models_dir.join(descriptor.filename.as_ref())
    }

    /// Path holding the in-progress download of a model
    #[must_use]
    pub fn partial_path(&self, descriptor: &ModelDescriptor) -> PathBuf {
        self.config
            .cache_dir
            .join(format!("{}.{PARTIAL_SUFFIX}", descriptor.filename))
    }

    fn manifest_path(&self) -> PathBuf {
        self.config.models_dir.join(MANIFEST_FILE)
    }

    /// Determine the on-disk status without touching the network.
    ///
    /// With `verify_checksum` set this hashes the whole file, so callers
    /// should cache the result for the session.
    #[must_use]
    pub fn status(&self, descriptor: &ModelDescriptor) -> ModelStatus {
        match self.status_without_hash(descriptor) {
            StatusCheck::Known(status) => status,
            StatusCheck::NeedsHash { path, expected } => {
                checksum_status(descriptor, &path, &expected, sha256_file(&path))
            }
        }
    }

    /// [`status`](Self::status) with hashing moved off the async executor
    async fn status_nonblocking(&self, descriptor: &ModelDescriptor) -> ModelStatus {
        match self.status_without_hash(descriptor) {
            StatusCheck::Known(status) => status,
            StatusCheck::NeedsHash { path, expected } => {
                let hashed = sha256_file_async(path.clone()).await;
                checksum_status(descriptor, &path, &expected, hashed)
            }
        }
    }

    fn status_without_hash(&self, descriptor: &ModelDescriptor) -> StatusCheck {
        if self.is_downloading(&descriptor.name) {
            return StatusCheck::Known(ModelStatus::Downloading);
        }

        let path = self.model_path(descriptor);
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return StatusCheck::Known(ModelStatus::Error),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return StatusCheck::Known(ModelStatus::NotFound);
            }
            Err(e) => {
                tracing::warn!("Cannot stat {}: {e}", path.display());
                return StatusCheck::Known(ModelStatus::Error);
            }
        }

        match descriptor.checksum.as_deref() {
            Some(expected) if self.config.verify_checksum => StatusCheck::NeedsHash {
                path,
                expected: expected.to_string(),
            },
            _ => StatusCheck::Known(ModelStatus::Available),
        }
    }

    #[must_use]
    pub fn is_available(&self, descriptor: &ModelDescriptor) -> bool {
        self.status(descriptor) == ModelStatus::Available
    }

    fn is_downloading(&self, name: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Latest progress of an in-flight download
    #[must_use]
    pub fn progress(&self, name: &str) -> Option<DownloadProgress> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Return the path of a verified model, downloading it first when needed
    pub async fn ensure_available(&self, descriptor: &ModelDescriptor) -> Result<PathBuf> {
        self.ensure_available_with_cancel(descriptor, None).await
    }

    pub async fn ensure_available_with_cancel(
        &self,
        descriptor: &ModelDescriptor,
        cancel: Option<&CancelFlag>,
    ) -> Result<PathBuf> {
        match self.status_nonblocking(descriptor).await {
            ModelStatus::Available => {
                tracing::debug!("Model {} already available", descriptor.name);
                return Ok(self.model_path(descriptor));
            }
            ModelStatus::Downloading => {
                return Err(DownloadError::AlreadyInProgress(descriptor.name.to_string()).into());
            }
            status => {
                tracing::info!("Model {} is {status}", descriptor.name);
            }
        }

        if !self.config.auto_download {
            return Err(EmberError::NotFound(descriptor.name.to_string()));
        }

        self.download_with_cancel(descriptor, cancel).await?;
        Ok(self.model_path(descriptor))
    }

    /// Download, verify and install a model
    pub async fn download(&self, descriptor: &ModelDescriptor) -> Result<()> {
        self.download_with_cancel(descriptor, None).await
    }

    /// Download with cooperative cancellation; a cancelled download keeps its partial file
    pub async fn download_with_cancel(
        &self,
        descriptor: &ModelDescriptor,
        cancel: Option<&CancelFlag>,
    ) -> Result<()> {
        validate_descriptor(descriptor)?;

        let final_path = self.model_path(descriptor);
        if self.is_pinned(&final_path) {
            return Err(EmberError::InUse(final_path));
        }

        let _guard = self.claim(descriptor)?;

        fs::create_dir_all(&self.config.models_dir)?;
        fs::create_dir_all(&self.config.cache_dir)?;

        let partial_path = self.partial_path(descriptor);
        let already = fs::metadata(&partial_path).map_or(0, |m| m.len());
        self.check_space(descriptor.size_bytes, already)?;

        tracing::info!(
            "Downloading {} from {} ({} bytes already present)",
            descriptor.name,
            descriptor.url,
            already
        );

        let mut reporter = ProgressReporter::new(
            &descriptor.name,
            self.config.progress_callback.as_ref(),
            &self.active,
        );
        let mut session = DownloadSession::new(descriptor, partial_path);
        session
            .run(
                self.transport.as_ref(),
                self.config.retry_policy(),
                cancel,
                &mut reporter,
            )
            .await?;

        let checksum = self.verify_partial(descriptor, &session).await?;
        install(session.partial_path(), &final_path)?;
        self.record_install(descriptor, &final_path, checksum)?;

        reporter.finish(session.total());
        tracing::info!("Model {} installed at {}", descriptor.name, final_path.display());
        Ok(())
    }

    /// Free space for the partial file in the cache directory, and for the
    /// installed copy when the models directory is on another filesystem
    fn check_space(&self, size_bytes: u64, already: u64) -> Result<()> {
        let same_fs = same_filesystem(&self.config.cache_dir, &self.config.models_dir);
        let (cache_needed, models_needed) = space_needed(size_bytes, already, same_fs);

        for (dir, required) in [
            (&self.config.cache_dir, cache_needed),
            (&self.config.models_dir, models_needed),
        ] {
            if required == 0 {
                continue;
            }
            let available = available_space(dir);
            if available < required {
                tracing::error!(
                    "Not enough space in {}: {required} bytes needed, {available} free",
                    dir.display()
                );
                return Err(EmberError::InsufficientSpace {
                    required,
                    available,
                });
            }
        }
        Ok(())
    }

    /// Reserve the model name and its partial file for one download
    fn claim(&self, descriptor: &ModelDescriptor) -> Result<ActiveGuard<'_>> {
        let partial_path = self.partial_path(descriptor);
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        let mut partials = self
            .active_partials
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if active.contains_key(descriptor.name.as_ref()) || partials.contains(&partial_path) {
            return Err(DownloadError::AlreadyInProgress(descriptor.name.to_string()).into());
        }

        active.insert(
            descriptor.name.to_string(),
            DownloadProgress::new(&descriptor.name, 0, descriptor.size_bytes),
        );
        partials.insert(partial_path.clone());

        Ok(ActiveGuard {
            manager: self,
            name: descriptor.name.to_string(),
            partial_path,
        })
    }

    /// Check the completed partial file; a failed check deletes it
    async fn verify_partial(
        &self,
        descriptor: &ModelDescriptor,
        session: &DownloadSession<'_>,
    ) -> Result<Option<String>> {
        let partial_path = session.partial_path();
        let actual_size = fs::metadata(partial_path)?.len();
        let expected_size = session.total();

        if expected_size > 0 && actual_size != expected_size {
            fs::remove_file(partial_path)?;
            return Err(DownloadError::SizeMismatch {
                expected: expected_size,
                actual: actual_size,
            }
            .into());
        }

        let Some(expected) = descriptor.checksum.as_deref() else {
            return Ok(None);
        };
        if !self.config.verify_checksum {
            return Ok(Some(expected.to_string()));
        }

        let actual = sha256_file_async(partial_path.to_path_buf()).await?;
        if !actual.eq_ignore_ascii_case(expected) {
            tracing::error!(
                "Checksum mismatch for {}: expected {expected}, got {actual}",
                descriptor.name
            );
            fs::remove_file(partial_path)?;
            return Err(DownloadError::ChecksumMismatch {
                expected: expected.to_string(),
                actual,
            }
            .into());
        }

        tracing::debug!("Checksum verified for {}: {actual}", descriptor.name);
        Ok(Some(actual))
    }

    fn record_install(
        &self,
        descriptor: &ModelDescriptor,
        final_path: &Path,
        checksum: Option<String>,
    ) -> Result<()> {
        let _lock = self
            .manifest_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let manifest_path = self.manifest_path();
        let mut manifest = Manifest::load_or_regenerate(&manifest_path, &self.config.models_dir)?;

        manifest.add_model(InstalledModel {
            name: descriptor.name.to_string(),
            filename: descriptor.filename.to_string(),
            size_bytes: fs::metadata(final_path)?.len(),
            checksum,
            downloaded_at: chrono::Utc::now().to_rfc3339(),
        });
        manifest.save(&manifest_path)
    }

    /// Models recorded as installed
    pub fn list_installed(&self) -> Result<Vec<InstalledModel>> {
        let _lock = self
            .manifest_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let manifest = Manifest::load_or_regenerate(&self.manifest_path(), &self.config.models_dir)?;
        Ok(manifest
            .models
            .into_iter()
            .filter(|m| self.config.models_dir.join(&m.filename).exists())
            .collect())
    }

    /// Mark a model's final file as in use until the returned pin is dropped
    #[must_use]
    pub fn pin(&self, descriptor: &ModelDescriptor) -> ModelPin {
        let path = self.model_path(descriptor);
        *self
            .pins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(path.clone())
            .or_insert(0) += 1;

        ModelPin {
            pins: Arc::clone(&self.pins),
            path,
        }
    }

    fn is_pinned(&self, path: &Path) -> bool {
        self.pins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(path)
    }

    /// Remove a model's final file. Callers must unload it from any backend first.
    ///
    /// Returns whether a file was removed.
    pub fn delete_model(&self, descriptor: &ModelDescriptor) -> Result<bool> {
        let path = self.model_path(descriptor);
        if self.is_pinned(&path) {
            return Err(EmberError::InUse(path));
        }
        if self.is_downloading(&descriptor.name) {
            return Err(DownloadError::AlreadyInProgress(descriptor.name.to_string()).into());
        }

        let removed = match fs::remove_file(&path) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };

        let _lock = self
            .manifest_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let manifest_path = self.manifest_path();
        let mut manifest = Manifest::load_or_regenerate(&manifest_path, &self.config.models_dir)?;
        if manifest.remove_model(&descriptor.name) {
            manifest.save(&manifest_path)?;
        }

        if removed {
            tracing::info!("Deleted model {}", descriptor.name);
        }
        Ok(removed)
    }

    /// Remove partial downloads that are not currently being written.
    ///
    /// Returns the number of bytes freed.
    pub fn clean_cache(&self) -> Result<u64> {
        let active_partials = self
            .active_partials
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut freed = 0;

        for entry in fs::read_dir(&self.config.cache_dir)?.flatten() {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != PARTIAL_SUFFIX) {
                continue;
            }
            if active_partials.contains(&path) {
                tracing::debug!("Keeping {}: download in progress", path.display());
                continue;
            }

            let size = entry.metadata().map_or(0, |m| m.len());
            fs::remove_file(&path)?;
            freed += size;
            tracing::debug!("Removed partial download {}", path.display());
        }

        tracing::info!("Cleaned cache, freed {freed} bytes");
        Ok(freed)
    }
}

fn validate_descriptor(descriptor: &ModelDescriptor) -> Result<()> {
    if descriptor.url.is_empty() {
        return Err(EmberError::InvalidArgument(format!(
            "model '{}' has no download URL",
            descriptor.name
        )));
    }

    let filename = Path::new(descriptor.filename.as_ref());
    let plain = filename.components().count() == 1
        && filename.file_name().is_some_and(|f| f == filename.as_os_str());
    if descriptor.filename.is_empty() || !plain {
        return Err(EmberError::InvalidArgument(format!(
            "model '{}' has an invalid filename '{}'",
            descriptor.name, descriptor.filename
        )));
    }

    Ok(())
}

/// Atomically move a verified partial file to its final path
fn install(partial_path: &Path, final_path: &Path) -> Result<()> {
    if fs::rename(partial_path, final_path).is_ok() {
        return Ok(());
    }

    // Cache and models dirs on different filesystems: copy next to the target, then rename
    let staging = final_path.with_extension("installing");
    fs::copy(partial_path, &staging)?;
    fs::rename(&staging, final_path)?;
    fs::remove_file(partial_path)?;
    Ok(())
}

enum StatusCheck {
    Known(ModelStatus),
    NeedsHash { path: PathBuf, expected: String },
}

fn checksum_status(
    descriptor: &ModelDescriptor,
    path: &Path,
    expected: &str,
    hashed: std::io::Result<String>,
) -> ModelStatus {
    match hashed {
        Ok(actual) if actual.eq_ignore_ascii_case(expected) => ModelStatus::Available,
        Ok(actual) => {
            tracing::warn!(
                "Checksum mismatch for {}: expected {expected}, got {actual}",
                descriptor.name
            );
            ModelStatus::Corrupted
        }
        Err(e) => {
            tracing::warn!("Cannot hash {}: {e}", path.display());
            ModelStatus::Error
        }
    }
}

/// Free bytes on the filesystem holding `path` (or its nearest existing ancestor)
#[must_use]
pub fn available_space(path: &Path) -> u64 {
    let Some(existing) = path.ancestors().find(|p| p.exists()) else {
        return 0;
    };

    match nix::sys::statvfs::statvfs(existing) {
        Ok(stats) => u64::from(stats.blocks_available()).saturating_mul(stats.fragment_size()),
        Err(e) => {
            tracing::warn!("Failed to check disk space at {}: {e}", existing.display());
            0
        }
    }
}

/// Bytes still needed as `(cache dir, models dir)`.
///
/// Installing across filesystems copies the file, so the models directory
/// must hold a full second copy.
#[must_use]
pub const fn space_needed(size_bytes: u64, already: u64, same_filesystem: bool) -> (u64, u64) {
    let cache = size_bytes.saturating_sub(already);
    let models = if same_filesystem { 0 } else { size_bytes };
    (cache, models)
}

/// Whether two paths (or their nearest existing ancestors) share a device
#[must_use]
pub fn same_filesystem(a: &Path, b: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    let device = |path: &Path| {
        path.ancestors()
            .find_map(|p| fs::metadata(p).ok())
            .map(|m| m.dev())
    };
    match (device(a), device(b)) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

#[must_use]
pub fn has_enough_space(path: &Path, required_bytes: u64) -> bool {
    available_space(path) >= required_bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> ModelManager {
        ModelManager::new(ModelManagerConfig::in_dir(dir.path())).unwrap()
    }

    #[test]
    fn test_status_not_found() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let descriptor = ModelDescriptor::new("m", "http://localhost/m.gguf", "m.gguf", 3);
        assert_eq!(manager.status(&descriptor), ModelStatus::NotFound);
    }

    #[test]
    fn test_status_checks_checksum() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let descriptor = ModelDescriptor::new("m", "http://localhost/m.gguf", "m.gguf", 3)
            .with_checksum("BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD");

        fs::write(manager.model_path(&descriptor), b"abc").unwrap();
        assert_eq!(manager.status(&descriptor), ModelStatus::Available);

        fs::write(manager.model_path(&descriptor), b"abd").unwrap();
        assert_eq!(manager.status(&descriptor), ModelStatus::Corrupted);
    }

    #[test]
    fn test_status_skips_checksum_when_disabled() {
        let dir = TempDir::new().unwrap();
        let mut config = ModelManagerConfig::in_dir(dir.path());
        config.verify_checksum = false;
        let manager = ModelManager::new(config).unwrap();
        let descriptor = ModelDescriptor::new("m", "http://localhost/m.gguf", "m.gguf", 3)
            .with_checksum("00");

        fs::write(manager.model_path(&descriptor), b"abd").unwrap();
        assert_eq!(manager.status(&descriptor), ModelStatus::Available);
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(ModelStatus::NotFound.to_string(), "not found");
        assert_eq!(ModelStatus::Corrupted.as_str(), "corrupted");
    }

    #[test]
    fn test_validate_descriptor() {
        let ok = ModelDescriptor::new("m", "http://localhost/m.gguf", "m.gguf", 3);
        assert!(validate_descriptor(&ok).is_ok());

        let traversal = ModelDescriptor::new("m", "http://localhost/m.gguf", "../m.gguf", 3);
        assert!(matches!(
            validate_descriptor(&traversal),
            Err(EmberError::InvalidArgument(_))
        ));

        let no_url = ModelDescriptor::new("m", "", "m.gguf", 3);
        assert!(matches!(
            validate_descriptor(&no_url),
            Err(EmberError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_pins_block_delete() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let descriptor = ModelDescriptor::new("m", "http://localhost/m.gguf", "m.gguf", 3);
        fs::write(manager.model_path(&descriptor), b"abc").unwrap();

        let pin = manager.pin(&descriptor);
        let second = manager.pin(&descriptor);
        assert!(matches!(
            manager.delete_model(&descriptor),
            Err(EmberError::InUse(_))
        ));

        drop(pin);
        assert!(manager.delete_model(&descriptor).is_err());

        drop(second);
        assert!(manager.delete_model(&descriptor).unwrap());
        assert!(!manager.model_path(&descriptor).exists());
        assert!(!manager.delete_model(&descriptor).unwrap());
    }

    #[test]
    fn test_clean_cache_removes_partials_only() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let cache = &manager.config().cache_dir;
        fs::write(cache.join("a.gguf.partial"), vec![0u8; 10]).unwrap();
        fs::write(cache.join("notes.txt"), b"keep").unwrap();

        assert_eq!(manager.clean_cache().unwrap(), 10);
        assert!(!cache.join("a.gguf.partial").exists());
        assert!(cache.join("notes.txt").exists());
    }

    #[test]
    fn test_available_space() {
        let dir = TempDir::new().unwrap();
        assert!(available_space(dir.path()) > 0);
        assert!(available_space(&dir.path().join("missing/child")) > 0);
        assert!(has_enough_space(dir.path(), 1));
        assert!(!has_enough_space(dir.path(), u64::MAX));
    }

    #[test]
    fn test_space_needed_counts_install_copy_across_filesystems() {
        assert_eq!(space_needed(1000, 300, true), (700, 0));
        assert_eq!(space_needed(1000, 300, false), (700, 1000));
        assert_eq!(space_needed(1000, 1500, true), (0, 0));
        assert_eq!(space_needed(0, 0, false), (0, 0));
    }

    #[test]
    fn test_same_filesystem() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("models");
        fs::create_dir(&sub).unwrap();
        assert!(same_filesystem(dir.path(), &sub));
        // Missing paths resolve to their nearest existing ancestor
        assert!(same_filesystem(&sub.join(".cache"), dir.path()));
    }

    #[test]
    fn test_check_space_rejects_oversized_model() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        assert!(manager.check_space(1, 0).is_ok());
        assert!(matches!(
            manager.check_space(u64::MAX, 0),
            Err(EmberError::InsufficientSpace { .. })
        ));
    }

    #[test]
    fn test_claim_covers_shared_partial_file() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let first = ModelDescriptor::new("a", "http://localhost/a", "m.gguf", 3);
        let second = ModelDescriptor::new("b", "http://localhost/b", "m.gguf", 3);

        let guard = manager.claim(&first).unwrap();
        assert!(matches!(
            manager.claim(&second),
            Err(EmberError::Download(DownloadError::AlreadyInProgress(_)))
        ));
        drop(guard);
        assert!(manager.claim(&second).is_ok());
    }

    #[tokio::test]
    async fn test_nonblocking_status_matches_status() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let descriptor = ModelDescriptor::new("m", "http://localhost/m.gguf", "m.gguf", 3)
            .with_checksum("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");

        assert_eq!(manager.status_nonblocking(&descriptor).await, ModelStatus::NotFound);
        fs::write(manager.model_path(&descriptor), b"abc").unwrap();
        assert_eq!(manager.status_nonblocking(&descriptor).await, ModelStatus::Available);
        fs::write(manager.model_path(&descriptor), b"abd").unwrap();
        assert_eq!(manager.status_nonblocking(&descriptor).await, ModelStatus::Corrupted);
    }
}
