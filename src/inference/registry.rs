use crate::error::{EmberError, Result};
use crate::inference::remote::RemoteConfig;
use crate::inference::types::{BackendConfig, GenerationRequest, GenerationResponse};
use crate::inference::{Backend, BackendKind, InferenceBackend};
use std::path::Path;

/// Caller-owned set of backends with one selected for generation
#[derive(Debug, Default)]
pub struct BackendRegistry {
    backends: Vec<Backend>,
    selected: Option<BackendKind>,
}

impl BackendRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend kinds compiled into this build
    #[must_use]
    pub fn available_kinds() -> Vec<BackendKind> {
        BackendKind::ALL
            .into_iter()
            .filter(|k| k.is_available())
            .collect()
    }

    #[must_use]
    pub const fn is_available(kind: BackendKind) -> bool {
        kind.is_available()
    }

    /// Add a backend, replacing (and cleaning up) one of the same kind.
    /// The first registered backend becomes the selected one.
    pub fn register(&mut self, backend: Backend) {
        let kind = backend.kind();
        if let Some(mut previous) = self.remove(kind) {
            previous.cleanup();
        }

        tracing::debug!("Registered {kind} backend");
        self.backends.push(backend);
        if self.selected.is_none() {
            self.selected = Some(kind);
        }
    }

    /// Create, initialize and register a backend of `kind`, loading
    /// `config.model_path` when set
    pub fn create(
        &mut self,
        kind: BackendKind,
        config: BackendConfig,
        remote: &RemoteConfig,
    ) -> Result<&mut Backend> {
        let mut backend = Backend::create(kind, remote)?;
        let model_path = config.model_path.clone();
        backend.init(config)?;
        if let Some(path) = model_path {
            backend.load_model(&path)?;
        }

        self.register(backend);
        self.get_mut(kind)
            .ok_or_else(|| EmberError::NotFound(kind.as_str().to_string()))
    }

    /// Remove a backend without cleaning it up
    pub fn remove(&mut self, kind: BackendKind) -> Option<Backend> {
        let index = self.backends.iter().position(|b| b.kind() == kind)?;
        if self.selected == Some(kind) {
            self.selected = None;
        }
        Some(self.backends.remove(index))
    }

    #[must_use]
    pub fn get(&self, kind: BackendKind) -> Option<&Backend> {
        self.backends.iter().find(|b| b.kind() == kind)
    }

    pub fn get_mut(&mut self, kind: BackendKind) -> Option<&mut Backend> {
        self.backends.iter_mut().find(|b| b.kind() == kind)
    }

    #[must_use]
    pub fn kinds(&self) -> Vec<BackendKind> {
        self.backends.iter().map(InferenceBackend::kind).collect()
    }

    /// Route `generate` to a registered backend
    pub fn select(&mut self, kind: BackendKind) -> Result<()> {
        if !kind.is_available() {
            return Err(EmberError::NotSupported(kind.as_str().to_string()));
        }
        if self.get(kind).is_none() {
            return Err(EmberError::Config(format!(
                "Backend '{kind}' is not registered"
            )));
        }

        self.selected = Some(kind);
        Ok(())
    }

    #[must_use]
    pub const fn selected_kind(&self) -> Option<BackendKind> {
        self.selected
    }

    #[must_use]
    pub fn selected(&self) -> Option<&Backend> {
        self.selected.and_then(|kind| self.get(kind))
    }

    /// Load a model into the selected backend
    pub fn load_model(&mut self, path: &Path) -> Result<()> {
        let kind = self.selected.ok_or_else(no_selection)?;
        self.get_mut(kind).ok_or_else(no_selection)?.load_model(path)
    }

    /// Generate with the selected backend
    pub async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        let backend = self.selected().ok_or_else(no_selection)?;
        backend.generate(request).await
    }

    /// Clean up and drop every backend
    pub fn clear(&mut self) {
        for backend in &mut self.backends {
            backend.cleanup();
        }
        self.backends.clear();
        self.selected = None;
    }
}

impl Drop for BackendRegistry {
    fn drop(&mut self) {
        self.clear();
    }
}

fn no_selection() -> EmberError {
    EmberError::Config("No backend selected".to_string())
}
