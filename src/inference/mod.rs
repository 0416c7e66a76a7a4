#[cfg(feature = "local")]
pub mod gguf;
#[cfg(feature = "local")]
pub mod local;
pub mod registry;
pub mod remote;
#[cfg(feature = "local")]
pub mod runtime;
pub mod sampling;
#[cfg(feature = "local")]
pub mod tokenizer;
pub mod types;

use crate::error::{EmberError, Result};
use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

#[cfg(feature = "local")]
pub use local::LocalBackend;
pub use registry::BackendRegistry;
pub use remote::{RemoteBackend, RemoteConfig};
pub use types::{BackendConfig, Capabilities, FinishReason, GenerationRequest, GenerationResponse};

/// Lifecycle of a backend instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Uninitialized,
    Initialized,
    ModelLoaded,
    Generating,
    Error,
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Uninitialized => "uninitialized",
            Self::Initialized => "initialized",
            Self::ModelLoaded => "loaded",
            Self::Generating => "generating",
            Self::Error => "in an error state",
        })
    }
}

/// Backend implementations known to this crate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Local,
    LightweightLocal,
    Remote,
}

impl BackendKind {
    pub const ALL: [Self; 3] = [Self::Local, Self::LightweightLocal, Self::Remote];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::LightweightLocal => "lightweight",
            Self::Remote => "remote",
        }
    }

    /// Whether the implementation was compiled into this build
    #[must_use]
    pub const fn is_available(self) -> bool {
        match self {
            Self::Local => cfg!(feature = "local"),
            Self::LightweightLocal => cfg!(feature = "lightweight"),
            Self::Remote => true,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = EmberError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(Self::Local),
            "lightweight" => Ok(Self::LightweightLocal),
            "remote" => Ok(Self::Remote),
            other => Err(EmberError::Config(format!(
                "Unknown backend: {other}. Expected one of: local, lightweight, remote"
            ))),
        }
    }
}

/// Text generation backend.
///
/// Lifecycle operations take `&mut self`; `generate` takes `&self` and
/// returns [`BackendError::Busy`](crate::error::BackendError::Busy) instead of
/// waiting when another generation holds the instance.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn state(&self) -> BackendState;

    /// Valid only from `Uninitialized`
    fn init(&mut self, config: BackendConfig) -> Result<()>;

    /// Replaces any loaded model. A missing path leaves the state untouched;
    /// an unreadable model moves the backend to `Error`.
    fn load_model(&mut self, path: &Path) -> Result<()>;

    fn unload_model(&mut self) -> Result<()>;

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse>;

    fn capabilities(&self) -> Result<Capabilities>;

    /// Name of the loaded model, if any
    fn model_name(&self) -> Option<String>;

    /// Release everything; valid from any state
    fn cleanup(&mut self);

    fn is_initialized(&self) -> bool {
        matches!(
            self.state(),
            BackendState::Initialized | BackendState::ModelLoaded | BackendState::Generating
        )
    }

    fn is_loaded(&self) -> bool {
        matches!(
            self.state(),
            BackendState::ModelLoaded | BackendState::Generating
        )
    }
}

/// Compiled-in backends behind one type
#[derive(Debug)]
pub enum Backend {
    #[cfg(feature = "local")]
    Local(LocalBackend),
    Remote(RemoteBackend),
}

impl Backend {
    /// Create an uninitialized backend of `kind`
    pub fn create(kind: BackendKind, remote: &RemoteConfig) -> Result<Self> {
        if !kind.is_available() {
            return Err(EmberError::NotSupported(kind.as_str().to_string()));
        }

        match kind {
            #[cfg(feature = "local")]
            BackendKind::Local => Ok(Self::Local(LocalBackend::new())),
            #[cfg(feature = "lightweight")]
            BackendKind::LightweightLocal => Ok(Self::Local(LocalBackend::lightweight())),
            BackendKind::Remote => Ok(Self::Remote(RemoteBackend::new(remote.clone()))),
            #[allow(unreachable_patterns)]
            other => Err(EmberError::NotSupported(other.as_str().to_string())),
        }
    }

    fn inner(&self) -> &dyn InferenceBackend {
        match self {
            #[cfg(feature = "local")]
            Self::Local(backend) => backend,
            Self::Remote(backend) => backend,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn InferenceBackend {
        match self {
            #[cfg(feature = "local")]
            Self::Local(backend) => backend,
            Self::Remote(backend) => backend,
        }
    }
}

#[async_trait]
impl InferenceBackend for Backend {
    fn kind(&self) -> BackendKind {
        self.inner().kind()
    }

    fn state(&self) -> BackendState {
        self.inner().state()
    }

    fn init(&mut self, config: BackendConfig) -> Result<()> {
        self.inner_mut().init(config)
    }

    fn load_model(&mut self, path: &Path) -> Result<()> {
        self.inner_mut().load_model(path)
    }

    fn unload_model(&mut self) -> Result<()> {
        self.inner_mut().unload_model()
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        match self {
            #[cfg(feature = "local")]
            Self::Local(backend) => backend.generate(request).await,
            Self::Remote(backend) => backend.generate(request).await,
        }
    }

    fn capabilities(&self) -> Result<Capabilities> {
        self.inner().capabilities()
    }

    fn model_name(&self) -> Option<String> {
        self.inner().model_name()
    }

    fn cleanup(&mut self) {
        self.inner_mut().cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for kind in BackendKind::ALL {
            assert_eq!(kind.as_str().parse::<BackendKind>().unwrap(), kind);
        }
        assert!(matches!(
            "gpu".parse::<BackendKind>(),
            Err(EmberError::Config(_))
        ));
    }

    #[test]
    fn test_remote_always_available() {
        assert!(BackendKind::Remote.is_available());
        assert_eq!(BackendKind::Local.is_available(), cfg!(feature = "local"));
        assert_eq!(
            BackendKind::LightweightLocal.is_available(),
            cfg!(feature = "lightweight")
        );
    }

    #[test]
    fn test_create_unavailable_is_not_supported() {
        let remote = RemoteConfig::default();
        for kind in BackendKind::ALL {
            let created = Backend::create(kind, &remote);
            if kind.is_available() {
                let backend = created.unwrap();
                assert_eq!(backend.kind(), kind);
                assert_eq!(backend.state(), BackendState::Uninitialized);
            } else {
                assert!(matches!(created, Err(EmberError::NotSupported(_))));
            }
        }
    }
}
