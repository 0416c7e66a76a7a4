use crate::inference::BackendState;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for emberlm
#[derive(Error, Debug)]
pub enum EmberError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not enough disk space: {required} bytes required, {available} bytes available\n\nTroubleshooting:\n- Free space on the volume holding models_dir and cache_dir\n- Point models_dir at a larger volume in config\n- Run `emberlm clean` to drop stale partial downloads")]
    InsufficientSpace { required: u64, available: u64 },

    #[error("Out of memory: {0}\n\nTroubleshooting:\n- Lower context_length in the [backend] config section\n- Try a smaller model (emberlm list shows min RAM per model)")]
    OutOfMemory(String),

    #[error("Download error: {0}")]
    Download(#[from] DownloadError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Backend '{0}' is not supported in this build\n\nTroubleshooting:\n- Rebuild with the matching cargo feature (local, lightweight)\n- Switch to the remote backend: set kind = \"remote\" in config")]
    NotSupported(String),

    #[error("Model '{0}' is not available locally. Download it with: emberlm pull {0}")]
    NotFound(String),

    #[error("Model file is in use: {}\n\nUnload the model from its backend first", .0.display())]
    InUse(PathBuf),

    #[error("Config error: {0}\n\nTroubleshooting:\n- Check config file: ~/.config/emberlm/config.toml\n- Run with RUST_LOG=debug for more details")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while fetching a model artifact
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Network error: {message}")]
    Network { message: String, transient: bool },

    #[error("HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("No data received for {0:?}")]
    Timeout(Duration),

    #[error("Download failed after {attempts} attempts: {last}\n\nTroubleshooting:\n- Check internet connection\n- Increase max_retries or timeout_secs in the [models] config section\n- The partial file is kept; rerun the command to resume")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("Checksum mismatch: expected {expected}, got {actual}. The corrupted file was removed; retry the download")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Download of '{0}' was cancelled; the partial file is kept for resuming")]
    Cancelled(String),

    #[error("Download of '{0}' is already in progress")]
    AlreadyInProgress(String),
}

impl DownloadError {
    /// Whether another attempt may succeed without caller intervention
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Network { transient, .. } => *transient,
            Self::Timeout(_) => true,
            Self::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// Inference backend errors
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Cannot {operation} while backend is {state}")]
    InvalidState {
        operation: &'static str,
        state: BackendState,
    },

    #[error("Backend is busy with another generation")]
    Busy,

    #[error("Model file not found: {}", .0.display())]
    ModelNotFound(PathBuf),

    #[error("Invalid model container: {0}\n\nTroubleshooting:\n- Make sure the file is a GGUF model (emberlm status <model> verifies it)\n- Re-download the model: emberlm rm <model> && emberlm pull <model>")]
    InvalidContainer(String),

    #[error("Failed to tokenize prompt: {0}")]
    Tokenize(String),

    #[error("Prompt is {tokens} tokens but the context holds {context}")]
    PromptTooLong { tokens: usize, context: usize },

    #[error("Model execution failed: {0}")]
    Execution(String),

    #[error("Invalid API key\n\nTroubleshooting:\n- Check the environment variable named by api_key_env in the [remote] config section")]
    InvalidApiKey,

    #[error("Remote endpoint error: {0}")]
    Remote(String),

    #[error("Remote request failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

pub type Result<T> = std::result::Result<T, EmberError>;
