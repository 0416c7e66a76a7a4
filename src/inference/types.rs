use crate::cancel::CancelFlag;
use crate::error::{EmberError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Index into a model vocabulary
pub type TokenId = u32;

pub const DEFAULT_CONTEXT_LENGTH: u32 = 2048;
pub const DEFAULT_MAX_TOKENS: u32 = 512;

/// Tuning copied into a backend at `init`; changing it requires a fresh `init`
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct BackendConfig {
    /// Model loaded by the registry right after `init`, if set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_path: Option<PathBuf>,
    /// Context window in tokens; 0 selects the default
    #[serde(default = "default_context_length")]
    pub context_length: u32,
    /// Upper bound on generated tokens; 0 selects the default
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Values `<= 0.0` select greedy decoding
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    /// Sampler seed; 0 derives one from the clock
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub use_accelerator: bool,
    #[serde(default)]
    pub accelerator_layers: u32,
    #[serde(default = "default_language", rename = "language")]
    pub language_code: String,
}

fn default_context_length() -> u32 {
    DEFAULT_CONTEXT_LENGTH
}
fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}
fn default_temperature() -> f32 {
    0.7
}
fn default_top_p() -> f32 {
    0.9
}
fn default_language() -> String {
    "en".to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            model_path: None,
            context_length: default_context_length(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            seed: 0,
            use_accelerator: false,
            accelerator_layers: 0,
            language_code: default_language(),
        }
    }
}

impl BackendConfig {
    /// Reject values that cannot be sampled with and fill zeroed sizes with defaults
    pub fn normalized(mut self) -> Result<Self> {
        if self.context_length == 0 {
            self.context_length = DEFAULT_CONTEXT_LENGTH;
        }
        if self.max_tokens == 0 {
            self.max_tokens = DEFAULT_MAX_TOKENS;
        }

        if !self.temperature.is_finite() {
            return Err(EmberError::InvalidArgument(format!(
                "temperature must be finite, got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(EmberError::InvalidArgument(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if self.language_code.is_empty() {
            return Err(EmberError::InvalidArgument(
                "language code must not be empty".to_string(),
            ));
        }

        Ok(self)
    }
}

/// What a backend supports, valid once it is initialized
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub model_format: &'static str,
    pub max_context_length: u32,
    pub recommended_context_length: u32,
    pub supports_accelerator: bool,
    pub supports_streaming: bool,
    pub supports_quantization: bool,
    pub max_batch_size: u32,
}

/// One generation call
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Echoed back in the response; the configured language when absent
    pub language: Option<String>,
    /// Per-call limit, clamped to the configured `max_tokens`
    pub max_tokens: Option<u32>,
    pub cancel: Option<CancelFlag>,
}

impl GenerationRequest {
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    #[must_use]
    pub const fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Effective token limit under `configured`
    #[must_use]
    pub fn token_limit(&self, configured: u32) -> u32 {
        self.max_tokens
            .filter(|n| *n > 0)
            .map_or(configured, |n| n.min(configured))
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelFlag::is_cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    /// An end-of-generation token was sampled
    Stop,
    /// The token limit or the context window was reached
    Length,
    /// The caller's cancel flag was raised
    Cancelled,
}

impl FinishReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationResponse {
    pub text: String,
    pub token_count: u32,
    pub processing_time_ms: u64,
    /// Mean probability of the sampled tokens in `[0, 1]`
    pub confidence: f32,
    pub truncated: bool,
    pub finish_reason: FinishReason,
    pub model_name: String,
    pub language_code: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_backend_config() {
        let config: BackendConfig = toml::from_str("temperature = 0.0\nlanguage = \"de\"").unwrap();
        assert_eq!(config.context_length, DEFAULT_CONTEXT_LENGTH);
        assert_eq!(config.max_tokens, DEFAULT_MAX_TOKENS);
        assert!(config.temperature.abs() < f32::EPSILON);
        assert_eq!(config.language_code, "de");
    }

    #[test]
    fn test_normalized_fills_defaults() {
        let config = BackendConfig {
            context_length: 0,
            max_tokens: 0,
            ..BackendConfig::default()
        }
        .normalized()
        .unwrap();
        assert_eq!(config.context_length, 2048);
        assert_eq!(config.max_tokens, 512);
    }

    #[test]
    fn test_normalized_rejects_bad_values() {
        let nan = BackendConfig {
            temperature: f32::NAN,
            ..BackendConfig::default()
        };
        assert!(matches!(nan.normalized(), Err(EmberError::InvalidArgument(_))));

        let top_p = BackendConfig {
            top_p: 0.0,
            ..BackendConfig::default()
        };
        assert!(matches!(top_p.normalized(), Err(EmberError::InvalidArgument(_))));

        let negative = BackendConfig {
            temperature: -1.0,
            ..BackendConfig::default()
        };
        assert!(negative.normalized().is_ok());
    }

    #[test]
    fn test_token_limit() {
        assert_eq!(GenerationRequest::new("hi").token_limit(64), 64);
        assert_eq!(GenerationRequest::new("hi").with_max_tokens(8).token_limit(64), 8);
        assert_eq!(GenerationRequest::new("hi").with_max_tokens(100).token_limit(64), 64);
        assert_eq!(GenerationRequest::new("hi").with_max_tokens(0).token_limit(64), 64);
    }

    #[test]
    fn test_finish_reason_strings() {
        assert_eq!(FinishReason::Stop.to_string(), "stop");
        assert_eq!(FinishReason::Length.as_str(), "length");
        assert_eq!(
            serde_json::to_string(&FinishReason::Cancelled).unwrap(),
            "\"cancelled\""
        );
    }
}
