use crate::error::{BackendError, EmberError, Result};
use crate::inference::gguf::ModelFile;
use crate::inference::runtime::{CandleLoader, ModelRuntime, RuntimeLoader, RuntimeOptions};
use crate::inference::sampling::Sampler;
use crate::inference::tokenizer::{StreamDecoder, Tokenizer};
use crate::inference::types::{
    BackendConfig, Capabilities, FinishReason, GenerationRequest, GenerationResponse, TokenId,
};
use crate::inference::{BackendKind, BackendState, InferenceBackend};
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

/// Context cap of the constrained-device profile
const LIGHTWEIGHT_CONTEXT_LENGTH: u32 = 512;
const RECOMMENDED_CONTEXT_LENGTH: u32 = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Profile {
    Standard,
    Lightweight,
}

/// Everything a generation mutates, guarded by one async lock
struct Context {
    tokens: Vec<TokenId>,
    model: Option<LoadedModel>,
}

struct LoadedModel {
    name: String,
    path: PathBuf,
    tokenizer: Tokenizer,
    runtime: Box<dyn ModelRuntime>,
    context_length: usize,
}

/// Runs GGUF models in-process
pub struct LocalBackend {
    profile: Profile,
    loader: Arc<dyn RuntimeLoader>,
    state: Mutex<BackendState>,
    config: Option<BackendConfig>,
    context: tokio::sync::Mutex<Context>,
}

impl fmt::Debug for LocalBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalBackend")
            .field("profile", &self.profile)
            .field("state", &self.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBackend {
    /// Backend executing models with candle
    #[must_use]
    pub fn new() -> Self {
        Self::with_loader(Arc::new(CandleLoader))
    }

    /// Constrained-device profile: context capped at 512 tokens, CPU only,
    /// one token per forward pass
    #[cfg(feature = "lightweight")]
    #[must_use]
    pub fn lightweight() -> Self {
        Self::lightweight_with_loader(Arc::new(CandleLoader))
    }

    /// Backend executing models with a custom runtime
    #[must_use]
    pub fn with_loader(loader: Arc<dyn RuntimeLoader>) -> Self {
        Self::build(Profile::Standard, loader)
    }

    #[cfg(feature = "lightweight")]
    #[must_use]
    pub fn lightweight_with_loader(loader: Arc<dyn RuntimeLoader>) -> Self {
        Self::build(Profile::Lightweight, loader)
    }

    fn build(profile: Profile, loader: Arc<dyn RuntimeLoader>) -> Self {
        Self {
            profile,
            loader,
            state: Mutex::new(BackendState::Uninitialized),
            config: None,
            context: tokio::sync::Mutex::new(Context {
                tokens: Vec::new(),
                model: None,
            }),
        }
    }

    fn set_state(&self, state: BackendState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn require(&self, operation: &'static str, allowed: &[BackendState]) -> Result<()> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(BackendError::InvalidState { operation, state }.into())
        }
    }

    fn batch_size(&self, context_length: usize) -> usize {
        match self.profile {
            Profile::Standard => context_length,
            Profile::Lightweight => 1,
        }
    }

    fn open_model(&self, path: &Path, config: &BackendConfig) -> Result<LoadedModel> {
        let model = ModelFile::open(path)?;
        let tokenizer = Tokenizer::from_metadata(model.metadata())?;

        let mut context_length = config.context_length as usize;
        if let Some(trained) = model.context_length().and_then(|n| usize::try_from(n).ok()) {
            if trained < context_length {
                tracing::info!("Model trained with {trained} tokens of context; capping");
                context_length = trained;
            }
        }

        let name = model
            .model_name()
            .map(str::to_string)
            .or_else(|| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "unknown".to_string());
        let quantization = model.quantization().unwrap_or("unknown quantization");

        let options = RuntimeOptions {
            context_length,
            use_accelerator: config.use_accelerator,
            accelerator_layers: config.accelerator_layers,
        };
        let runtime = self.loader.load(model, &options)?;

        tracing::info!(
            "Model {name} ready: {} tokens, {} context, {quantization}",
            tokenizer.vocab_size(),
            context_length,
        );

        Ok(LoadedModel {
            name,
            path: path.to_path_buf(),
            tokenizer,
            runtime,
            context_length,
        })
    }
}

/// Restores `ModelLoaded` when a generation ends, even if its future is dropped
struct GeneratingGuard<'a>(&'a LocalBackend);

impl Drop for GeneratingGuard<'_> {
    fn drop(&mut self) {
        self.0.set_state(BackendState::ModelLoaded);
    }
}

#[async_trait]
impl InferenceBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        match self.profile {
            Profile::Standard => BackendKind::Local,
            Profile::Lightweight => BackendKind::LightweightLocal,
        }
    }

    fn state(&self) -> BackendState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn init(&mut self, config: BackendConfig) -> Result<()> {
        self.require("initialize", &[BackendState::Uninitialized])?;

        let mut config = config.normalized()?;
        if self.profile == Profile::Lightweight {
            if config.context_length > LIGHTWEIGHT_CONTEXT_LENGTH {
                tracing::debug!(
                    "Capping context from {} to {LIGHTWEIGHT_CONTEXT_LENGTH} tokens",
                    config.context_length
                );
                config.context_length = LIGHTWEIGHT_CONTEXT_LENGTH;
            }
            config.use_accelerator = false;
            config.accelerator_layers = 0;
        }

        let context = self.context.get_mut();
        context.tokens = Vec::new();
        context
            .tokens
            .try_reserve_exact(config.context_length as usize)
            .map_err(|e| {
                EmberError::OutOfMemory(format!(
                    "cannot reserve a {}-token context: {e}",
                    config.context_length
                ))
            })?;

        tracing::info!(
            "Initialized {} backend with {} tokens of context",
            self.kind(),
            config.context_length
        );
        self.config = Some(config);
        self.set_state(BackendState::Initialized);
        Ok(())
    }

    fn load_model(&mut self, path: &Path) -> Result<()> {
        self.require(
            "load a model",
            &[BackendState::Initialized, BackendState::ModelLoaded],
        )?;
        if path.as_os_str().is_empty() {
            return Err(EmberError::InvalidArgument("empty model path".to_string()));
        }
        if !path.exists() {
            return Err(BackendError::ModelNotFound(path.to_path_buf()).into());
        }

        if let Some(previous) = self.context.get_mut().model.take() {
            tracing::info!("Unloading {} before loading {}", previous.name, path.display());
            self.set_state(BackendState::Initialized);
        }

        let Some(config) = self.config.as_ref() else {
            return Err(BackendError::InvalidState {
                operation: "load a model",
                state: BackendState::Uninitialized,
            }
            .into());
        };

        match self.open_model(path, config) {
            Ok(model) => {
                self.context.get_mut().model = Some(model);
                self.set_state(BackendState::ModelLoaded);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to load {}: {e}", path.display());
                self.set_state(BackendState::Error);
                Err(e)
            }
        }
    }

    fn unload_model(&mut self) -> Result<()> {
        self.require("unload a model", &[BackendState::ModelLoaded])?;
        if let Some(model) = self.context.get_mut().model.take() {
            tracing::info!("Unloaded {} ({})", model.name, model.path.display());
        }
        self.set_state(BackendState::Initialized);
        Ok(())
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        let Ok(mut context) = self.context.try_lock() else {
            return Err(BackendError::Busy.into());
        };
        self.require("generate", &[BackendState::ModelLoaded])?;
        let Some(config) = self.config.as_ref() else {
            return Err(BackendError::InvalidState {
                operation: "generate",
                state: BackendState::Uninitialized,
            }
            .into());
        };

        self.set_state(BackendState::Generating);
        let _guard = GeneratingGuard(self);
        let started = Instant::now();

        let Context { tokens, model } = &mut *context;
        let Some(model) = model.as_mut() else {
            return Err(BackendError::Execution("no model loaded".to_string()).into());
        };

        let prompt = model.tokenizer.encode(&request.prompt)?;
        if prompt.is_empty() {
            return Err(BackendError::Tokenize("prompt produced no tokens".to_string()).into());
        }
        if prompt.len() >= model.context_length {
            return Err(BackendError::PromptTooLong {
                tokens: prompt.len(),
                context: model.context_length,
            }
            .into());
        }

        tokens.clear();
        tokens.extend_from_slice(&prompt);

        let batch = self.batch_size(model.context_length);
        let mut logits = Vec::new();
        for (i, chunk) in prompt.chunks(batch).enumerate() {
            logits = model.runtime.forward(chunk, i * batch)?;
        }
        tracing::debug!("Prefilled {} prompt tokens", prompt.len());

        let limit = request.token_limit(config.max_tokens) as usize;
        let mut sampler = Sampler::new(config.temperature, config.top_p, config.seed);
        let mut decoder = StreamDecoder::default();
        let mut text = String::new();
        let mut generated = 0usize;
        let mut probability_sum = 0.0f32;
        let mut sampled = 0usize;

        let finish_reason = loop {
            if request.is_cancelled() {
                break FinishReason::Cancelled;
            }
            if tokens.len() >= model.context_length {
                break FinishReason::Length;
            }

            let sample = sampler.sample(&logits).ok_or_else(|| {
                EmberError::from(BackendError::Execution(
                    "model produced no finite logits".to_string(),
                ))
            })?;
            probability_sum += sample.probability;
            sampled += 1;

            if model.tokenizer.is_end_of_generation(sample.token) {
                break FinishReason::Stop;
            }

            text.push_str(&decoder.push(&model.tokenizer, sample.token));
            tokens.push(sample.token);
            generated += 1;
            if generated >= limit {
                break FinishReason::Length;
            }

            logits = model.runtime.forward(&[sample.token], tokens.len() - 1)?;
            tokio::task::yield_now().await;
        };
        text.push_str(&decoder.finish());

        #[allow(clippy::cast_precision_loss)]
        let confidence = if sampled == 0 {
            0.0
        } else {
            probability_sum / sampled as f32
        };
        let processing_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        tracing::debug!(
            "Generated {generated} tokens in {processing_time_ms} ms ({finish_reason})"
        );

        Ok(GenerationResponse {
            text,
            token_count: u32::try_from(generated).unwrap_or(u32::MAX),
            processing_time_ms,
            confidence,
            truncated: finish_reason != FinishReason::Stop,
            finish_reason,
            model_name: model.name.clone(),
            language_code: request
                .language
                .clone()
                .unwrap_or_else(|| config.language_code.clone()),
        })
    }

    fn capabilities(&self) -> Result<Capabilities> {
        self.require(
            "report capabilities",
            &[
                BackendState::Initialized,
                BackendState::ModelLoaded,
                BackendState::Generating,
            ],
        )?;

        let configured = self
            .config
            .as_ref()
            .map_or(RECOMMENDED_CONTEXT_LENGTH, |c| c.context_length);
        let max_context_length = self
            .context
            .try_lock()
            .ok()
            .and_then(|c| c.model.as_ref().map(|m| m.context_length))
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(configured);

        Ok(match self.profile {
            Profile::Standard => Capabilities {
                model_format: "GGUF",
                max_context_length,
                recommended_context_length: RECOMMENDED_CONTEXT_LENGTH,
                supports_accelerator: candle_core::utils::cuda_is_available(),
                supports_streaming: false,
                supports_quantization: true,
                max_batch_size: max_context_length,
            },
            Profile::Lightweight => Capabilities {
                model_format: "GGUF",
                max_context_length,
                recommended_context_length: LIGHTWEIGHT_CONTEXT_LENGTH,
                supports_accelerator: false,
                supports_streaming: false,
                supports_quantization: true,
                max_batch_size: 1,
            },
        })
    }

    fn model_name(&self) -> Option<String> {
        self.context
            .try_lock()
            .ok()
            .and_then(|c| c.model.as_ref().map(|m| m.name.clone()))
    }

    fn cleanup(&mut self) {
        let context = self.context.get_mut();
        context.model = None;
        context.tokens = Vec::new();
        self.config = None;
        self.set_state(BackendState::Uninitialized);
        tracing::debug!("{} backend cleaned up", self.kind());
    }
}
