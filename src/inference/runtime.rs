//! Seam between the generation loop and the tensor execution engine.

use crate::error::Result;
use crate::inference::gguf::ModelFile;
use crate::inference::types::TokenId;

pub use candle::CandleLoader;

/// Settings passed to a loader for one model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeOptions {
    pub context_length: usize,
    pub use_accelerator: bool,
    pub accelerator_layers: u32,
}

/// One loaded model with its own KV cache
pub trait ModelRuntime: Send {
    /// Evaluate `tokens` starting at sequence position `pos` and return the
    /// logits for the last of them. `pos == 0` starts a new sequence.
    fn forward(&mut self, tokens: &[TokenId], pos: usize) -> Result<Vec<f32>>;
}

/// Builds a [`ModelRuntime`] from a model file whose header was already parsed
pub trait RuntimeLoader: Send + Sync {
    fn load(&self, model: ModelFile, options: &RuntimeOptions) -> Result<Box<dyn ModelRuntime>>;
}

mod candle {
    use super::{ModelRuntime, RuntimeLoader, RuntimeOptions};
    use crate::error::{BackendError, EmberError, Result};
    use crate::inference::gguf::ModelFile;
    use crate::inference::types::TokenId;
    use candle_core::{DType, Device, Tensor};
    use candle_transformers::models::quantized_llama::ModelWeights;

    /// Architectures served by candle's quantized llama implementation
    const SUPPORTED_ARCHITECTURES: &[&str] = &["llama", "mistral"];

    fn execution(err: candle_core::Error) -> EmberError {
        BackendError::Execution(err.to_string()).into()
    }

    /// Runs llama-family GGUF models with candle
    #[derive(Debug, Clone, Copy, Default)]
    pub struct CandleLoader;

    impl RuntimeLoader for CandleLoader {
        fn load(&self, model: ModelFile, options: &RuntimeOptions) -> Result<Box<dyn ModelRuntime>> {
            let arch = model.architecture().unwrap_or("llama").to_string();
            if !SUPPORTED_ARCHITECTURES.contains(&arch.as_str()) {
                return Err(BackendError::InvalidContainer(format!(
                    "architecture '{arch}' is not supported by the local backend"
                ))
                .into());
            }
            let name = model.model_name().unwrap_or(&arch).to_string();

            // Candle offloads the whole model or nothing
            let device = if options.use_accelerator {
                Device::cuda_if_available(0).map_err(execution)?
            } else {
                Device::Cpu
            };
            if options.use_accelerator && options.accelerator_layers > 0 {
                tracing::debug!(
                    "accelerator_layers = {} ignored; offloading all layers",
                    options.accelerator_layers
                );
            }

            let (content, mut reader) = model.into_parts();
            let weights = ModelWeights::from_gguf(content, &mut reader, &device)
                .map_err(|e| BackendError::InvalidContainer(e.to_string()))?;

            tracing::info!(
                "Loaded {name} on {}",
                if device.is_cuda() { "CUDA" } else { "CPU" }
            );

            Ok(Box::new(CandleRuntime { weights, device }))
        }
    }

    struct CandleRuntime {
        weights: ModelWeights,
        device: Device,
    }

    impl ModelRuntime for CandleRuntime {
        fn forward(&mut self, tokens: &[TokenId], pos: usize) -> Result<Vec<f32>> {
            let input = Tensor::new(tokens, &self.device)
                .and_then(|t| t.unsqueeze(0))
                .map_err(execution)?;
            self.weights
                .forward(&input, pos)
                .and_then(|logits| logits.squeeze(0))
                .and_then(|logits| logits.to_dtype(DType::F32))
                .and_then(|logits| logits.to_vec1::<f32>())
                .map_err(execution)
        }
    }
}
