use crate::error::{BackendError, EmberError, Result};
use crate::inference::types::{
    BackendConfig, Capabilities, FinishReason, GenerationRequest, GenerationResponse,
};
use crate::inference::{BackendKind, BackendState, InferenceBackend};
use crate::models::download::RetryPolicy;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Remote results carry no token probabilities
const REMOTE_CONFIDENCE: f32 = 0.85;
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// `[remote]` section: an OpenAI-compatible completions endpoint
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct RemoteConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Model identifier sent with each request
    #[serde(default)]
    pub model: String,
    /// Environment variable holding the bearer token; no auth when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_endpoint() -> String {
    "http://127.0.0.1:8080".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model: String::new(),
            api_key_env: None,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    text: String,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    completion_tokens: u32,
}

/// One failed attempt, classified for the retry loop
enum AttemptError {
    Transient(String),
    Fatal(EmberError),
}

/// Generation through a remote completions endpoint
pub struct RemoteBackend {
    remote: RemoteConfig,
    client: Option<reqwest::Client>,
    api_key: Option<String>,
    config: Option<BackendConfig>,
    model: Option<String>,
    state: Mutex<BackendState>,
    busy: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for RemoteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBackend")
            .field("remote", &self.remote)
            .field("client", &"Client { ... }")
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("model", &self.model)
            .field("state", &self.state())
            .finish()
    }
}

impl RemoteBackend {
    #[must_use]
    pub fn new(remote: RemoteConfig) -> Self {
        Self {
            remote,
            client: None,
            api_key: None,
            config: None,
            model: None,
            state: Mutex::new(BackendState::Uninitialized),
            busy: tokio::sync::Mutex::new(()),
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

    fn completions_url(&self) -> String {
        format!("{}/v1/completions", self.remote.endpoint.trim_end_matches('/'))
    }

    async fn attempt(
        &self,
        client: &reqwest::Client,
        body: &CompletionRequest<'_>,
    ) -> std::result::Result<CompletionResponse, AttemptError> {
        let mut request = client.post(self.completions_url()).json(body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() || e.is_request() {
                AttemptError::Transient(e.to_string())
            } else {
                AttemptError::Fatal(BackendError::Remote(e.to_string()).into())
            }
        })?;

        let status = response.status();
        match status {
            StatusCode::OK => response.json::<CompletionResponse>().await.map_err(|e| {
                AttemptError::Fatal(
                    BackendError::Remote(format!("Failed to parse response: {e}")).into(),
                )
            }),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(AttemptError::Fatal(BackendError::InvalidApiKey.into()))
            }
            StatusCode::TOO_MANY_REQUESTS => {
                Err(AttemptError::Transient("rate limited (429)".to_string()))
            }
            s if s.is_server_error() => {
                let error_body = response.text().await.unwrap_or_default();
                Err(AttemptError::Transient(format!("server error ({s}): {error_body}")))
            }
            _ => {
                let error_body = response.text().await.unwrap_or_default();
                Err(AttemptError::Fatal(
                    BackendError::Remote(format!("API error ({status}): {error_body}")).into(),
                ))
            }
        }
    }
}

/// Restores `ModelLoaded` when a request ends
struct GeneratingGuard<'a>(&'a RemoteBackend);

impl Drop for GeneratingGuard<'_> {
    fn drop(&mut self) {
        self.0.set_state(BackendState::ModelLoaded);
    }
}

#[async_trait]
impl InferenceBackend for RemoteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    fn state(&self) -> BackendState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn init(&mut self, config: BackendConfig) -> Result<()> {
        self.require("initialize", &[BackendState::Uninitialized])?;
        let config = config.normalized()?;

        if self.remote.endpoint.is_empty() {
            return Err(EmberError::InvalidArgument(
                "remote endpoint is empty".to_string(),
            ));
        }

        self.api_key = match self.remote.api_key_env.as_deref() {
            None => None,
            Some(var) => {
                let key = std::env::var(var).map_err(|_| BackendError::InvalidApiKey)?;
                if key.is_empty() {
                    return Err(BackendError::InvalidApiKey.into());
                }
                Some(key)
            }
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.remote.timeout_secs))
            .build()
            .map_err(|e| EmberError::Config(format!("Failed to create HTTP client: {e}")))?;

        tracing::info!("Initialized remote backend for {}", self.remote.endpoint);
        self.client = Some(client);
        self.config = Some(config);
        self.set_state(BackendState::Initialized);
        Ok(())
    }

    /// The path is used as the remote model identifier
    fn load_model(&mut self, path: &Path) -> Result<()> {
        self.require(
            "load a model",
            &[BackendState::Initialized, BackendState::ModelLoaded],
        )?;

        let model = path.to_string_lossy().into_owned();
        if model.is_empty() {
            return Err(EmberError::InvalidArgument("empty model identifier".to_string()));
        }

        tracing::info!("Remote backend will use model {model}");
        self.model = Some(model);
        self.set_state(BackendState::ModelLoaded);
        Ok(())
    }

    fn unload_model(&mut self) -> Result<()> {
        self.require("unload a model", &[BackendState::ModelLoaded])?;
        self.model = None;
        self.set_state(BackendState::Initialized);
        Ok(())
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        let Ok(_busy) = self.busy.try_lock() else {
            return Err(BackendError::Busy.into());
        };
        self.require("generate", &[BackendState::ModelLoaded])?;
        let (Some(config), Some(client), Some(model)) =
            (self.config.as_ref(), self.client.as_ref(), self.model.as_deref())
        else {
            return Err(BackendError::InvalidState {
                operation: "generate",
                state: self.state(),
            }
            .into());
        };

        self.set_state(BackendState::Generating);
        let _guard = GeneratingGuard(self);
        let started = Instant::now();
        let limit = request.token_limit(config.max_tokens);
        let language_code = request
            .language
            .clone()
            .unwrap_or_else(|| config.language_code.clone());

        let body = CompletionRequest {
            model,
            prompt: &request.prompt,
            max_tokens: limit,
            temperature: config.temperature.max(0.0),
            top_p: config.top_p,
            seed: (config.seed != 0).then_some(config.seed),
        };
        let policy = RetryPolicy {
            max_retries: self.remote.max_retries,
            timeout: Duration::from_secs(self.remote.timeout_secs),
            backoff: RETRY_BACKOFF,
        };

        let mut attempts = 0;
        let completion = loop {
            if request.is_cancelled() {
                return Ok(GenerationResponse {
                    text: String::new(),
                    token_count: 0,
                    processing_time_ms: elapsed_ms(started),
                    confidence: 0.0,
                    truncated: true,
                    finish_reason: FinishReason::Cancelled,
                    model_name: model.to_string(),
                    language_code,
                });
            }

            attempts += 1;
            match self.attempt(client, &body).await {
                Ok(completion) => break completion,
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::Transient(last)) if attempts >= policy.attempts() => {
                    tracing::error!("Remote request failed after {attempts} attempts: {last}");
                    return Err(BackendError::RetriesExhausted { attempts, last }.into());
                }
                Err(AttemptError::Transient(message)) => {
                    let delay = policy.delay(attempts);
                    tracing::warn!(
                        "Remote attempt {attempts}/{} failed ({message}); retrying in {delay:?}",
                        policy.attempts()
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };

        let Some(choice) = completion.choices.into_iter().next() else {
            return Err(BackendError::Remote("response has no choices".to_string()).into());
        };
        let finish_reason = match choice.finish_reason.as_deref() {
            Some("length") => FinishReason::Length,
            _ => FinishReason::Stop,
        };
        let token_count = completion
            .usage
            .map_or(0, |u| u.completion_tokens)
            .min(limit);

        Ok(GenerationResponse {
            text: choice.text,
            token_count,
            processing_time_ms: elapsed_ms(started),
            confidence: REMOTE_CONFIDENCE,
            truncated: finish_reason != FinishReason::Stop,
            finish_reason,
            model_name: model.to_string(),
            language_code,
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
        let context = self
            .config
            .as_ref()
            .map_or(crate::inference::types::DEFAULT_CONTEXT_LENGTH, |c| c.context_length);

        Ok(Capabilities {
            model_format: "remote",
            max_context_length: context,
            recommended_context_length: context,
            supports_accelerator: false,
            supports_streaming: false,
            supports_quantization: false,
            max_batch_size: 1,
        })
    }

    fn model_name(&self) -> Option<String> {
        self.model.clone()
    }

    fn cleanup(&mut self) {
        self.client = None;
        self.api_key = None;
        self.config = None;
        self.model = None;
        self.set_state(BackendState::Uninitialized);
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
