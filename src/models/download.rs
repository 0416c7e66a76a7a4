use crate::cancel::CancelFlag;
use crate::error::{DownloadError, EmberError, Result};
use crate::models::catalog::ModelDescriptor;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;

/// Minimum wall-clock gap between two progress callbacks
const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Minimum percent advance that triggers a callback before the interval elapses
const PROGRESS_STEP_PERCENT: f32 = 5.0;

/// Upper bound for the exponential retry backoff
const MAX_BACKOFF: Duration = Duration::from_secs(8);

/// Streamed response body
pub type ByteStream = BoxStream<'static, std::result::Result<Bytes, DownloadError>>;

/// Response to a (possibly ranged) fetch
pub struct TransferResponse {
    /// Offset of the first body byte: the requested offset when the range was honoured, otherwise 0
    pub start_offset: u64,
    /// Length of the complete resource, when the server reports it
    pub total_bytes: Option<u64>,
    pub body: ByteStream,
}

impl std::fmt::Debug for TransferResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferResponse")
            .field("start_offset", &self.start_offset)
            .field("total_bytes", &self.total_bytes)
            .field("body", &"Stream { ... }")
            .finish()
    }
}

/// Source of model bytes
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open `url` starting at byte `offset`. Implementations that cannot serve
    /// ranges return the whole resource with `start_offset == 0`.
    async fn fetch(
        &self,
        url: &str,
        offset: u64,
        timeout: Duration,
    ) -> std::result::Result<TransferResponse, DownloadError>;
}

/// HTTP(S) transport issuing `Range` requests for resumption
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("emberlm/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| EmberError::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client })
    }

    fn classify(err: &reqwest::Error) -> DownloadError {
        DownloadError::Network {
            message: err.to_string(),
            transient: err.is_timeout() || err.is_connect() || err.is_request() || err.is_body(),
        }
    }
}

/// Total length from a `Content-Range: bytes 100-999/1000` header
fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit('/').next().and_then(|total| total.trim().parse().ok())
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(
        &self,
        url: &str,
        offset: u64,
        timeout: Duration,
    ) -> std::result::Result<TransferResponse, DownloadError> {
        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={offset}-"));
        }

        let response = tokio::time::timeout(timeout, request.send())
            .await
            .map_err(|_| DownloadError::Timeout(timeout))?
            .map_err(|e| Self::classify(&e))?;

        let status = response.status();
        let (start_offset, total_bytes) = match status {
            reqwest::StatusCode::PARTIAL_CONTENT => {
                let total = response
                    .headers()
                    .get(reqwest::header::CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_content_range_total)
                    .or_else(|| response.content_length().map(|len| len + offset));
                (offset, total)
            }
            reqwest::StatusCode::OK => (0, response.content_length()),
            _ => {
                return Err(DownloadError::HttpStatus {
                    status: status.as_u16(),
                    url: url.to_string(),
                })
            }
        };

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| Self::classify(&e)))
            .boxed();

        Ok(TransferResponse {
            start_offset,
            total_bytes,
            body,
        })
    }
}

/// Progress snapshot handed to callbacks and polled status queries
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadProgress {
    pub model_name: String,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub percent: f32,
}

impl DownloadProgress {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new(model_name: &str, downloaded_bytes: u64, total_bytes: u64) -> Self {
        let percent = if total_bytes == 0 {
            0.0
        } else {
            (downloaded_bytes as f64 / total_bytes as f64 * 100.0) as f32
        };

        Self {
            model_name: model_name.to_string(),
            downloaded_bytes,
            total_bytes,
            percent,
        }
    }
}

/// Progress callback, invoked at a bounded cadence and exactly once at 100% on success
pub type ProgressCallback = Arc<dyn Fn(&DownloadProgress) + Send + Sync>;

/// In-flight downloads keyed by model name
pub(crate) type ActiveDownloads = Mutex<HashMap<String, DownloadProgress>>;

/// Throttles callbacks and mirrors progress into the polled snapshot table
pub(crate) struct ProgressReporter<'a> {
    model_name: &'a str,
    callback: Option<&'a ProgressCallback>,
    active: &'a ActiveDownloads,
    last_emit: Option<Instant>,
    last_percent: f32,
}

impl<'a> ProgressReporter<'a> {
    pub(crate) const fn new(
        model_name: &'a str,
        callback: Option<&'a ProgressCallback>,
        active: &'a ActiveDownloads,
    ) -> Self {
        Self {
            model_name,
            callback,
            active,
            last_emit: None,
            last_percent: 0.0,
        }
    }

    pub(crate) fn update(&mut self, downloaded: u64, total: u64) {
        let progress = DownloadProgress::new(self.model_name, downloaded, total);
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(self.model_name.to_string(), progress.clone());

        // 100% is reserved for the verified, renamed file
        if total > 0 && downloaded >= total {
            return;
        }

        let due = self.last_emit.map_or(true, |at| at.elapsed() >= PROGRESS_INTERVAL)
            || progress.percent - self.last_percent >= PROGRESS_STEP_PERCENT;
        if due {
            self.emit(&progress);
        }
    }

    pub(crate) fn finish(&mut self, total: u64) {
        let mut progress = DownloadProgress::new(self.model_name, total, total);
        progress.percent = 100.0;
        self.emit(&progress);
    }

    fn emit(&mut self, progress: &DownloadProgress) {
        self.last_emit = Some(Instant::now());
        self.last_percent = progress.percent;
        if let Some(callback) = self.callback {
            callback(progress);
        }
    }
}

/// Retry settings applied to one download
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Longest wait for the response or the next chunk within an attempt
    pub timeout: Duration,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub(crate) fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    pub(crate) fn delay(&self, attempt: u32) -> Duration {
        self.backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(MAX_BACKOFF)
    }
}

/// One transfer of a descriptor into its partial file
pub(crate) struct DownloadSession<'a> {
    descriptor: &'a ModelDescriptor,
    partial_path: PathBuf,
    downloaded: u64,
    total: u64,
    attempts: u32,
}

impl<'a> DownloadSession<'a> {
    pub(crate) fn new(descriptor: &'a ModelDescriptor, partial_path: PathBuf) -> Self {
        Self {
            descriptor,
            partial_path,
            downloaded: 0,
            total: descriptor.size_bytes,
            attempts: 0,
        }
    }

    pub(crate) fn partial_path(&self) -> &Path {
        &self.partial_path
    }

    /// Total size reported by the server, or the descriptor's size
    pub(crate) const fn total(&self) -> u64 {
        self.total
    }

    /// Drive attempts until the partial file holds the complete resource
    pub(crate) async fn run(
        &mut self,
        transport: &dyn Transport,
        policy: RetryPolicy,
        cancel: Option<&CancelFlag>,
        reporter: &mut ProgressReporter<'_>,
    ) -> Result<()> {
        loop {
            if cancel.is_some_and(CancelFlag::is_cancelled) {
                return Err(DownloadError::Cancelled(self.descriptor.name.to_string()).into());
            }

            self.attempts += 1;
            let err = match self.attempt(transport, policy, cancel, reporter).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            let transient = matches!(&err, EmberError::Download(e) if e.is_transient());
            if !transient {
                return Err(err);
            }

            if self.attempts >= policy.attempts() {
                tracing::error!(
                    "Giving up on {} after {} attempts: {err}",
                    self.descriptor.name,
                    self.attempts
                );
                return Err(DownloadError::RetriesExhausted {
                    attempts: self.attempts,
                    last: err.to_string(),
                }
                .into());
            }

            let delay = policy.delay(self.attempts);
            tracing::warn!(
                "Attempt {}/{} for {} failed ({err}); retrying in {delay:?} from byte {}",
                self.attempts,
                policy.attempts(),
                self.descriptor.name,
                self.downloaded
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt(
        &mut self,
        transport: &dyn Transport,
        policy: RetryPolicy,
        cancel: Option<&CancelFlag>,
        reporter: &mut ProgressReporter<'_>,
    ) -> Result<()> {
        let mut offset = tokio::fs::metadata(&self.partial_path)
            .await
            .map_or(0, |m| m.len());
        if self.descriptor.size_bytes > 0 && offset > self.descriptor.size_bytes {
            tracing::warn!(
                "Partial file {} is larger than expected; restarting",
                self.partial_path.display()
            );
            offset = 0;
        }
        if self.descriptor.size_bytes > 0 && offset == self.descriptor.size_bytes {
            tracing::info!(
                "Partial file for {} is already complete; verifying",
                self.descriptor.name
            );
            self.downloaded = offset;
            self.total = offset;
            return Ok(());
        }

        let response = match transport
            .fetch(&self.descriptor.url, offset, policy.timeout)
            .await
        {
            Err(DownloadError::HttpStatus { status: 416, .. }) if offset > 0 => {
                tracing::warn!(
                    "Server rejected resume of {} at byte {offset}; restarting from zero",
                    self.descriptor.name
                );
                tokio::fs::File::create(&self.partial_path).await?;
                offset = 0;
                transport
                    .fetch(&self.descriptor.url, offset, policy.timeout)
                    .await?
            }
            other => other?,
        };

        let mut file = if offset > 0 && response.start_offset == offset {
            tracing::info!("Resuming {} at byte {offset}", self.descriptor.name);
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(&self.partial_path)
                .await?
        } else {
            if offset > 0 {
                tracing::info!(
                    "Server ignored range request for {}; restarting from zero",
                    self.descriptor.name
                );
            }
            tokio::fs::File::create(&self.partial_path).await?
        };

        self.downloaded = response.start_offset;
        self.total = response.total_bytes.unwrap_or(self.descriptor.size_bytes);
        let mut body = response.body;

        loop {
            if cancel.is_some_and(CancelFlag::is_cancelled) {
                file.flush().await?;
                tracing::info!(
                    "Download of {} cancelled at byte {}",
                    self.descriptor.name,
                    self.downloaded
                );
                return Err(DownloadError::Cancelled(self.descriptor.name.to_string()).into());
            }

            let next = tokio::time::timeout(policy.timeout, body.next())
                .await
                .map_err(|_| DownloadError::Timeout(policy.timeout));
            let chunk = match next {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(None) => break,
                Ok(Some(Err(e))) | Err(e) => {
                    file.flush().await?;
                    return Err(e.into());
                }
            };

            file.write_all(&chunk).await?;
            self.downloaded += chunk.len() as u64;
            reporter.update(self.downloaded, self.total);
        }

        file.flush().await?;
        file.sync_all().await?;

        if self.total > 0 && self.downloaded < self.total {
            return Err(DownloadError::Network {
                message: format!(
                    "stream ended at byte {} of {}",
                    self.downloaded, self.total
                ),
                transient: true,
            }
            .into());
        }

        Ok(())
    }
}

/// Lowercase hex SHA-256 of a file, read in fixed-size blocks
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    use sha2::{Digest, Sha256};
    use std::io::Read;

    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1 << 20];

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// [`sha256_file`] on the blocking pool
pub async fn sha256_file_async(path: PathBuf) -> std::io::Result<String> {
    tokio::task::spawn_blocking(move || sha256_file(&path))
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
}

/// Format bytes as human-readable string
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
