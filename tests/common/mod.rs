#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use emberlm::error::{DownloadError, Result};
#[cfg(feature = "local")]
use emberlm::inference::gguf::{self, ModelFile};
#[cfg(feature = "local")]
use emberlm::inference::runtime::{ModelRuntime, RuntimeLoader, RuntimeOptions};
use emberlm::inference::types::TokenId;
use emberlm::models::download::TransferResponse;
use emberlm::models::Transport;
use emberlm::CancelFlag;
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Notify;

// ---------------------------------------------------------------------------
// GGUF fixtures
// ---------------------------------------------------------------------------

pub const UNK: TokenId = 0;
pub const BOS: TokenId = 1;
pub const EOS: TokenId = 2;
pub const SPACE: TokenId = 3;

/// `<unk> <s> </s> ▁ a..z`: one token per lowercase letter
pub fn vocab() -> Vec<String> {
    let mut tokens = vec![
        "<unk>".to_string(),
        "<s>".to_string(),
        "</s>".to_string(),
        "\u{2581}".to_string(),
    ];
    tokens.extend(('a'..='z').map(|c| c.to_string()));
    tokens
}

pub fn vocab_size() -> usize {
    vocab().len()
}

/// Token id of a lowercase letter, or of a space
pub fn token(c: char) -> TokenId {
    if c == ' ' {
        return SPACE;
    }
    assert!(c.is_ascii_lowercase(), "no token for {c:?}");
    SPACE + 1 + (c as u32 - 'a' as u32)
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn put_key(buf: &mut Vec<u8>, key: &str, value_type: u32) {
    put_string(buf, key);
    buf.extend_from_slice(&value_type.to_le_bytes());
}

/// Header-only GGUF model with a letter vocabulary
pub fn gguf_bytes(name: &str, context_length: u32) -> Vec<u8> {
    let tokens = vocab();
    let mut buf = b"GGUF".to_vec();
    buf.extend_from_slice(&3u32.to_le_bytes());
    buf.extend_from_slice(&0u64.to_le_bytes());
    buf.extend_from_slice(&9u64.to_le_bytes());

    put_key(&mut buf, "general.architecture", 8);
    put_string(&mut buf, "llama");
    put_key(&mut buf, "general.name", 8);
    put_string(&mut buf, name);
    put_key(&mut buf, "llama.context_length", 4);
    buf.extend_from_slice(&context_length.to_le_bytes());
    put_key(&mut buf, "tokenizer.ggml.model", 8);
    put_string(&mut buf, "llama");

    put_key(&mut buf, "tokenizer.ggml.tokens", 9);
    buf.extend_from_slice(&8u32.to_le_bytes());
    buf.extend_from_slice(&(tokens.len() as u64).to_le_bytes());
    for piece in &tokens {
        put_string(&mut buf, piece);
    }

    put_key(&mut buf, "tokenizer.ggml.scores", 9);
    buf.extend_from_slice(&6u32.to_le_bytes());
    buf.extend_from_slice(&(tokens.len() as u64).to_le_bytes());
    for _ in &tokens {
        buf.extend_from_slice(&0.0f32.to_le_bytes());
    }

    put_key(&mut buf, "tokenizer.ggml.token_type", 9);
    buf.extend_from_slice(&5u32.to_le_bytes());
    buf.extend_from_slice(&(tokens.len() as u64).to_le_bytes());
    for id in 0..tokens.len() {
        let kind: i32 = match id {
            0 => 2,
            1 | 2 => 3,
            _ => 1,
        };
        buf.extend_from_slice(&kind.to_le_bytes());
    }

    put_key(&mut buf, "tokenizer.ggml.bos_token_id", 4);
    buf.extend_from_slice(&BOS.to_le_bytes());
    put_key(&mut buf, "tokenizer.ggml.eos_token_id", 4);
    buf.extend_from_slice(&EOS.to_le_bytes());

    buf
}

pub fn write_model(dir: &Path, filename: &str, context_length: u32) -> PathBuf {
    let path = dir.join(filename);
    std::fs::write(&path, gguf_bytes(filename.trim_end_matches(".gguf"), context_length)).unwrap();
    path
}

// ---------------------------------------------------------------------------
// Scripted runtime
// ---------------------------------------------------------------------------

/// What the scripted model emits after the prompt
#[derive(Debug, Clone)]
pub enum Script {
    /// These tokens in order, then end-of-sequence
    Tokens(Vec<TokenId>),
    /// The same token forever
    Repeat(TokenId),
    /// Only non-finite logits
    Broken,
}

impl Script {
    pub fn text(text: &str) -> Self {
        Self::Tokens(text.chars().map(token).collect())
    }
}

/// Every `forward` call: (token count, position)
pub type CallLog = Arc<Mutex<Vec<(usize, usize)>>>;

#[cfg(feature = "local")]
#[derive(Clone)]
pub struct ScriptedLoader {
    script: Script,
    calls: CallLog,
    loads: Arc<AtomicUsize>,
    cancel_after: Option<(usize, CancelFlag)>,
}

#[cfg(feature = "local")]
impl ScriptedLoader {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            calls: CallLog::default(),
            loads: Arc::new(AtomicUsize::new(0)),
            cancel_after: None,
        }
    }

    /// Raise `flag` once `calls` forward passes have run
    pub fn cancelling_after(mut self, calls: usize, flag: CancelFlag) -> Self {
        self.cancel_after = Some((calls, flag));
        self
    }

    pub fn calls(&self) -> Vec<(usize, usize)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[cfg(feature = "local")]
impl RuntimeLoader for ScriptedLoader {
    fn load(&self, model: ModelFile, _options: &RuntimeOptions) -> Result<Box<dyn ModelRuntime>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let vocab = gguf::get_array(model.metadata(), "tokenizer.ggml.tokens").map_or(0, <[_]>::len);
        Ok(Box::new(ScriptedRuntime {
            script: self.script.clone(),
            vocab,
            step: 0,
            calls: Arc::clone(&self.calls),
            cancel_after: self.cancel_after.clone(),
        }))
    }
}

#[cfg(feature = "local")]
struct ScriptedRuntime {
    script: Script,
    vocab: usize,
    step: usize,
    calls: CallLog,
    cancel_after: Option<(usize, CancelFlag)>,
}

#[cfg(feature = "local")]
impl ModelRuntime for ScriptedRuntime {
    fn forward(&mut self, tokens: &[TokenId], pos: usize) -> Result<Vec<f32>> {
        if pos == 0 {
            self.step = 0;
        }
        let calls = {
            let mut log = self.calls.lock().unwrap();
            log.push((tokens.len(), pos));
            log.len()
        };
        if let Some((after, flag)) = &self.cancel_after {
            if calls >= *after {
                flag.cancel();
            }
        }

        let next = match &self.script {
            Script::Tokens(tokens) => tokens.get(self.step).copied().unwrap_or(EOS),
            Script::Repeat(token) => *token,
            Script::Broken => return Ok(vec![f32::NAN; self.vocab]),
        };
        self.step += 1;

        let mut logits = vec![0.0; self.vocab];
        logits[next as usize] = 20.0;
        Ok(logits)
    }
}

// ---------------------------------------------------------------------------
// Mock transport
// ---------------------------------------------------------------------------

/// Scripted behaviour of one fetch
#[derive(Clone)]
pub enum Fetch {
    /// Serve the resource normally
    Serve,
    /// Fail before any byte with a transient network error
    Refuse,
    /// Fail with an HTTP status
    Status(u16),
    /// Serve this many bytes past the offset, then end the stream early
    Truncate(u64),
    /// Raise the flag once this many absolute bytes have been served
    CancelAt(u64, CancelFlag),
    /// Serve this many bytes past the offset, then wait for the gate
    StallAt(u64, Arc<Notify>),
}

pub struct MockTransport {
    data: Bytes,
    chunk_size: usize,
    honour_ranges: bool,
    plan: Mutex<VecDeque<Fetch>>,
    offsets: Mutex<Vec<u64>>,
    calls: AtomicUsize,
}

impl MockTransport {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Bytes::from(data),
            chunk_size: 64 * 1024,
            honour_ranges: true,
            plan: Mutex::new(VecDeque::new()),
            offsets: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn ignoring_ranges(mut self) -> Self {
        self.honour_ranges = false;
        self
    }

    /// Queue behaviours for the next fetches; later fetches serve normally
    pub fn then(self, fetch: Fetch) -> Self {
        self.plan.lock().unwrap().push_back(fetch);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn offsets(&self) -> Vec<u64> {
        self.offsets.lock().unwrap().clone()
    }

    fn chunks(&self, from: u64, to: u64) -> Vec<Bytes> {
        let (from, to) = (from as usize, to as usize);
        (from..to)
            .step_by(self.chunk_size)
            .map(|start| self.data.slice(start..(start + self.chunk_size).min(to)))
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn fetch(
        &self,
        url: &str,
        offset: u64,
        _timeout: Duration,
    ) -> std::result::Result<TransferResponse, DownloadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.offsets.lock().unwrap().push(offset);
        let fetch = self.plan.lock().unwrap().pop_front().unwrap_or(Fetch::Serve);

        let len = self.data.len() as u64;
        let start = if self.honour_ranges { offset.min(len) } else { 0 };
        let response = |body| TransferResponse {
            start_offset: start,
            total_bytes: Some(len),
            body,
        };

        match fetch {
            Fetch::Serve => {
                let chunks = self.chunks(start, len);
                Ok(response(futures_util::stream::iter(chunks.into_iter().map(Ok)).boxed()))
            }
            Fetch::Refuse => Err(DownloadError::Network {
                message: "connection refused".to_string(),
                transient: true,
            }),
            Fetch::Status(status) => Err(DownloadError::HttpStatus {
                status,
                url: url.to_string(),
            }),
            Fetch::Truncate(n) => {
                let chunks = self.chunks(start, (start + n).min(len));
                Ok(response(futures_util::stream::iter(chunks.into_iter().map(Ok)).boxed()))
            }
            Fetch::CancelAt(at, flag) => {
                let chunks = self.chunks(start, len);
                let mut served = start;
                let body = futures_util::stream::iter(chunks)
                    .map(move |chunk| {
                        served += chunk.len() as u64;
                        if served >= at {
                            flag.cancel();
                        }
                        Ok(chunk)
                    })
                    .boxed();
                Ok(response(body))
            }
            Fetch::StallAt(n, gate) => {
                let split = (start + n).min(len);
                let head = futures_util::stream::iter(self.chunks(start, split));
                let tail_chunks = self.chunks(split, len);
                let tail = futures_util::stream::once(async move {
                    gate.notified().await;
                    futures_util::stream::iter(tail_chunks)
                })
                .flatten();
                Ok(response(head.chain(tail).map(Ok).boxed()))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Minimal HTTP responder
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpReply {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self::new(status, value.to_string()).with_header("Content-Type", "application/json")
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

pub type RequestLog = Arc<Mutex<Vec<RecordedRequest>>>;

/// Serve HTTP/1.1 on an ephemeral port, answering request `n` with `handler(request, n)`.
///
/// Returns the base URL and the log of received requests.
pub async fn serve<F>(handler: F) -> (String, RequestLog)
where
    F: Fn(&RecordedRequest, usize) -> HttpReply + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log = RequestLog::default();
    let handler = Arc::new(handler);

    let server_log = Arc::clone(&log);
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let Some(request) = read_request(&mut socket).await else {
                continue;
            };

            let index = {
                let mut log = server_log.lock().unwrap();
                log.push(request.clone());
                log.len() - 1
            };
            let reply = handler(&request, index);

            let mut head = format!(
                "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n",
                reply.status,
                reason(reply.status),
                reply.body.len()
            );
            for (name, value) in &reply.headers {
                head.push_str(&format!("{name}: {value}\r\n"));
            }
            head.push_str("\r\n");

            let _ = socket.write_all(head.as_bytes()).await;
            let _ = socket.write_all(&reply.body).await;
            let _ = socket.shutdown().await;
        }
    });

    (format!("http://{addr}"), log)
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> Option<RecordedRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let read = socket.read(&mut chunk).await.ok()?;
        if read == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..read]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    let content_length = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < header_end + content_length {
        let read = socket.read(&mut chunk).await.ok()?;
        if read == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..read]);
    }

    Some(RecordedRequest {
        method,
        path,
        headers,
        body: buf[header_end..].to_vec(),
    })
}

const fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        206 => "Partial Content",
        401 => "Unauthorized",
        404 => "Not Found",
        416 => "Range Not Satisfiable",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Deterministic bytes that do not repeat on short periods
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31) ^ (i >> 8)) as u8).collect()
}

pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(data))
}
