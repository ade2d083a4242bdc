//! Chat-completion client abstraction
//!
//! Provides:
//! - `Completer` trait with a structured (JSON) mode and a token stream mode
//! - `OpenAICompleter` over `/chat/completions`, including SSE decoding
//! - `MockCompleter` with scripted replies for tests and offline runs

use crate::config::{LlmConfig, RETRY_MAX_INTERVAL};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Incremental answer tokens. Dropping the stream aborts the request.
pub type TokenStream = BoxStream<'static, Result<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Per-call generation settings
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionOptions {
    pub temperature: f32,

    pub max_tokens: Option<u32>,

    /// Ask the provider for a single JSON object
    pub json_mode: bool,
}

impl CompletionOptions {
    pub fn structured() -> Self {
        Self {
            temperature: 0.0,
            max_tokens: None,
            json_mode: true,
        }
    }

    pub fn text(temperature: f32, max_tokens: u32) -> Self {
        Self {
            temperature,
            max_tokens: Some(max_tokens),
            json_mode: false,
        }
    }
}

#[async_trait]
pub trait Completer: Send + Sync {
    /// One-shot completion returning the full message content
    async fn complete(&self, messages: &[ChatMessage], options: &CompletionOptions) -> Result<String>;

    /// Streamed completion; the returned stream yields content deltas in order
    async fn stream(&self, messages: &[ChatMessage], options: &CompletionOptions) -> Result<TokenStream>;

    fn model_name(&self) -> &str;
}

/// Line-buffered decoder for `text/event-stream` bodies.
///
/// Network chunks may split a frame anywhere, including inside a UTF-8
/// sequence, so bytes are buffered until a full line is available.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning the `data:` payloads of every completed line
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut payloads = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(payload) = Self::data_payload(&line) {
                payloads.push(payload);
            }
        }
        payloads
    }

    /// Payload of a trailing line that never got its newline
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        Self::data_payload(&rest)
    }

    fn data_payload(line: &[u8]) -> Option<String> {
        let line = String::from_utf8_lossy(line);
        let line = line.trim_end_matches(['\r', '\n']);
        let data = line.strip_prefix("data:")?;
        Some(data.strip_prefix(' ').unwrap_or(data).to_string())
    }
}

/// OpenAI-compatible chat-completions client
pub struct OpenAICompleter {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    request_timeout: Duration,
    max_retries: u32,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    stream: bool,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Content delta of one streamed frame, `None` for frames without text
fn parse_stream_payload(payload: &str) -> Result<Option<String>> {
    let chunk: StreamChunk = serde_json::from_str(payload).map_err(|e| AppError::GenerationError {
        message: format!("Malformed stream frame: {}", e),
    })?;

    if let Some(error) = chunk.error {
        return Err(AppError::GenerationError {
            message: format!("Provider error: {}", error),
        });
    }

    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|c| !c.is_empty()))
}

impl OpenAICompleter {
    pub fn new(api_key: String, config: &LlmConfig) -> Result<Self> {
        // No overall timeout: streamed bodies are bounded by the token timeouts instead
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AppError::Configuration {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            base_url: config
                .api_base
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            request_timeout: config.extraction_timeout(),
            max_retries: config.max_retries,
        })
    }

    async fn send(&self, messages: &[ChatMessage], options: &CompletionOptions, stream: bool) -> Result<reqwest::Response> {
        let request = ChatRequest {
            model: &self.model,
            messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            response_format: options.json_mode.then_some(ResponseFormat { kind: "json_object" }),
            stream,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(AppError::ServiceUnavailable {
                    message: format!("LLM API error {}: {}", status, body),
                });
            }
            return Err(AppError::GenerationError {
                message: format!("LLM API error {}: {}", status, body),
            });
        }
        Ok(response)
    }

    async fn complete_once(&self, messages: &[ChatMessage], options: &CompletionOptions) -> Result<String> {
        let call = async {
            let response = self.send(messages, options, false).await?;
            let chat: ChatResponse = response.json().await.map_err(|e| AppError::GenerationError {
                message: format!("Failed to parse response: {}", e),
            })?;
            chat.choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .ok_or_else(|| AppError::GenerationError {
                    message: "Empty completion".to_string(),
                })
        };

        tokio::time::timeout(self.request_timeout, call)
            .await
            .map_err(|_| AppError::GenerationTimeout {
                timeout_ms: self.request_timeout.as_millis() as u64,
            })?
    }
}

#[async_trait]
impl Completer for OpenAICompleter {
    async fn complete(&self, messages: &[ChatMessage], options: &CompletionOptions) -> Result<String> {
        let start = Instant::now();
        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(250),
            max_interval: RETRY_MAX_INTERVAL,
            max_elapsed_time: Some(self.request_timeout * (self.max_retries + 1)),
            ..Default::default()
        };

        let mut attempt = 0u32;
        let result = backoff::future::retry(policy, || {
            attempt += 1;
            let attempt = attempt;
            async move {
                self.complete_once(messages, options).await.map_err(|e| {
                    if e.is_transient() && attempt <= self.max_retries {
                        tracing::warn!(attempt, error = %e, "Completion failed, retrying");
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        })
        .await;

        crate::metrics::record_generation(start.elapsed().as_secs_f64(), "structured", result.is_ok());
        result
    }

    async fn stream(&self, messages: &[ChatMessage], options: &CompletionOptions) -> Result<TokenStream> {
        let response = tokio::time::timeout(self.request_timeout, self.send(messages, options, true))
            .await
            .map_err(|_| AppError::GenerationTimeout {
                timeout_ms: self.request_timeout.as_millis() as u64,
            })??;

        struct State {
            body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
            decoder: SseDecoder,
            pending: VecDeque<String>,
            done: bool,
        }

        let state = State {
            body: response.bytes_stream().map(|r| r.map(|b| b.to_vec())).boxed(),
            decoder: SseDecoder::new(),
            pending: VecDeque::new(),
            done: false,
        };

        let tokens = stream::unfold(state, |mut st| async move {
            loop {
                if let Some(token) = st.pending.pop_front() {
                    return Some((Ok(token), st));
                }
                if st.done {
                    return None;
                }

                let payloads = match st.body.next().await {
                    Some(Ok(bytes)) => st.decoder.push(&bytes),
                    Some(Err(e)) => {
                        st.done = true;
                        return Some((
                            Err(AppError::GenerationError {
                                message: format!("Stream interrupted: {}", e),
                            }),
                            st,
                        ));
                    }
                    None => {
                        st.done = true;
                        st.decoder.finish().into_iter().collect()
                    }
                };

                for payload in payloads {
                    if payload.trim() == "[DONE]" {
                        st.done = true;
                        break;
                    }
                    match parse_stream_payload(&payload) {
                        Ok(Some(token)) => st.pending.push_back(token),
                        Ok(None) => {}
                        Err(e) => {
                            st.done = true;
                            return Some((Err(e), st));
                        }
                    }
                }
            }
        });

        Ok(tokens.boxed())
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Scripted completer.
///
/// Structured replies and token scripts are consumed FIFO; once a queue is
/// empty the defaults are returned. Every call is recorded.
pub struct MockCompleter {
    replies: Mutex<VecDeque<Result<String>>>,
    scripts: Mutex<VecDeque<Result<Vec<String>>>>,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
    token_delay: Duration,
    reply_delay: Duration,
}

impl Default for MockCompleter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCompleter {
    pub const DEFAULT_ANSWER: &'static str = "Thanks for your question. Our team can help with that.";

    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            scripts: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            token_delay: Duration::ZERO,
            reply_delay: Duration::ZERO,
        }
    }

    /// Pause before each streamed token
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    /// Pause before each structured reply
    pub fn with_reply_delay(mut self, delay: Duration) -> Self {
        self.reply_delay = delay;
        self
    }

    pub fn push_reply(&self, reply: impl Into<String>) -> &Self {
        lock(&self.replies).push_back(Ok(reply.into()));
        self
    }

    pub fn push_reply_error(&self, error: AppError) -> &Self {
        lock(&self.replies).push_back(Err(error));
        self
    }

    pub fn push_tokens<I, S>(&self, tokens: I) -> &Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        lock(&self.scripts).push_back(Ok(tokens.into_iter().map(Into::into).collect()));
        self
    }

    pub fn push_stream_error(&self, error: AppError) -> &Self {
        lock(&self.scripts).push_back(Err(error));
        self
    }

    pub fn calls(&self) -> Vec<Vec<ChatMessage>> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    fn default_tokens() -> Vec<String> {
        Self::DEFAULT_ANSWER
            .split_inclusive(' ')
            .map(str::to_string)
            .collect()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Completer for MockCompleter {
    async fn complete(&self, messages: &[ChatMessage], _options: &CompletionOptions) -> Result<String> {
        lock(&self.calls).push(messages.to_vec());
        let reply = lock(&self.replies).pop_front().unwrap_or_else(|| Ok("{}".to_string()));
        if !self.reply_delay.is_zero() {
            tokio::time::sleep(self.reply_delay).await;
        }
        reply
    }

    async fn stream(&self, messages: &[ChatMessage], _options: &CompletionOptions) -> Result<TokenStream> {
        lock(&self.calls).push(messages.to_vec());
        let tokens = lock(&self.scripts)
            .pop_front()
            .unwrap_or_else(|| Ok(Self::default_tokens()))?;

        let delay = self.token_delay;
        Ok(stream::iter(tokens)
            .then(move |token| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok::<_, AppError>(token)
            })
            .boxed())
    }

    fn model_name(&self) -> &str {
        "mock-completer"
    }
}

/// Create a completer based on configuration
pub fn create_completer(config: &LlmConfig) -> Result<Arc<dyn Completer>> {
    match config.provider.as_str() {
        "openai" => {
            let key = config
                .api_key
                .clone()
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| AppError::Configuration {
                    message: "llm.api_key is required for the openai provider".to_string(),
                })?;
            Ok(Arc::new(OpenAICompleter::new(key, config)?))
        }
        "mock" => Ok(Arc::new(MockCompleter::new())),
        other => {
            tracing::warn!(provider = other, "Unknown LLM provider, using mock");
            Ok(Arc::new(MockCompleter::new()))
        }
    }
}
