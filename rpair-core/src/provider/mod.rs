//! # LLM Provider Interface
//!
//! A trait-based abstraction over chat-completion backends.
//!
//! ## Design
//! - `LlmProvider` defines the interface the coder role talks to
//! - `OpenAIProvider` covers OpenAI and OpenAI-compatible servers (vLLM, Ollama)
//! - Streaming via `StreamReceiver`
//! - Usage tracking across calls

pub mod openai;

pub use openai::OpenAIProvider;

use crate::error::{Error, ErrorKind, Result};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;

/// Environment variable holding the API key
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";
/// Optional override of the API base URL
pub const BASE_URL_ENV: &str = "OPENAI_BASE_URL";
/// Optional override of the model
pub const MODEL_ENV: &str = "RPAIR_MODEL";

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

// ============================================================================
// Core Types
// ============================================================================

/// A chat message sent to the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

/// Request parameters for a completion
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<usize>,
    pub stop: Option<Vec<String>>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temp: f32) -> Self {
        self.temperature = Some(temp);
        self
    }

    pub fn with_max_tokens(mut self, max: usize) -> Self {
        self.max_tokens = Some(max);
        self
    }
}

/// Response from a completion request
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub id: String,
    pub model: String,
    pub content: Option<String>,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Unknown,
}

impl FinishReason {
    pub fn from_api(reason: Option<&str>) -> Self {
        match reason {
            Some("stop") => FinishReason::Stop,
            Some("length") => FinishReason::Length,
            Some("content_filter") => FinishReason::ContentFilter,
            _ => FinishReason::Unknown,
        }
    }
}

/// Token usage information
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

/// A streaming chunk from the model
#[derive(Debug, Clone)]
pub enum StreamChunk {
    /// Text content delta
    Text(String),
    /// Stream finished
    Done {
        finish_reason: FinishReason,
        usage: Option<Usage>,
    },
    /// Error occurred
    Error(String),
}

// ============================================================================
// Provider Errors
// ============================================================================

/// Error type for provider operations
#[derive(Debug)]
pub enum ProviderError {
    /// Network/connection error
    Network(String),
    /// API returned an error
    Api { status: u16, message: String },
    /// Failed to parse response
    Parse(String),
    /// Rate limited
    RateLimited { retry_after: Option<u64> },
    /// The API key was rejected
    AuthenticationFailed,
    /// The model answered without content
    EmptyResponse,
    /// Other error
    Other(String),
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network(e) => write!(f, "Network error: {}", e),
            Self::Api { status, message } => write!(f, "API error ({}): {}", status, message),
            Self::Parse(e) => write!(f, "Parse error: {}", e),
            Self::RateLimited { retry_after } => {
                write!(f, "Rate limited")?;
                if let Some(secs) = retry_after {
                    write!(f, " (retry after {}s)", secs)?;
                }
                Ok(())
            }
            Self::AuthenticationFailed => write!(f, "Authentication failed"),
            Self::EmptyResponse => write!(f, "No content in response"),
            Self::Other(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ProviderError {}

impl From<ProviderError> for Error {
    fn from(err: ProviderError) -> Self {
        let kind = match &err {
            ProviderError::Network(_) => ErrorKind::NetworkFailed,
            ProviderError::RateLimited { .. } => ErrorKind::RateLimited,
            ProviderError::AuthenticationFailed => ErrorKind::AuthenticationFailed,
            ProviderError::Parse(_) => ErrorKind::ParseFailed,
            ProviderError::Api { status, .. } if *status >= 500 => ErrorKind::ProviderUnavailable,
            ProviderError::Api { .. } => ErrorKind::InvalidArgument,
            ProviderError::EmptyResponse | ProviderError::Other(_) => ErrorKind::InferenceFailed,
        };
        let mut converted = Error::new(kind, err.to_string()).with_operation("provider");
        if let ProviderError::Api { status, .. } = &err {
            converted = converted.with_context("status", status.to_string());
        }
        converted.set_source(err)
    }
}

// ============================================================================
// Provider Trait
// ============================================================================

/// The main LLM provider trait
#[allow(async_fn_in_trait)]
pub trait LlmProvider: Send + Sync {
    /// Get the provider name (e.g., "openai")
    fn name(&self) -> &str;

    /// Get the default model
    fn default_model(&self) -> &str;

    /// Send a completion request and get a full response
    async fn complete(&self, request: CompletionRequest) -> std::result::Result<CompletionResponse, ProviderError>;

    /// Send a completion request and stream the response
    async fn stream(&self, request: CompletionRequest) -> std::result::Result<StreamReceiver, ProviderError>;

    /// Chat with message history, returning the text of the reply
    async fn chat(&self, messages: Vec<ChatMessage>) -> std::result::Result<String, ProviderError> {
        let request = CompletionRequest::new(messages);
        let response = self.complete(request).await?;
        response.content.ok_or(ProviderError::EmptyResponse)
    }
}

/// Receiver for streaming responses
pub struct StreamReceiver {
    inner: Pin<Box<dyn futures_core::Stream<Item = StreamChunk> + Send>>,
}

impl StreamReceiver {
    pub fn new<S>(stream: S) -> Self
    where
        S: futures_core::Stream<Item = StreamChunk> + Send + 'static,
    {
        Self {
            inner: Box::pin(stream),
        }
    }

    /// Next chunk, or `None` when the stream is exhausted
    pub async fn next(&mut self) -> Option<StreamChunk> {
        self.inner.next().await
    }

    /// Collect the text, handing each delta to `on_text` as it arrives
    pub async fn collect_text_with<F>(mut self, mut on_text: F) -> std::result::Result<String, ProviderError>
    where
        F: FnMut(&str),
    {
        let mut text = String::new();
        while let Some(chunk) = self.next().await {
            match chunk {
                StreamChunk::Text(delta) => {
                    on_text(&delta);
                    text.push_str(&delta);
                }
                StreamChunk::Done { .. } => break,
                StreamChunk::Error(e) => return Err(ProviderError::Network(e)),
            }
        }
        Ok(text)
    }

    /// Collect all text chunks into a single string
    pub async fn collect_text(self) -> std::result::Result<String, ProviderError> {
        self.collect_text_with(|_| {}).await
    }
}

// ============================================================================
// Provider Configuration
// ============================================================================

/// Configuration for creating providers
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub default_model: Option<String>,
    pub headers: HashMap<String, String>,
    pub timeout_secs: Option<u64>,
}

impl ProviderConfig {
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            base_url: Some(DEFAULT_BASE_URL.into()),
            default_model: Some(DEFAULT_MODEL.into()),
            headers: HashMap::new(),
            timeout_secs: Some(120),
        }
    }

    /// Build from the process environment.
    ///
    /// `OPENAI_API_KEY` is required; `OPENAI_BASE_URL` and `RPAIR_MODEL`
    /// override the defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = lookup(API_KEY_ENV)
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| Error::credential_missing(API_KEY_ENV).with_operation("provider::from_env"))?;

        let mut config = Self::openai(api_key);
        if let Some(url) = lookup(BASE_URL_ENV).filter(|u| !u.trim().is_empty()) {
            config.base_url = Some(url.trim_end_matches('/').to_string());
        }
        if let Some(model) = lookup(MODEL_ENV).filter(|m| !m.trim().is_empty()) {
            config.default_model = Some(model);
        }
        Ok(config)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }
}

// ============================================================================
// Usage Tracking
// ============================================================================

/// Tracks token usage across multiple calls
#[derive(Debug, Clone, Default)]
pub struct UsageTracker {
    pub total_calls: usize,
    pub total_prompt_tokens: usize,
    pub total_completion_tokens: usize,
    pub by_model: HashMap<String, Usage>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, model: &str, usage: &Usage) {
        self.total_calls += 1;
        self.total_prompt_tokens += usage.prompt_tokens;
        self.total_completion_tokens += usage.completion_tokens;

        let entry = self.by_model.entry(model.to_string()).or_default();
        entry.prompt_tokens += usage.prompt_tokens;
        entry.completion_tokens += usage.completion_tokens;
        entry.total_tokens += usage.total_tokens;
    }

    pub fn total_tokens(&self) -> usize {
        self.total_prompt_tokens + self.total_completion_tokens
    }
}

// ============================================================================
// Tests
// ============================================================================
