//! OpenAI-compatible provider implementation
//!
//! Works with OpenAI, Azure OpenAI, vLLM, Ollama, and other OpenAI-compatible APIs.

use super::*;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// OpenAI-compatible provider
pub struct OpenAIProvider {
    client: Client,
    config: ProviderConfig,
}

impl OpenAIProvider {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs.unwrap_or(120)))
            .build()
            .map_err(|e| {
                Error::config_invalid("failed to create HTTP client")
                    .with_operation("openai::new")
                    .set_source(e)
            })?;

        Ok(Self { client, config })
    }

    fn base_url(&self) -> &str {
        self.config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }

    fn api_request(&self, request: CompletionRequest, stream: bool) -> OpenAIRequest {
        let model = request.model.unwrap_or_else(|| self.default_model().to_string());
        OpenAIRequest {
            model,
            messages: request.messages.into_iter().map(OpenAIMessage::from).collect(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: Some(stream),
            stop: request.stop,
        }
    }

    async fn send(&self, body: &OpenAIRequest) -> std::result::Result<reqwest::Response, ProviderError> {
        let mut req = self.client
            .post(format!("{}/chat/completions", self.base_url()))
            .json(body);

        if let Some(api_key) = &self.config.api_key {
            if !api_key.is_empty() {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }
        }

        for (key, value) in &self.config.headers {
            req = req.header(key, value);
        }

        debug!(model = %body.model, messages = body.messages.len(), stream = ?body.stream, "sending completion request");
        let response = req.send().await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            let text = response.text().await.unwrap_or_default();

            return Err(match status {
                429 => ProviderError::RateLimited { retry_after },
                401 => ProviderError::AuthenticationFailed,
                _ => ProviderError::Api { status, message: text },
            });
        }

        Ok(response)
    }
}

impl LlmProvider for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn default_model(&self) -> &str {
        self.config.default_model.as_deref().unwrap_or(DEFAULT_MODEL)
    }

    async fn complete(&self, request: CompletionRequest) -> std::result::Result<CompletionResponse, ProviderError> {
        let body = self.api_request(request, false);
        let response = self.send(&body).await?;

        let api_response: OpenAIResponse = response.json().await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        let choice = api_response.choices.into_iter().next()
            .ok_or_else(|| ProviderError::Other("No choices in response".into()))?;

        let usage = api_response.usage.map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }).unwrap_or_default();

        Ok(CompletionResponse {
            id: api_response.id,
            model: api_response.model,
            content: choice.message.content,
            finish_reason: FinishReason::from_api(choice.finish_reason.as_deref()),
            usage,
        })
    }

    async fn stream(&self, request: CompletionRequest) -> std::result::Result<StreamReceiver, ProviderError> {
        let body = self.api_request(request, true);
        let response = self.send(&body).await?;

        Ok(StreamReceiver::new(sse_stream(response.bytes_stream())))
    }
}

/// Turn a body of SSE bytes into stream chunks.
fn sse_stream<S, B, E>(byte_stream: S) -> impl futures_core::Stream<Item = StreamChunk> + Send + 'static
where
    S: futures_core::Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    async_stream::stream! {
        let mut byte_stream = Box::pin(byte_stream);
        let mut decoder = SseDecoder::default();

        while let Some(chunk_result) = byte_stream.next().await {
            match chunk_result {
                Ok(bytes) => {
                    for chunk in decoder.push(bytes.as_ref()) {
                        let done = matches!(chunk, StreamChunk::Done { .. });
                        yield chunk;
                        if done {
                            return;
                        }
                    }
                }
                Err(e) => {
                    yield StreamChunk::Error(e.to_string());
                    return;
                }
            }
        }

        // the body may end without a trailing blank line
        for chunk in decoder.finish() {
            yield chunk;
        }
    }
}

/// Splits raw SSE bytes into events.
///
/// Events are cut on the raw bytes and decoded only once complete, so a
/// UTF-8 sequence split across network reads survives. CR bytes are dropped,
/// which folds CRLF line endings into LF; JSON payloads never carry a raw CR.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<StreamChunk> {
        self.buffer.extend(bytes.iter().copied().filter(|b| *b != b'\r'));

        let mut chunks = Vec::new();
        while let Some(pos) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let event: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            chunks.extend(decode_event(&event[..pos]));
        }
        chunks
    }

    fn finish(&mut self) -> Vec<StreamChunk> {
        let event = std::mem::take(&mut self.buffer);
        if event.iter().all(u8::is_ascii_whitespace) {
            return Vec::new();
        }
        decode_event(&event)
    }
}

fn decode_event(event: &[u8]) -> Vec<StreamChunk> {
    match std::str::from_utf8(event) {
        Ok(text) => parse_sse_event(text),
        Err(e) => vec![StreamChunk::Error(format!("invalid UTF-8 in stream event: {}", e))],
    }
}

/// Decode one SSE event (possibly several `data:` lines) into chunks.
fn parse_sse_event(event: &str) -> Vec<StreamChunk> {
    let mut chunks = Vec::new();
    for line in event.lines() {
        let Some(data) = line.strip_prefix("data:").map(str::trim_start) else {
            continue;
        };
        if data == "[DONE]" {
            chunks.push(StreamChunk::Done {
                finish_reason: FinishReason::Stop,
                usage: None,
            });
            break;
        }

        let Ok(chunk) = serde_json::from_str::<OpenAIStreamChunk>(data) else {
            continue;
        };
        if let Some(choice) = chunk.choices.first() {
            if let Some(content) = &choice.delta.content {
                if !content.is_empty() {
                    chunks.push(StreamChunk::Text(content.clone()));
                }
            }
            if let Some(reason) = &choice.finish_reason {
                chunks.push(StreamChunk::Done {
                    finish_reason: FinishReason::from_api(Some(reason.as_str())),
                    usage: None,
                });
                break;
            }
        }
    }
    chunks
}

// ============================================================================
// OpenAI API Types
// ============================================================================

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAIMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
}

impl From<ChatMessage> for OpenAIMessage {
    fn from(msg: ChatMessage) -> Self {
        Self {
            role: msg.role.as_str().to_string(),
            content: Some(msg.content),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    id: String,
    model: String,
    choices: Vec<OpenAIChoice>,
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: usize,
    completion_tokens: usize,
    total_tokens: usize,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChunk {
    choices: Vec<OpenAIStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChoice {
    delta: OpenAIStreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamDelta {
    content: Option<String>,
}
