//! # rpair core
//!
//! The pieces the turn loop is built from.
//!
//! ## Core Concepts
//! - **Transcript**: append-only log of coder, executor and human messages
//! - **Extraction**: the first ```` ```r ```` block of a message
//! - **Runners**: execute R source via `Rscript` or a persistent session
//! - **Provider**: trait-based LLM communication (OpenAI-compatible)

pub mod error;
pub mod extract;
pub mod message;
pub mod provider;
pub mod runner;

pub use error::{Error, ErrorKind, ErrorStatus, Result};
pub use extract::{count_r_blocks, extract_r_code, Extraction};
pub use message::{Message, Role, Transcript};
pub use provider::{
    ChatMessage, ChatRole, CompletionRequest, CompletionResponse, FinishReason, LlmProvider,
    OpenAIProvider, ProviderConfig, ProviderError, StreamChunk, StreamReceiver, Usage,
    UsageTracker,
};
pub use runner::{
    AnyRunner, CodeRunner, ExecutionResult, RSession, RscriptConfig, RscriptRunner, RunnerKind,
};
pub use runner::session::SessionConfig;
