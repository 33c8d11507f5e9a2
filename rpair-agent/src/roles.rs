//! The three participants of the conversation
//!
//! Each role turns the transcript so far into its next message. The turn
//! loop picks which one speaks; see `TurnLoop::run`.

use crate::prompt::NO_CODE_NOTICE;
use rpair_core::{
    count_r_blocks, extract_r_code, ChatMessage, CodeRunner, CompletionRequest, Error,
    Extraction, LlmProvider, Message, Result, Role, Transcript, UsageTracker,
};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tracing::{debug, info, warn};

// ============================================================================
// Coder
// ============================================================================

/// The LLM writing R code.
pub struct Coder<P> {
    provider: P,
    system_prompt: String,
    model: Option<String>,
    temperature: Option<f32>,
    stream: bool,
    retries: u32,
    backoff: Duration,
    usage: UsageTracker,
    on_delta: Option<Box<dyn FnMut(&str)>>,
}

impl<P: LlmProvider> Coder<P> {
    pub fn new(provider: P, system_prompt: impl Into<String>) -> Self {
        Self {
            provider,
            system_prompt: system_prompt.into(),
            model: None,
            temperature: None,
            stream: false,
            retries: 2,
            backoff: Duration::from_millis(500),
            usage: UsageTracker::new(),
            on_delta: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Retry retryable provider errors `retries` times, waiting
    /// `backoff * attempt` between attempts.
    pub fn with_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.retries = retries;
        self.backoff = backoff;
        self
    }

    /// Stream the reply, handing each text delta to `on_delta`.
    pub fn with_streaming<F>(mut self, on_delta: F) -> Self
    where
        F: FnMut(&str) + 'static,
    {
        self.stream = true;
        self.on_delta = Some(Box::new(on_delta));
        self
    }

    pub fn usage(&self) -> &UsageTracker {
        &self.usage
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or_else(|| self.provider.default_model())
    }

    /// Map the transcript onto a chat: the coder's own messages are the
    /// assistant side, everything else is user input.
    pub fn request(&self, transcript: &Transcript) -> CompletionRequest {
        let mut messages = Vec::with_capacity(transcript.len() + 1);
        messages.push(ChatMessage::system(&self.system_prompt));
        for message in transcript {
            messages.push(match message.role {
                Role::Coder => ChatMessage::assistant(&message.text),
                Role::Executor | Role::Human => ChatMessage::user(&message.text),
            });
        }

        let mut request = CompletionRequest::new(messages);
        request.model = self.model.clone();
        request.temperature = self.temperature;
        request
    }

    pub async fn respond(&mut self, transcript: &Transcript) -> Result<Message> {
        let request = self.request(transcript);
        let mut attempt: u32 = 0;
        loop {
            match self.attempt(request.clone()).await {
                Ok(text) => return Ok(Message::coder(text)),
                Err(err) if err.is_retryable() && attempt < self.retries => {
                    attempt += 1;
                    warn!(error = %err, attempt, "coder request failed, retrying");
                    tokio::time::sleep(self.backoff * attempt).await;
                }
                Err(err) => {
                    return Err(err
                        .persist()
                        .with_operation("coder::respond")
                        .with_context("model", self.model().to_string())
                        .with_context("attempts", (attempt + 1).to_string()));
                }
            }
        }
    }

    async fn attempt(&mut self, request: CompletionRequest) -> Result<String> {
        if self.stream {
            let receiver = self.provider.stream(request).await?;
            let text = match self.on_delta.as_mut() {
                Some(on_delta) => receiver.collect_text_with(|delta| on_delta(delta)).await?,
                None => receiver.collect_text().await?,
            };
            debug!(bytes = text.len(), "coder reply streamed");
            return non_blank(Some(text));
        }

        let response = self.provider.complete(request).await?;
        self.usage.track(&response.model, &response.usage);
        debug!(
            model = %response.model,
            prompt_tokens = response.usage.prompt_tokens,
            completion_tokens = response.usage.completion_tokens,
            "coder reply received"
        );
        non_blank(response.content)
    }
}

/// A blank reply is a failed inference, whichever way it arrived.
fn non_blank(reply: Option<String>) -> Result<String> {
    reply
        .filter(|text| !text.trim().is_empty())
        .ok_or_else(|| Error::inference_failed("model returned an empty reply"))
}

// ============================================================================
// Executor
// ============================================================================

/// Runs the first R block of the coder's latest message.
pub struct Executor<R> {
    runner: R,
    runs: usize,
}

impl<R: CodeRunner> Executor<R> {
    pub fn new(runner: R) -> Self {
        Self { runner, runs: 0 }
    }

    /// Number of code blocks executed so far
    pub fn runs(&self) -> usize {
        self.runs
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn into_runner(self) -> R {
        self.runner
    }

    pub async fn respond(&mut self, transcript: &Transcript) -> Message {
        let Some(latest) = transcript.last_from(Role::Coder) else {
            return Message::executor(NO_CODE_NOTICE);
        };

        let code = match extract_r_code(&latest.text) {
            Extraction::Found { code } => code,
            Extraction::NotFound => {
                info!("no R code in coder message");
                return Message::executor(NO_CODE_NOTICE);
            }
        };

        let blocks = count_r_blocks(&latest.text);
        if blocks > 1 {
            debug!(ignored = blocks - 1, "running only the first R block");
        }

        let result = self.runner.run(&code).await;
        self.runs += 1;
        info!(backend = self.runner.name(), succeeded = result.succeeded, "code executed");
        Message::executor(result.report())
    }
}

// ============================================================================
// Human
// ============================================================================

/// Source of human feedback.
#[allow(async_fn_in_trait)]
pub trait HumanInput {
    /// Show `prompt` and read one reply. `None` means input has ended.
    async fn read_feedback(&mut self, prompt: &str) -> Result<Option<String>>;
}

/// Reads feedback lines from the terminal.
pub struct StdinInput {
    lines: Lines<BufReader<Stdin>>,
}

impl StdinInput {
    pub fn new() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }
}

impl Default for StdinInput {
    fn default() -> Self {
        Self::new()
    }
}

impl HumanInput for StdinInput {
    async fn read_feedback(&mut self, prompt: &str) -> Result<Option<String>> {
        let mut stdout = tokio::io::stdout();
        stdout.write_all(format!("\n{} ", prompt).as_bytes()).await?;
        stdout.flush().await?;
        Ok(self.lines.next_line().await?)
    }
}

/// Replays canned replies; ends when they run out.
#[derive(Debug, Clone, Default)]
pub struct ScriptedInput {
    replies: VecDeque<String>,
    prompts_seen: usize,
}

impl ScriptedInput {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: replies.into_iter().map(Into::into).collect(),
            prompts_seen: 0,
        }
    }

    pub fn prompts_seen(&self) -> usize {
        self.prompts_seen
    }
}

impl HumanInput for ScriptedInput {
    async fn read_feedback(&mut self, _prompt: &str) -> Result<Option<String>> {
        self.prompts_seen += 1;
        Ok(self.replies.pop_front())
    }
}

/// Input for the autonomous variant, where nobody is asked.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoInput;

impl HumanInput for NoInput {
    async fn read_feedback(&mut self, _prompt: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

pub const FEEDBACK_PROMPT: &str = "Enter feedback or corrections (empty to exit):";

/// The person steering the run.
pub struct Human<H> {
    input: H,
}

impl<H: HumanInput> Human<H> {
    pub fn new(input: H) -> Self {
        Self { input }
    }

    pub fn input(&self) -> &H {
        &self.input
    }

    /// Next feedback message, or `None` when the human is finished
    /// (blank line or end of input).
    pub async fn respond(&mut self, _transcript: &Transcript) -> Result<Option<Message>> {
        let reply = self.input.read_feedback(FEEDBACK_PROMPT).await?;
        Ok(reply
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .map(Message::human))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeRunner, ScriptedProvider};
    use rpair_core::{ErrorKind, ExecutionResult, ProviderError};

    fn transcript_with_coder(text: &str) -> Transcript {
        let mut transcript = Transcript::seeded("task");
        transcript.push(Message::coder(text));
        transcript
    }

    #[test]
    fn test_request_maps_roles() {
        let coder = Coder::new(ScriptedProvider::new(Vec::<String>::new()), "system");
        let mut transcript = Transcript::seeded("task");
        transcript.push(Message::coder("```r\n1\n```"));
        transcript.push(Message::executor("SUCCESS:\n[1] 1"));

        let request = coder.request(&transcript);
        let roles: Vec<_> = request.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, ["system", "user", "assistant", "user"]);
        assert_eq!(request.messages[0].content, "system");
    }

    #[tokio::test]
    async fn test_coder_returns_reply() {
        let mut coder = Coder::new(ScriptedProvider::new(["```r\nmean(1:3)\n```"]), "system");
        let message = coder.respond(&Transcript::seeded("task")).await.unwrap();
        assert_eq!(message.role, Role::Coder);
        assert_eq!(message.text, "```r\nmean(1:3)\n```");
        assert_eq!(coder.usage().total_calls, 1);
    }

    #[tokio::test]
    async fn test_coder_retries_temporary_errors() {
        let provider = ScriptedProvider::with_results(vec![
            Err(ProviderError::RateLimited { retry_after: None }),
            Ok("DONE".to_string()),
        ]);
        let mut coder = Coder::new(provider, "system").with_retries(1, Duration::ZERO);
        let message = coder.respond(&Transcript::seeded("task")).await.unwrap();
        assert_eq!(message.text, "DONE");
    }

    #[tokio::test]
    async fn test_coder_gives_up_after_retries() {
        let provider = ScriptedProvider::with_results(vec![
            Err(ProviderError::Network("reset".into())),
            Err(ProviderError::Network("reset".into())),
        ]);
        let mut coder = Coder::new(provider, "system").with_retries(1, Duration::ZERO);
        let err = coder.respond(&Transcript::seeded("task")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NetworkFailed);
        assert!(!err.is_retryable());
        assert_eq!(err.operation(), "coder::respond");
    }

    #[tokio::test]
    async fn test_coder_does_not_retry_auth_failure() {
        let provider = ScriptedProvider::with_results(vec![
            Err(ProviderError::AuthenticationFailed),
            Ok("unreachable".to_string()),
        ]);
        let mut coder = Coder::new(provider, "system").with_retries(3, Duration::ZERO);
        let err = coder.respond(&Transcript::seeded("task")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
    }

    #[tokio::test]
    async fn test_coder_rejects_blank_reply() {
        let mut coder =
            Coder::new(ScriptedProvider::new(["   "]), "system").with_retries(0, Duration::ZERO);
        let err = coder.respond(&Transcript::seeded("task")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InferenceFailed);
    }

    #[tokio::test]
    async fn test_coder_streaming() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let seen = Rc::new(RefCell::new(String::new()));
        let sink = Rc::clone(&seen);
        let mut coder = Coder::new(ScriptedProvider::new(["```r\nsd(x)\n```"]), "system")
            .with_streaming(move |delta| sink.borrow_mut().push_str(delta));

        let message = coder.respond(&Transcript::seeded("task")).await.unwrap();
        assert_eq!(message.text, "```r\nsd(x)\n```");
        assert_eq!(*seen.borrow(), "```r\nsd(x)\n```");
    }

    #[tokio::test]
    async fn test_streamed_blank_reply_is_rejected() {
        let mut coder = Coder::new(ScriptedProvider::new([""]), "system")
            .with_retries(0, Duration::ZERO)
            .with_streaming(|_| {});
        let err = coder.respond(&Transcript::seeded("task")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InferenceFailed);

        let mut coder = Coder::new(ScriptedProvider::new([" \n", "```r\n1\n```"]), "system")
            .with_retries(1, Duration::ZERO)
            .with_streaming(|_| {});
        let message = coder.respond(&Transcript::seeded("task")).await.unwrap();
        assert_eq!(message.text, "```r\n1\n```");
        assert_eq!(coder.provider().requests().len(), 2);
    }

    #[tokio::test]
    async fn test_executor_runs_first_block() {
        let mut executor = Executor::new(FakeRunner::succeeding("[1] 2\n"));
        let transcript = transcript_with_coder("```r\n1 + 1\n```\n```r\nstop()\n```");

        let message = executor.respond(&transcript).await;
        assert_eq!(message.role, Role::Executor);
        assert_eq!(message.text, "SUCCESS:\n[1] 2\n");
        assert_eq!(executor.runner().calls, vec!["1 + 1".to_string()]);
        assert_eq!(executor.runs(), 1);
    }

    #[tokio::test]
    async fn test_executor_reports_failure_verbatim() {
        let runner = FakeRunner::new(vec![ExecutionResult::failure("Error: object 'aorta' not found\n")]);
        let mut executor = Executor::new(runner);
        let message = executor.respond(&transcript_with_coder("```r\nmean(aorta)\n```")).await;
        assert_eq!(message.text, "ERROR:\nError: object 'aorta' not found\n");
    }

    #[tokio::test]
    async fn test_executor_without_code() {
        let mut executor = Executor::new(FakeRunner::succeeding(""));
        let message = executor.respond(&transcript_with_coder("Let me think first.")).await;
        assert_eq!(message.text, NO_CODE_NOTICE);
        assert_eq!(executor.runs(), 0);

        let message = executor.respond(&Transcript::seeded("task")).await;
        assert_eq!(message.text, NO_CODE_NOTICE);
    }

    #[tokio::test]
    async fn test_human_trims_and_exits_on_blank() {
        let mut human = Human::new(ScriptedInput::new(["  use the median instead  ", "   "]));
        let transcript = Transcript::new();

        let first = human.respond(&transcript).await.unwrap().unwrap();
        assert_eq!(first, Message::human("use the median instead"));

        assert!(human.respond(&transcript).await.unwrap().is_none());
        // input exhausted
        assert!(human.respond(&transcript).await.unwrap().is_none());
        assert_eq!(human.input().prompts_seen(), 3);
    }
}
