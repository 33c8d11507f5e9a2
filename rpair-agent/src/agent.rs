//! Turn loop - drives the coder <-> executor (<-> human) conversation

use crate::prompt::{system_prompt, ANALYST_TASK, FEEDBACK_TASK};
use crate::roles::{Coder, Executor, Human, HumanInput, NoInput};
use rpair_core::{CodeRunner, Error, LlmProvider, Message, Result, Role, Transcript};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

/// Whether a human is asked for feedback after every execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopMode {
    /// Coder and executor alternate until the token or the turn budget
    Autonomous,
    /// A human reviews each result and may steer or stop
    HumanInTheLoop,
}

/// Configuration for one run of the turn loop
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Task given to the coder as the first message
    pub task: String,
    pub mode: LoopMode,
    /// Maximum number of coder turns; `None` means unbounded
    pub max_turns: Option<usize>,
    /// Text that ends the run when it appears in a coder message
    pub completion_token: String,
    /// Extra attempts for retryable LLM failures
    pub llm_retries: u32,
    pub retry_backoff: Duration,
    /// Model override; the provider default otherwise
    pub model: Option<String>,
    pub temperature: Option<f32>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::analyst()
    }
}

impl AgentConfig {
    /// The autonomous analyst: ten coder turns, stops on "DONE"
    pub fn analyst() -> Self {
        Self {
            task: ANALYST_TASK.to_string(),
            mode: LoopMode::Autonomous,
            max_turns: Some(10),
            completion_token: "DONE".to_string(),
            llm_retries: 2,
            retry_backoff: Duration::from_millis(500),
            model: None,
            temperature: None,
        }
    }

    /// The human-in-the-loop variant: unbounded, the human decides when to stop
    pub fn feedback() -> Self {
        Self {
            task: FEEDBACK_TASK.to_string(),
            mode: LoopMode::HumanInTheLoop,
            max_turns: None,
            ..Self::analyst()
        }
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = task.into();
        self
    }

    pub fn with_max_turns(mut self, max_turns: Option<usize>) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_completion_token(mut self, token: impl Into<String>) -> Self {
        self.completion_token = token.into();
        self
    }

    pub fn with_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.llm_retries = retries;
        self.retry_backoff = backoff;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.task.trim().is_empty() {
            return Err(Error::config_invalid("task must not be empty"));
        }
        if self.completion_token.trim().is_empty() {
            return Err(Error::config_invalid("completion token must not be empty"));
        }
        if self.max_turns == Some(0) {
            return Err(Error::config_invalid("max turns must be at least 1")
                .with_context("max_turns", "0"));
        }
        Ok(())
    }

    /// Build the coder for this configuration
    pub fn coder<P: LlmProvider>(&self, provider: P) -> Coder<P> {
        let mut coder = Coder::new(provider, system_prompt(self.mode, &self.completion_token))
            .with_retries(self.llm_retries, self.retry_backoff);
        if let Some(model) = &self.model {
            coder = coder.with_model(model.clone());
        }
        if let Some(temperature) = self.temperature {
            coder = coder.with_temperature(temperature);
        }
        coder
    }
}

/// Why a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The coder said the completion token
    CompletionToken,
    /// The coder used up its turns
    TurnLimit,
    /// The human sent an empty reply or closed the input
    HumanExit,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::CompletionToken => "completion_token",
            StopReason::TurnLimit => "turn_limit",
            StopReason::HumanExit => "human_exit",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whose move it is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    AwaitingCoder,
    AwaitingExecutor,
    AwaitingHuman,
    Done(StopReason),
}

/// Turn accounting for one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TurnState {
    /// Coder turns taken so far
    pub turn_count: usize,
    pub max_turns: Option<usize>,
    pub completed: bool,
}

impl TurnState {
    pub fn new(max_turns: Option<usize>) -> Self {
        Self {
            turn_count: 0,
            max_turns,
            completed: false,
        }
    }

    /// True once the coder has used every turn it was given
    pub fn exhausted(&self) -> bool {
        self.max_turns.is_some_and(|max| self.turn_count >= max)
    }

    pub fn is_terminal(&self) -> bool {
        self.completed || self.exhausted()
    }
}

/// What a finished run leaves behind
#[derive(Debug, Clone, Serialize)]
pub struct LoopOutcome {
    pub transcript: Transcript,
    pub turns: TurnState,
    pub stop_reason: StopReason,
    /// Code blocks executed during the run
    pub executions: usize,
}

type Observer = Box<dyn FnMut(&Message)>;

/// The coder / executor / human state machine.
///
/// Each step asks one role for its next message via `act`,
/// appends it, then moves to the next state.
pub struct TurnLoop<P, R, H = NoInput> {
    config: AgentConfig,
    coder: Coder<P>,
    executor: Executor<R>,
    human: Human<H>,
    state: LoopState,
    turns: TurnState,
    observer: Option<Observer>,
}

impl<P: LlmProvider, R: CodeRunner> TurnLoop<P, R, NoInput> {
    /// Coder and executor only; nobody is asked for feedback.
    pub fn autonomous(config: AgentConfig, provider: P, runner: R) -> Result<Self> {
        let config = AgentConfig {
            mode: LoopMode::Autonomous,
            ..config
        };
        let coder = config.coder(provider);
        Self::new(config, coder, Executor::new(runner), Human::new(NoInput))
    }
}

impl<P: LlmProvider, R: CodeRunner, H: HumanInput> TurnLoop<P, R, H> {
    /// A human reviews every execution result.
    pub fn human_in_the_loop(config: AgentConfig, provider: P, runner: R, input: H) -> Result<Self> {
        let config = AgentConfig {
            mode: LoopMode::HumanInTheLoop,
            ..config
        };
        let coder = config.coder(provider);
        Self::new(config, coder, Executor::new(runner), Human::new(input))
    }

    pub fn new(config: AgentConfig, coder: Coder<P>, executor: Executor<R>, human: Human<H>) -> Result<Self> {
        config.validate()?;
        let turns = TurnState::new(config.max_turns);
        Ok(Self {
            config,
            coder,
            executor,
            human,
            state: LoopState::AwaitingCoder,
            turns,
            observer: None,
        })
    }

    /// Called with every message as it is appended
    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: FnMut(&Message) + 'static,
    {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Stream coder replies, handing each delta to `on_delta`
    pub fn with_streaming<F>(mut self, on_delta: F) -> Self
    where
        F: FnMut(&str) + 'static,
    {
        self.coder = self.coder.with_streaming(on_delta);
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn coder(&self) -> &Coder<P> {
        &self.coder
    }

    pub fn executor(&self) -> &Executor<R> {
        &self.executor
    }

    /// Give the runner back, e.g. to close a session
    pub fn into_runner(self) -> R {
        self.executor.into_runner()
    }

    /// Run until the completion token, the turn budget or the human ends it.
    ///
    /// Errors only when the coder cannot be reached; execution failures are
    /// reported to the coder and the loop continues.
    pub async fn run(&mut self) -> Result<LoopOutcome> {
        self.turns = TurnState::new(self.config.max_turns);
        self.state = LoopState::AwaitingCoder;
        let runs_before = self.executor.runs();

        let mut transcript = Transcript::new();
        self.append(&mut transcript, Message::human(self.config.task.clone()));
        info!(mode = ?self.config.mode, max_turns = ?self.config.max_turns, "starting turn loop");

        let stop_reason = loop {
            let role = match self.state {
                LoopState::Done(reason) => break reason,
                LoopState::AwaitingCoder if self.turns.exhausted() => {
                    self.state = LoopState::Done(StopReason::TurnLimit);
                    continue;
                }
                LoopState::AwaitingCoder => Role::Coder,
                LoopState::AwaitingExecutor => Role::Executor,
                LoopState::AwaitingHuman => Role::Human,
            };

            let next = self.act(role, &transcript).await?;
            self.state = self.advance(role, next.as_ref());
            if let Some(message) = next {
                self.append(&mut transcript, message);
            }
        };

        self.turns.completed = true;
        let executions = self.executor.runs() - runs_before;
        info!(
            reason = %stop_reason,
            turns = self.turns.turn_count,
            executions,
            tokens = self.coder.usage().total_tokens(),
            "turn loop finished"
        );

        Ok(LoopOutcome {
            transcript,
            turns: self.turns,
            stop_reason,
            executions,
        })
    }

    /// Ask `role` for its next message. `None` only comes from the human
    /// and means they are finished.
    async fn act(&mut self, role: Role, transcript: &Transcript) -> Result<Option<Message>> {
        match role {
            Role::Coder => self.coder.respond(transcript).await.map(Some),
            Role::Executor => Ok(Some(self.executor.respond(transcript).await)),
            Role::Human => self.human.respond(transcript).await,
        }
    }

    fn advance(&mut self, role: Role, message: Option<&Message>) -> LoopState {
        match (role, message) {
            (Role::Coder, Some(message)) => {
                self.turns.turn_count += 1;
                info!(turn = self.turns.turn_count, "coder replied");
                if message.text.contains(&self.config.completion_token) {
                    LoopState::Done(StopReason::CompletionToken)
                } else {
                    LoopState::AwaitingExecutor
                }
            }
            (Role::Executor, _) => match self.config.mode {
                LoopMode::Autonomous => LoopState::AwaitingCoder,
                LoopMode::HumanInTheLoop => LoopState::AwaitingHuman,
            },
            (Role::Human, Some(_)) => LoopState::AwaitingCoder,
            (Role::Human, None) | (Role::Coder, None) => LoopState::Done(StopReason::HumanExit),
        }
    }

    fn append(&mut self, transcript: &mut Transcript, message: Message) {
        debug!(role = %message.role, bytes = message.text.len(), "message appended");
        if let Some(observer) = self.observer.as_mut() {
            observer(&message);
        }
        transcript.push(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::NO_CODE_NOTICE;
    use crate::roles::ScriptedInput;
    use crate::testing::{FakeRunner, ScriptedProvider};
    use rpair_core::{ErrorKind, ExecutionResult, ProviderError};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn config() -> AgentConfig {
        AgentConfig::analyst()
            .with_task("compute the mean")
            .with_retries(0, Duration::ZERO)
    }

    fn roles(outcome: &LoopOutcome) -> Vec<Role> {
        outcome.transcript.messages().iter().map(|m| m.role).collect()
    }

    #[test]
    fn test_config_validation() {
        assert!(AgentConfig::analyst().validate().is_ok());
        assert!(AgentConfig::feedback().validate().is_ok());

        let err = config().with_max_turns(Some(0)).validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
        assert!(config().with_completion_token(" ").validate().is_err());
        assert!(config().with_task("").validate().is_err());
    }

    #[test]
    fn test_turn_state() {
        let mut turns = TurnState::new(Some(2));
        assert!(!turns.is_terminal());
        turns.turn_count = 2;
        assert!(turns.exhausted());
        assert!(!TurnState::new(None).exhausted());
    }

    #[tokio::test]
    async fn test_completion_on_first_message() {
        let provider = ScriptedProvider::new(["Nothing to run. DONE"]);
        let mut turn_loop = TurnLoop::autonomous(config(), provider, FakeRunner::succeeding("")).unwrap();

        let outcome = turn_loop.run().await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::CompletionToken);
        assert_eq!(roles(&outcome), [Role::Human, Role::Coder]);
        assert_eq!(outcome.executions, 0);
        assert_eq!(outcome.turns.turn_count, 1);
        assert!(outcome.turns.completed);
    }

    #[tokio::test]
    async fn test_code_then_done() {
        let provider = ScriptedProvider::new([
            "```r\nmean(c(1, 2, 3))\n```",
            "The mean is 2. DONE",
        ]);
        let mut turn_loop = TurnLoop::autonomous(config(), provider, FakeRunner::succeeding("[1] 2\n")).unwrap();

        let outcome = turn_loop.run().await.unwrap();
        assert_eq!(roles(&outcome), [Role::Human, Role::Coder, Role::Executor, Role::Coder]);
        assert_eq!(outcome.transcript.messages()[2].text, "SUCCESS:\n[1] 2\n");
        assert_eq!(outcome.executions, 1);
        assert_eq!(turn_loop.executor().runner().calls, vec!["mean(c(1, 2, 3))".to_string()]);
    }

    #[tokio::test]
    async fn test_turn_limit_of_one() {
        let provider = ScriptedProvider::new(["```r\nx <- 1\n```", "never asked"]);
        let config = config().with_max_turns(Some(1));
        let mut turn_loop = TurnLoop::autonomous(config, provider, FakeRunner::succeeding("")).unwrap();

        let outcome = turn_loop.run().await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::TurnLimit);
        assert_eq!(roles(&outcome), [Role::Human, Role::Coder, Role::Executor]);
        assert_eq!(outcome.turns.turn_count, 1);
    }

    #[tokio::test]
    async fn test_error_is_reported_and_loop_continues() {
        let provider = ScriptedProvider::new([
            "```r\nmean(aorta)\n```",
            "```r\naorta <- 1:3\nmean(aorta)\n```",
            "Fixed. DONE",
        ]);
        let runner = FakeRunner::new(vec![
            ExecutionResult::failure("Error: object 'aorta' not found\n"),
            ExecutionResult::success("[1] 2\n"),
        ]);
        let mut turn_loop = TurnLoop::autonomous(config(), provider, runner).unwrap();

        let outcome = turn_loop.run().await.unwrap();
        let texts: Vec<_> = outcome.transcript.messages().iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts[2], "ERROR:\nError: object 'aorta' not found\n");
        assert_eq!(texts[4], "SUCCESS:\n[1] 2\n");
        assert_eq!(outcome.executions, 2);
    }

    #[tokio::test]
    async fn test_no_code_notice() {
        let provider = ScriptedProvider::new(["I would compute the mean.", "DONE"]);
        let mut turn_loop = TurnLoop::autonomous(config(), provider, FakeRunner::succeeding("")).unwrap();

        let outcome = turn_loop.run().await.unwrap();
        assert_eq!(outcome.transcript.messages()[2].text, NO_CODE_NOTICE);
        assert_eq!(outcome.executions, 0);
    }

    #[tokio::test]
    async fn test_human_steers_then_exits() {
        let provider = ScriptedProvider::new(["```r\nmean(x)\n```", "```r\nmedian(x)\n```"]);
        let input = ScriptedInput::new(["use the median", ""]);
        let mut turn_loop =
            TurnLoop::human_in_the_loop(AgentConfig::feedback(), provider, FakeRunner::succeeding("[1] 2\n"), input)
                .unwrap();

        let outcome = turn_loop.run().await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::HumanExit);
        assert_eq!(
            roles(&outcome),
            [Role::Human, Role::Coder, Role::Executor, Role::Human, Role::Coder, Role::Executor]
        );
        assert_eq!(outcome.transcript.messages()[3].text, "use the median");
        assert_eq!(outcome.executions, 2);
    }

    #[tokio::test]
    async fn test_human_end_of_input_exits() {
        let provider = ScriptedProvider::new(["```r\n1\n```"]);
        let mut turn_loop = TurnLoop::human_in_the_loop(
            AgentConfig::feedback(),
            provider,
            FakeRunner::succeeding("[1] 1\n"),
            ScriptedInput::default(),
        )
        .unwrap();

        let outcome = turn_loop.run().await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::HumanExit);
        assert_eq!(outcome.transcript.len(), 3);
    }

    #[tokio::test]
    async fn test_feedback_mode_completion_token() {
        let provider = ScriptedProvider::new(["All done. TASK_COMPLETE"]);
        let config = AgentConfig::feedback().with_completion_token("TASK_COMPLETE");
        let mut turn_loop =
            TurnLoop::human_in_the_loop(config, provider, FakeRunner::succeeding(""), ScriptedInput::default())
                .unwrap();

        let outcome = turn_loop.run().await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::CompletionToken);
    }

    #[tokio::test]
    async fn test_observer_sees_every_message() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let provider = ScriptedProvider::new(["```r\n1\n```", "DONE"]);
        let mut turn_loop = TurnLoop::autonomous(config(), provider, FakeRunner::succeeding("[1] 1\n"))
            .unwrap()
            .with_observer(move |message| sink.borrow_mut().push(message.clone()));

        let outcome = turn_loop.run().await.unwrap();
        assert_eq!(*seen.borrow(), outcome.transcript.messages());
    }

    #[tokio::test]
    async fn test_provider_failure_ends_run() {
        let provider = ScriptedProvider::with_results(vec![Err(ProviderError::AuthenticationFailed)]);
        let mut turn_loop = TurnLoop::autonomous(config(), provider, FakeRunner::succeeding("")).unwrap();

        let err = turn_loop.run().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
        assert_eq!(turn_loop.executor().runs(), 0);
    }

    #[tokio::test]
    async fn test_retryable_failure_is_retried() {
        let provider = ScriptedProvider::with_results(vec![
            Err(ProviderError::Api { status: 503, message: "busy".into() }),
            Ok("DONE".to_string()),
        ]);
        let config = config().with_retries(1, Duration::ZERO);
        let mut turn_loop = TurnLoop::autonomous(config, provider, FakeRunner::succeeding("")).unwrap();

        let outcome = turn_loop.run().await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::CompletionToken);
    }

    #[tokio::test]
    async fn test_coder_sees_executor_reports() {
        let provider = ScriptedProvider::new(["```r\n1\n```", "DONE"]);
        let mut turn_loop = TurnLoop::autonomous(config(), provider, FakeRunner::succeeding("[1] 1\n")).unwrap();
        turn_loop.run().await.unwrap();

        let requests = turn_loop.coder().provider().requests();
        assert_eq!(requests.len(), 2);
        let last = requests[1].messages.last().unwrap();
        assert_eq!(last.content, "SUCCESS:\n[1] 1\n");
        assert!(requests[0].messages[0].content.contains("'DONE'"));
    }

    #[test]
    fn test_outcome_serializes() {
        let outcome = LoopOutcome {
            transcript: Transcript::seeded("task"),
            turns: TurnState::new(Some(10)),
            stop_reason: StopReason::TurnLimit,
            executions: 0,
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["stop_reason"], "turn_limit");
        assert_eq!(value["turns"]["max_turns"], 10);
    }
}
