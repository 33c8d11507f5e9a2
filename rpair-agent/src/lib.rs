//! # rpair Agent
//!
//! The agent pairs an LLM with an R interpreter:
//! 1. The human (or a fixed script) states a task
//! 2. The coder answers with a fenced ```` ```r ```` block
//! 3. The executor runs the first block and reports `SUCCESS` or `ERROR`
//! 4. Optionally a human reviews the result and steers
//! 5. Repeat until the coder says the completion token, the turn budget
//!    runs out, or the human stops
//!
//! The LLM is the brain, the interpreter is the hands.

mod agent;
pub mod prompt;
pub mod roles;

pub use agent::{AgentConfig, LoopMode, LoopOutcome, LoopState, StopReason, TurnLoop, TurnState};
pub use roles::{Coder, Executor, Human, HumanInput, NoInput, ScriptedInput, StdinInput};
