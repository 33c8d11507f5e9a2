//! # Code Runner
//!
//! Runs a string of R source and captures what it printed.
//!
//! ## Backends
//! - [`RscriptRunner`]: writes the code to a temporary `.R` file and runs an
//!   external interpreter on it. Every call starts from a clean slate.
//! - [`RSession`]: one long-lived evaluation context. Bindings made by one
//!   call are visible to the next until [`RSession::reset`] is called.
//!
//! Neither backend returns an error from [`CodeRunner::run`]: failures to
//! start, crashes and R errors all come back as an [`ExecutionResult`] with
//! `succeeded == false` and a diagnostic in `stderr`. No timeout is applied;
//! a hung script blocks the caller.

pub mod rscript;
pub mod session;

pub use rscript::{RscriptConfig, RscriptRunner};
pub use session::RSession;

use serde::{Deserialize, Serialize};

/// Captured output of one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub succeeded: bool,
}

impl ExecutionResult {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            succeeded: true,
        }
    }

    pub fn failure(stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            succeeded: false,
        }
    }

    /// Text reported back to the coder.
    ///
    /// Successful runs report stdout; failed runs report stderr, falling back
    /// to stdout when the interpreter printed its error there.
    pub fn report(&self) -> String {
        if self.succeeded {
            format!("SUCCESS:\n{}", self.stdout)
        } else if self.stderr.trim().is_empty() {
            format!("ERROR:\n{}", self.stdout)
        } else {
            format!("ERROR:\n{}", self.stderr)
        }
    }
}

/// An R execution backend.
#[allow(async_fn_in_trait)]
pub trait CodeRunner {
    /// Short backend name for logs (e.g., "rscript", "session")
    fn name(&self) -> &str;

    /// Run `code` to completion. Never fails; see [`ExecutionResult`].
    async fn run(&mut self, code: &str) -> ExecutionResult;
}

/// Which backend a command should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunnerKind {
    /// Fresh interpreter process per call
    #[default]
    Rscript,
    /// Persistent evaluation context
    Session,
}

/// A runner chosen at startup.
pub enum AnyRunner {
    Rscript(RscriptRunner),
    Session(RSession),
}

impl CodeRunner for AnyRunner {
    fn name(&self) -> &str {
        match self {
            AnyRunner::Rscript(r) => r.name(),
            AnyRunner::Session(s) => s.name(),
        }
    }

    async fn run(&mut self, code: &str) -> ExecutionResult {
        match self {
            AnyRunner::Rscript(r) => r.run(code).await,
            AnyRunner::Session(s) => s.run(code).await,
        }
    }
}
