//! Subprocess backend: one interpreter process per call
//!
//! The code is written to a fresh temporary `.R` file and the interpreter is
//! invoked with that path as its only positional argument. The file is
//! removed when the call returns, on every path.

use super::{CodeRunner, ExecutionResult};
use crate::error::{Error, Result};
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

/// Configuration for [`RscriptRunner`].
#[derive(Debug, Clone)]
pub struct RscriptConfig {
    /// Interpreter binary
    pub program: String,
    /// Arguments placed before the script path
    pub args: Vec<String>,
    /// Treat any non-blank stderr as a failed run, even with exit status 0
    pub strict_stderr: bool,
    /// Working directory for the child (defaults to the current directory)
    pub workdir: Option<PathBuf>,
}

impl Default for RscriptConfig {
    fn default() -> Self {
        Self {
            program: "Rscript".to_string(),
            args: Vec::new(),
            strict_stderr: true,
            workdir: None,
        }
    }
}

impl RscriptConfig {
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_strict_stderr(mut self, strict: bool) -> Self {
        self.strict_stderr = strict;
        self
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }
}

/// Runs code through an external interpreter.
#[derive(Debug, Clone, Default)]
pub struct RscriptRunner {
    config: RscriptConfig,
}

impl RscriptRunner {
    pub fn new(config: RscriptConfig) -> Self {
        Self { config }
    }

    /// Check that the interpreter can be started.
    ///
    /// Returns the interpreter's `--version` banner. A missing binary is an
    /// `InterpreterNotFound` error.
    #[instrument(skip(self), fields(program = %self.config.program))]
    pub async fn probe(&self) -> Result<String> {
        let output = Command::new(&self.config.program)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                Error::interpreter_not_found(&self.config.program)
                    .with_operation("rscript::probe")
                    .set_source(e)
            })?;

        // Rscript prints its banner on stderr
        let banner = if output.stdout.is_empty() {
            String::from_utf8_lossy(&output.stderr)
        } else {
            String::from_utf8_lossy(&output.stdout)
        };
        let banner = banner.trim().to_string();
        debug!(%banner, "interpreter available");
        Ok(banner)
    }

    async fn execute(&self, code: &str) -> Result<ExecutionResult> {
        let script = write_script(code)?;

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .arg(script.path())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.workdir {
            cmd.current_dir(dir);
        }

        debug!(script = %script.path().display(), "spawning interpreter");
        let output = cmd.output().await.map_err(|e| {
            Error::spawn_failed(&self.config.program, e.to_string())
                .with_operation("rscript::run")
                .set_source(e)
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let stderr_blocks = self.config.strict_stderr && !stderr.trim().is_empty();
        let succeeded = output.status.success() && !stderr_blocks;

        debug!(exit_code = ?output.status.code(), succeeded, "interpreter finished");
        Ok(ExecutionResult {
            stdout,
            stderr,
            succeeded,
        })
    }
}

impl CodeRunner for RscriptRunner {
    fn name(&self) -> &str {
        "rscript"
    }

    #[instrument(skip_all, fields(program = %self.config.program, bytes = code.len()))]
    async fn run(&mut self, code: &str) -> ExecutionResult {
        match self.execute(code).await {
            Ok(result) => result,
            Err(err) => {
                warn!(error = %err, "interpreter run failed");
                ExecutionResult::failure(format!("Exception when running R code:\n{}", err.message()))
            }
        }
    }
}

/// Write `code` to a new temporary `.R` file; the file is deleted on drop.
pub(crate) fn write_script(code: &str) -> Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("rpair-")
        .suffix(".R")
        .tempfile()
        .map_err(|e| Error::from(e).with_operation("runner::write_script"))?;
    file.write_all(code.as_bytes())
        .and_then(|_| file.flush())
        .map_err(|e| Error::from(e).with_operation("runner::write_script"))?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use std::path::Path;

    fn sh_runner() -> RscriptRunner {
        RscriptRunner::new(RscriptConfig::default().with_program("sh"))
    }

    async fn rscript_available() -> bool {
        RscriptRunner::default().probe().await.is_ok()
    }

    #[tokio::test]
    async fn test_captures_stdout() {
        let mut runner = sh_runner();
        let result = runner.run("echo hello").await;
        assert!(result.succeeded);
        assert_eq!(result.stdout, "hello\n");
        assert!(result.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let mut runner = sh_runner();
        let result = runner.run("echo 'bad input' >&2\nexit 3").await;
        assert!(!result.succeeded);
        assert_eq!(result.stderr, "bad input\n");
    }

    #[tokio::test]
    async fn test_strict_stderr() {
        let code = "echo note >&2";

        let mut strict = sh_runner();
        assert!(!strict.run(code).await.succeeded);

        let mut lenient =
            RscriptRunner::new(RscriptConfig::default().with_program("sh").with_strict_stderr(false));
        let result = lenient.run(code).await;
        assert!(result.succeeded);
        assert_eq!(result.stderr, "note\n");
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_reported_not_raised() {
        let mut runner =
            RscriptRunner::new(RscriptConfig::default().with_program("rpair-no-such-interpreter"));
        let result = runner.run("print(1)").await;
        assert!(!result.succeeded);
        assert!(result.stderr.starts_with("Exception when running R code:"));
    }

    #[tokio::test]
    async fn test_probe_missing_interpreter() {
        let runner =
            RscriptRunner::new(RscriptConfig::default().with_program("rpair-no-such-interpreter"));
        let err = runner.probe().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InterpreterNotFound);
    }

    #[tokio::test]
    async fn test_script_file_removed_after_run() {
        let mut runner = sh_runner();
        // $0 is the script path when sh runs a file
        let result = runner.run("echo \"$0\"").await;
        assert!(result.succeeded);

        let path = result.stdout.trim();
        assert!(path.ends_with(".R"));
        assert!(!Path::new(path).exists());
    }

    #[tokio::test]
    async fn test_args_come_before_script() {
        let config = RscriptConfig::default()
            .with_program("sh")
            .with_args(vec!["-c".into(), "echo \"flag $0\"".into()]);
        let mut runner = RscriptRunner::new(config);
        let result = runner.run("echo never").await;
        assert!(result.succeeded);
        assert!(result.stdout.starts_with("flag "));
        assert!(result.stdout.trim_end().ends_with(".R"));
    }

    #[tokio::test]
    async fn test_workdir() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("dsc.csv"), "aorta\n1\n").unwrap();

        let mut runner =
            RscriptRunner::new(RscriptConfig::default().with_program("sh").with_workdir(dir.path()));
        let result = runner.run("cat dsc.csv").await;
        assert!(result.succeeded);
        assert_eq!(result.stdout, "aorta\n1\n");
    }

    #[tokio::test]
    async fn test_rscript_prints_hello() {
        if !rscript_available().await {
            eprintln!("Rscript not installed, skipping");
            return;
        }
        let mut runner = RscriptRunner::default();
        let result = runner.run("print(\"hello\")").await;
        assert!(result.succeeded);
        assert!(result.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_rscript_invalid_syntax() {
        if !rscript_available().await {
            eprintln!("Rscript not installed, skipping");
            return;
        }
        let mut runner = RscriptRunner::default();
        let result = runner.run("this is not R").await;
        assert!(!result.succeeded);
        assert!(!result.stderr.is_empty());
    }
}
