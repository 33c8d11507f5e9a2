//! Session backend: a persistent R evaluation context
//!
//! An [`RSession`] owns one long-lived `R` process. Each call sources the code
//! into the global environment, so variables defined in one turn are still
//! there in the next. Tests create their own session to stay isolated.
//!
//! ## Protocol
//! A helper function is attached to the R search path at startup. For each
//! call the code goes to a temporary file and the helper is invoked on it.
//! The helper captures console output, errors, warnings and messages, then
//! answers with a header line followed by both payloads:
//!
//! ```text
//! <token> <ok|error> <stdout bytes> <stderr bytes>\n<stdout><stderr>
//! ```
//!
//! Anything printed before the header (e.g., by `system()`) is kept as
//! stdout. After the reply the helper writes the token on a line of its own to
//! stderr; everything R wrote to stderr before that line belongs to the call.

use super::rscript::write_script;
use super::{CodeRunner, ExecutionResult};
use crate::error::{Error, Result};
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

const BOOTSTRAP: &str = r#"local({
  tools <- new.env()
  tools$.rpair_eval <- function(path, token) {
    err <- character()
    ok <- TRUE
    out <- utils::capture.output(invisible(
      withCallingHandlers(
        tryCatch(
          base::source(path, local = globalenv(), echo = FALSE, print.eval = TRUE),
          error = function(e) {
            ok <<- FALSE
            err <<- c(err, paste0("Error: ", conditionMessage(e)))
          }
        ),
        warning = function(w) {
          err <<- c(err, paste0("Warning message:\n", conditionMessage(w)))
          invokeRestart("muffleWarning")
        },
        message = function(m) {
          err <<- c(err, sub("\n$", "", conditionMessage(m)))
          invokeRestart("muffleMessage")
        }
      )
    ))
    out <- paste(out, collapse = "\n")
    if (nzchar(out)) out <- paste0(out, "\n")
    err <- paste(err, collapse = "\n")
    if (nzchar(err)) err <- paste0(err, "\n")
    cat(sprintf("%s %s %d %d\n", token, if (ok) "ok" else "error",
                nchar(out, type = "bytes"), nchar(err, type = "bytes")))
    cat(out, err, sep = "")
    flush(stdout())
    cat(token, "\n", sep = "", file = stderr())
    invisible(NULL)
  }
  attach(tools, name = "rpair:tools")
})
"#;

const CLEAR_GLOBALS: &str = "rm(list = ls(envir = globalenv(), all.names = TRUE), envir = globalenv())";

/// How long to wait for the stderr end marker once stdout has replied
const STDERR_GRACE: Duration = Duration::from_secs(2);

const RESTART_NOTE: &str = "note: the R session was restarted; earlier variables are gone\n";

/// Configuration for [`RSession`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// R binary (reads commands from stdin)
    pub program: String,
    pub args: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            program: "R".to_string(),
            args: vec!["--vanilla".into(), "--slave".into()],
        }
    }
}

impl SessionConfig {
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }
}

/// Persistent evaluation context.
pub struct RSession {
    config: SessionConfig,
    process: Option<SessionProcess>,
    /// Set when a dead process was discarded; the next spawn reports it
    restarted: bool,
    evals: u64,
}

impl RSession {
    /// Start a session with the default `R` binary.
    pub async fn start() -> Result<Self> {
        Self::start_with(SessionConfig::default()).await
    }

    /// Start a session and verify it answers.
    ///
    /// A binary that cannot be started is an `InterpreterNotFound` error.
    #[instrument(skip_all, fields(program = %config.program))]
    pub async fn start_with(config: SessionConfig) -> Result<Self> {
        let process = SessionProcess::spawn(&config).await?;
        let mut session = Self {
            config,
            process: Some(process),
            restarted: false,
            evals: 0,
        };

        let handshake = session.evaluate("invisible(NULL)").await?;
        if !handshake.succeeded {
            return Err(Error::interpreter_not_found(&session.config.program)
                .with_operation("session::start")
                .with_context("stderr", handshake.stderr));
        }
        info!("R session started");
        Ok(session)
    }

    /// Remove every binding from the global environment.
    pub async fn reset(&mut self) -> Result<()> {
        let result = self.evaluate(CLEAR_GLOBALS).await?;
        if !result.succeeded {
            return Err(Error::session_closed(result.stderr).with_operation("session::reset"));
        }
        debug!("global environment cleared");
        Ok(())
    }

    /// Whether the underlying process is running.
    pub fn is_alive(&mut self) -> bool {
        match self.process.as_mut() {
            Some(process) => matches!(process.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Ask R to quit and wait for it.
    pub async fn close(mut self) -> Result<()> {
        if let Some(mut process) = self.process.take() {
            process.stdin.write_all(b"q(save = \"no\")\n").await?;
            process.stdin.flush().await?;
            process.child.wait().await?;
            process.stderr_task.abort();
        }
        Ok(())
    }

    async fn evaluate(&mut self, code: &str) -> Result<ExecutionResult> {
        let mut note = "";
        if self.process.is_some() && !self.is_alive() {
            warn!("R process exited between calls");
            self.discard_process();
        }
        if self.process.is_none() {
            self.process = Some(SessionProcess::spawn(&self.config).await?);
            if std::mem::take(&mut self.restarted) {
                note = RESTART_NOTE;
            }
        }

        let script = write_script(code)?;
        self.evals += 1;
        let token = format!("__RPAIR_{}__", self.evals);

        let process = self
            .process
            .as_mut()
            .ok_or_else(|| Error::session_closed("no R process").with_operation("session::evaluate"))?;
        let mut result = match process.eval(script.path(), &token).await {
            Ok(result) => result,
            Err(err) => {
                let stray_stderr = process.stderr.take_all();
                self.discard_process();
                return Ok(ExecutionResult {
                    stdout: String::new(),
                    stderr: format!("{}{}\n{}", note, err.message(), stray_stderr),
                    succeeded: false,
                });
            }
        };

        if !note.is_empty() {
            result.stderr.insert_str(0, note);
        }
        Ok(result)
    }

    fn discard_process(&mut self) {
        if let Some(process) = self.process.take() {
            process.stderr_task.abort();
            // kill_on_drop reaps the child
        }
        self.restarted = true;
    }
}

impl CodeRunner for RSession {
    fn name(&self) -> &str {
        "session"
    }

    #[instrument(skip_all, fields(bytes = code.len()))]
    async fn run(&mut self, code: &str) -> ExecutionResult {
        match self.evaluate(code).await {
            Ok(result) => result,
            Err(err) => {
                warn!(error = %err, "session evaluation failed");
                self.discard_process();
                ExecutionResult::failure(format!("Exception when running R code:\n{}", err.message()))
            }
        }
    }
}

impl Drop for RSession {
    fn drop(&mut self) {
        if let Some(process) = self.process.take() {
            process.stderr_task.abort();
        }
    }
}

struct SessionProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    stderr: Arc<StderrBuffer>,
    stderr_task: JoinHandle<()>,
}

/// Bytes R wrote to its stderr, filled by a background reader.
#[derive(Default)]
struct StderrBuffer {
    bytes: Mutex<Vec<u8>>,
    grew: Notify,
}

impl StderrBuffer {
    fn append(&self, chunk: &[u8]) {
        if let Ok(mut bytes) = self.bytes.lock() {
            bytes.extend_from_slice(chunk);
        }
        self.grew.notify_one();
    }

    /// Remove and return everything before `marker`, and the marker itself.
    fn take_through(&self, marker: &[u8]) -> Option<String> {
        let mut bytes = self.bytes.lock().ok()?;
        let pos = bytes.windows(marker.len()).position(|w| w == marker)?;
        let text = String::from_utf8_lossy(&bytes[..pos]).into_owned();
        bytes.drain(..pos + marker.len());
        Some(text)
    }

    fn take_all(&self) -> String {
        match self.bytes.lock() {
            Ok(mut bytes) => String::from_utf8_lossy(&std::mem::take(&mut *bytes)).into_owned(),
            Err(_) => String::new(),
        }
    }

    /// Wait for `token` on its own line, returning what came before it.
    async fn until_marker(&self, token: &str) -> String {
        let marker = format!("{}\n", token).into_bytes();
        let wait = async {
            loop {
                if let Some(text) = self.take_through(&marker) {
                    return text;
                }
                self.grew.notified().await;
            }
        };
        match tokio::time::timeout(STDERR_GRACE, wait).await {
            Ok(text) => text,
            Err(_) => {
                warn!("stderr end marker not seen");
                self.take_all()
            }
        }
    }
}

impl SessionProcess {
    async fn spawn(config: &SessionConfig) -> Result<Self> {
        let mut child = Command::new(&config.program)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::interpreter_not_found(&config.program)
                    .with_operation("session::spawn")
                    .set_source(e)
            })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let (Some(mut stdin), Some(stdout), Some(mut stderr_pipe)) = (stdin, stdout, stderr_pipe) else {
            return Err(Error::spawn_failed(&config.program, "child pipes were not captured")
                .with_operation("session::spawn"));
        };

        let stderr = Arc::new(StderrBuffer::default());
        let sink = Arc::clone(&stderr);
        let stderr_task = tokio::spawn(async move {
            let mut chunk = [0u8; 4096];
            loop {
                match stderr_pipe.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => sink.append(&chunk[..n]),
                }
            }
        });

        stdin.write_all(BOOTSTRAP.as_bytes()).await.map_err(|e| {
            Error::spawn_failed(&config.program, "could not send bootstrap")
                .with_operation("session::spawn")
                .set_source(e)
        })?;
        debug!(pid = ?child.id(), "R process spawned");

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            stderr,
            stderr_task,
        })
    }

    async fn eval(&mut self, script: &Path, token: &str) -> Result<ExecutionResult> {
        let command = format!(".rpair_eval(\"{}\", \"{}\")\n", r_string(&script.to_string_lossy()), token);
        self.stdin
            .write_all(command.as_bytes())
            .await
            .map_err(|e| Error::session_closed("R session is not accepting input").set_source(e))?;
        self.stdin.flush().await?;

        let mut stray = Vec::new();
        let header = loop {
            let mut line = Vec::new();
            let read = self.stdout.read_until(b'\n', &mut line).await?;
            if read == 0 {
                return Err(Error::session_closed("R session terminated during evaluation")
                    .with_operation("session::eval"));
            }
            let text = String::from_utf8_lossy(&line);
            if let Some(rest) = text.strip_prefix(token) {
                break Header::parse(rest.trim())?;
            }
            stray.extend_from_slice(&line);
        };

        let mut out = vec![0u8; header.stdout_len];
        self.stdout.read_exact(&mut out).await?;
        let mut err = vec![0u8; header.stderr_len];
        self.stdout.read_exact(&mut err).await?;

        stray.extend_from_slice(&out);
        let mut stderr = String::from_utf8_lossy(&err).into_owned();
        // written straight to fd 2, outside the helper's capture
        stderr.push_str(&self.stderr.until_marker(token).await);

        Ok(ExecutionResult {
            stdout: String::from_utf8_lossy(&stray).into_owned(),
            stderr,
            succeeded: header.ok,
        })
    }
}

struct Header {
    ok: bool,
    stdout_len: usize,
    stderr_len: usize,
}

impl Header {
    fn parse(rest: &str) -> Result<Self> {
        let mut parts = rest.split_whitespace();
        let ok = match parts.next() {
            Some("ok") => true,
            Some("error") => false,
            other => {
                return Err(Error::parse_failed(format!("bad reply status: {:?}", other))
                    .with_operation("session::eval"))
            }
        };
        let mut len = || -> Result<usize> {
            parts
                .next()
                .and_then(|n| n.parse().ok())
                .ok_or_else(|| Error::parse_failed(format!("bad reply header: {}", rest)))
        };
        let stdout_len = len()?;
        let stderr_len = len()?;
        Ok(Self {
            ok,
            stdout_len,
            stderr_len,
        })
    }
}

/// Escape text for use inside a double-quoted R string literal.
fn r_string(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('"', "\\\"")
}
