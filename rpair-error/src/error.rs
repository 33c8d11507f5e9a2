//! The main Error type for rpair

use crate::{ErrorKind, ErrorStatus};
use std::fmt;

/// The unified error type for all rpair operations.
///
/// - `kind`: what type of error occurred
/// - `message`: human-readable description
/// - `status`: whether the error is retryable
/// - `operation`: what operation raised it
/// - `context`: key-value pairs for debugging
/// - `source`: the underlying error (if any)
///
/// # Example
///
/// ```rust
/// use rpair_error::{Error, ErrorKind, ErrorStatus};
///
/// let err = Error::new(ErrorKind::InferenceFailed, "model returned no content")
///     .with_operation("coder::respond")
///     .with_status(ErrorStatus::Temporary)
///     .with_context("model", "gpt-4o-mini")
///     .with_context("turn", "3");
///
/// assert_eq!(err.kind(), ErrorKind::InferenceFailed);
/// assert!(err.status().is_retryable());
/// ```
pub struct Error {
    kind: ErrorKind,
    message: String,
    status: ErrorStatus,
    operation: &'static str,
    context: Vec<(&'static str, String)>,
    source: Option<anyhow::Error>,
}

impl Error {
    /// Create a new error with the given kind and message
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let status = if kind.is_retryable() {
            ErrorStatus::Temporary
        } else {
            ErrorStatus::Permanent
        };

        Self {
            kind,
            message: message.into(),
            status,
            operation: "",
            context: Vec::new(),
            source: None,
        }
    }

    // =========================================================================
    // Getters
    // =========================================================================

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status(&self) -> ErrorStatus {
        self.status
    }

    /// Get the operation that raised this error
    pub fn operation(&self) -> &'static str {
        self.operation
    }

    pub fn context(&self) -> &[(&'static str, String)] {
        &self.context
    }

    pub fn source_ref(&self) -> Option<&anyhow::Error> {
        self.source.as_ref()
    }

    // =========================================================================
    // Builders (chainable)
    // =========================================================================

    pub fn with_status(mut self, status: ErrorStatus) -> Self {
        self.status = status;
        self
    }

    /// Mark as temporary (retryable)
    pub fn temporary(mut self) -> Self {
        self.status = ErrorStatus::Temporary;
        self
    }

    /// Mark as permanent (not retryable)
    pub fn permanent(mut self) -> Self {
        self.status = ErrorStatus::Permanent;
        self
    }

    /// Set the operation that raised this error.
    ///
    /// A previously set operation moves into context as "called" so the
    /// call chain survives.
    pub fn with_operation(mut self, operation: &'static str) -> Self {
        if !self.operation.is_empty() {
            self.context.push(("called", self.operation.to_string()));
        }
        self.operation = operation;
        self
    }

    pub fn with_context(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.context.push((key, value.into()));
        self
    }

    /// Set the source error.
    ///
    /// # Panics (debug only)
    /// Panics in debug mode if source was already set.
    pub fn set_source(mut self, source: impl Into<anyhow::Error>) -> Self {
        debug_assert!(self.source.is_none(), "source error already set");
        self.source = Some(source.into());
        self
    }

    // =========================================================================
    // Status mutations
    // =========================================================================

    /// Mark as persistent after failed retries
    pub fn persist(mut self) -> Self {
        self.status = self.status.persist();
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.status.is_retryable()
    }
}

// =============================================================================
// Display - compact, single-line format for logs
// =============================================================================

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.kind, self.status)?;
        if !self.operation.is_empty() {
            write!(f, " at {}", self.operation)?;
        }

        if !self.context.is_empty() {
            write!(f, ", context {{ ")?;
            for (i, (key, value)) in self.context.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}: {}", key, value)?;
            }
            write!(f, " }}")?;
        }

        if !self.message.is_empty() {
            write!(f, " => {}", self.message)?;
        }

        Ok(())
    }
}

// =============================================================================
// Debug - verbose, multi-line format for debugging
// =============================================================================

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} ({}) at {}", self.kind, self.status, self.operation)?;

        if !self.message.is_empty() {
            writeln!(f)?;
            writeln!(f, "    Message: {}", self.message)?;
        }

        if !self.context.is_empty() {
            writeln!(f)?;
            writeln!(f, "    Context:")?;
            for (key, value) in &self.context {
                writeln!(f, "        {}: {}", key, value)?;
            }
        }

        if let Some(source) = &self.source {
            writeln!(f)?;
            writeln!(f, "    Source: {:?}", source)?;
        }

        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// Only io::Error gets a blanket conversion; everything else is wrapped explicitly.
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::FileNotFound,
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            _ => ErrorKind::IoFailed,
        };
        Error::new(kind, err.to_string())
            .with_operation("io")
            .set_source(err)
    }
}

// =============================================================================
// Convenience constructors
// =============================================================================

impl Error {
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unexpected, message)
    }

    pub fn config_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigInvalid, message)
    }

    /// A required environment variable holding a credential is unset or empty
    pub fn credential_missing(var: impl Into<String>) -> Self {
        let var = var.into();
        Self::new(
            ErrorKind::CredentialMissing,
            format!("missing credential: set the {} environment variable", var),
        )
        .with_context("env", var)
    }

    pub fn interpreter_not_found(program: impl Into<String>) -> Self {
        let program = program.into();
        Self::new(
            ErrorKind::InterpreterNotFound,
            format!("interpreter '{}' could not be started", program),
        )
        .with_context("program", program)
    }

    pub fn spawn_failed(program: impl Into<String>, reason: impl Into<String>) -> Self {
        let program = program.into();
        Self::new(ErrorKind::SpawnFailed, reason).with_context("program", program)
    }

    pub fn session_closed(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::SessionClosed, reason)
    }

    pub fn inference_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InferenceFailed, message)
    }

    pub fn parse_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ParseFailed, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::new(ErrorKind::InterpreterNotFound, "Rscript missing");
        assert_eq!(err.kind(), ErrorKind::InterpreterNotFound);
        assert_eq!(err.message(), "Rscript missing");
        assert_eq!(err.status(), ErrorStatus::Permanent);
    }

    #[test]
    fn test_error_with_context() {
        let err = Error::new(ErrorKind::InferenceFailed, "timeout")
            .with_operation("coder::respond")
            .with_context("model", "gpt-4o")
            .with_context("turn", "2");

        assert_eq!(err.operation(), "coder::respond");
        assert_eq!(err.context().len(), 2);
        assert_eq!(err.context()[0], ("model", "gpt-4o".to_string()));
    }

    #[test]
    fn test_operation_chaining() {
        let err = Error::new(ErrorKind::NetworkFailed, "connection reset")
            .with_operation("openai::complete")
            .with_operation("coder::respond");

        assert_eq!(err.operation(), "coder::respond");
        assert_eq!(err.context().len(), 1);
        assert_eq!(err.context()[0], ("called", "openai::complete".to_string()));
    }

    #[test]
    fn test_default_status_follows_kind() {
        let err = Error::new(ErrorKind::RateLimited, "slow down");
        assert!(err.is_retryable());

        let err = Error::new(ErrorKind::CredentialMissing, "no key");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_persist() {
        let err = Error::new(ErrorKind::NetworkFailed, "connection refused");
        assert!(err.is_retryable());

        let err = err.persist();
        assert!(!err.is_retryable());
        assert_eq!(err.status(), ErrorStatus::Persistent);
    }

    #[test]
    fn test_display() {
        let err = Error::new(ErrorKind::InferenceFailed, "model unavailable")
            .with_operation("coder::respond")
            .with_context("model", "gpt-4o-mini")
            .with_context("attempt", "3");

        let display = format!("{}", err);
        assert!(display.contains("InferenceFailed"));
        assert!(display.contains("temporary"));
        assert!(display.contains("coder::respond"));
        assert!(display.contains("model: gpt-4o-mini"));
        assert!(display.ends_with("=> model unavailable"));
    }

    #[test]
    fn test_display_without_operation() {
        let err = Error::invalid_argument("empty path");
        assert_eq!(err.to_string(), "InvalidArgument (permanent) => empty path");
    }

    #[test]
    fn test_convenience_constructors() {
        let err = Error::credential_missing("OPENAI_API_KEY");
        assert_eq!(err.kind(), ErrorKind::CredentialMissing);
        assert!(err.message().contains("OPENAI_API_KEY"));
        assert!(err.kind().is_startup());

        let err = Error::interpreter_not_found("Rscript");
        assert_eq!(err.kind(), ErrorKind::InterpreterNotFound);
        assert_eq!(err.context()[0], ("program", "Rscript".to_string()));
    }

    #[test]
    fn test_io_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = Error::from(io_err);

        assert_eq!(err.kind(), ErrorKind::FileNotFound);
        assert_eq!(err.operation(), "io");
        assert!(err.source_ref().is_some());
    }
}
