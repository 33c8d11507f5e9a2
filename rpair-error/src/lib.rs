//! # rpair-error
//!
//! Unified error handling for rpair.
//!
//! ## Design
//!
//! - **ErrorKind**: what went wrong (e.g., InterpreterNotFound, InferenceFailed)
//! - **ErrorStatus**: whether retrying can help (Permanent, Temporary, Persistent)
//! - **Context**: key-value pairs that help locate the cause
//! - **Source**: the wrapped underlying error
//!
//! ## Usage
//!
//! ```rust
//! use rpair_error::{Error, ErrorKind};
//!
//! fn probe() -> Result<(), Error> {
//!     Err(Error::new(ErrorKind::InterpreterNotFound, "Rscript is not on PATH")
//!         .with_operation("runner::probe")
//!         .with_context("program", "Rscript"))
//! }
//! ```
//!
//! ## Principles
//!
//! - Library functions return `Result<T, rpair_error::Error>`
//! - External errors are wrapped with `set_source(err)`
//! - An error is handled once; callers further up only append context
//! - Execution failures of user code are data, not errors

mod error;
mod kind;
mod status;

pub use error::Error;
pub use kind::ErrorKind;
pub use status::ErrorStatus;

/// Result type alias using the rpair Error
pub type Result<T> = std::result::Result<T, Error>;
