//! rpair-core error types
//!
//! Re-exports rpair-error so downstream crates only need rpair-core.

pub use rpair_error::{Error, ErrorKind, ErrorStatus, Result};
