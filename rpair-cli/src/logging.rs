//! Diagnostic tracing for the CLI.
//!
//! Tracing goes to stderr and is controlled by `RUST_LOG`. The conversation
//! itself is product output and is printed to stdout by the loop observer,
//! unaffected by the filter.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber.
///
/// Reads `RUST_LOG`, defaulting to `warn`. `verbose` raises the rpair crates
/// to `debug` when `RUST_LOG` is unset.
///
/// # Example
/// ```bash
/// RUST_LOG=rpair_agent=info,rpair_core=debug rpair analyst
/// ```
pub fn init(verbose: bool) {
    let fallback = if verbose {
        "warn,rpair_core=debug,rpair_agent=debug,rpair=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
