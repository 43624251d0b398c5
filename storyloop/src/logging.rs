//! Development-time tracing.
//!
//! Tracing is diagnostics on stderr, driven by `RUST_LOG`. User-facing
//! progress goes through the event bus and [`crate::display`] instead.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. When unset, defaults to `warn`, or `storyloop=debug`
/// with `verbose`.
///
/// # Example
/// ```bash
/// RUST_LOG=storyloop=trace storyloop --resume
/// ```
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(verbose));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

fn default_filter(verbose: bool) -> EnvFilter {
    if verbose {
        EnvFilter::new("warn,storyloop=debug")
    } else {
        EnvFilter::new("warn")
    }
}
