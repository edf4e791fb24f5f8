//! Diagnostic tracing for keeper.
//!
//! Diagnostics go to stderr and are filtered by `RUST_LOG` (default `warn`).
//! Product artifacts (the run log under `.keeper/runs/`, the daily summary)
//! are written regardless of the filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the stderr subscriber.
///
/// ```bash
/// RUST_LOG=keeper=debug keeper run --mode milestone
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
