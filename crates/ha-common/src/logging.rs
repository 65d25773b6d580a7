//! Logging bootstrap for the XRd HA app.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing for the app.
///
/// Structured lines go to stderr with timestamps, level, target, and thread
/// ids. Debug is always enabled for the app's own crates so that container
/// logs carry enough context for post-mortem triage; the HTTP client and h2
/// internals are capped at info to keep the noise down.
pub fn init() {
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_thread_ids(true),
        )
        .with(EnvFilter::new(
            "debug,hyper=info,h2=info,reqwest=info,tower=info,tonic=info",
        ))
        .init();
}
