//! Diagnostic tracing for the CLI.
//!
//! Tracing goes to stderr and is filtered by `RUST_LOG` (default `warn`).
//! The per-run event log and the run table are written regardless.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
