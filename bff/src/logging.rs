//! Logging and tracing initialization.
//!
//! Call [`init_logging`] once at startup, before building the server. The
//! log level is controlled by the `RUST_LOG` environment variable:
//!
//! ```bash
//! RUST_LOG=debug cargo run   # per-connection rejection details
//! RUST_LOG=info cargo run    # worker lifecycle and metrics (default)
//! RUST_LOG=warn cargo run    # exhaustion and failures only
//! ```

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging with sensible defaults.
///
/// # Panics
///
/// Panics if a global subscriber is already installed. Call it once at
/// application startup.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
