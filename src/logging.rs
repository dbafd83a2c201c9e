//! Log output
//!
//! Installs a `tracing` subscriber filtered by `LLAMA_BRIDGE_LOG`
//! (`EnvFilter` syntax, default `info`). llama.cpp's own logs are routed into
//! `tracing` by the backend.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter
pub const LOG_ENV: &str = "LLAMA_BRIDGE_LOG";

/// Installs the global subscriber; later calls are no-ops
pub fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!("Logging initialized");
    }
}
