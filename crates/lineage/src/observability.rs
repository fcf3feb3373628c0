//! Log output for the binary. The library only emits `tracing` events.

use tracing_subscriber::EnvFilter;

pub const ENV_LOG: &str = "LINEAGE_LOG";

/// `LINEAGE_LOG`, then `RUST_LOG`, then `default_level`.
#[must_use]
pub fn log_filter(default_level: &str) -> EnvFilter {
    let directives = std::env::var(ENV_LOG)
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| default_level.to_string());

    EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Installs a stderr fmt subscriber so stdout stays machine-readable.
/// A second call is a no-op.
pub fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(log_filter(default_level))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
