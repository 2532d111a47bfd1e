use tracing_subscriber::{fmt, EnvFilter};

/// Initialize logging with human-readable output.
///
/// Honors `RUST_LOG` when set, otherwise falls back to `default_level`
/// (e.g. "info", "vg_daemon=debug,warn"). Safe to call more than once;
/// later calls are no-ops, which keeps tests simple.
pub fn init_logging(service: &str, default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .try_init()
        .ok();

    tracing::debug!(service, "logging initialised");
}

/// Initialize logging with JSON output, for log shippers.
pub fn init_logging_json(service: &str, default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt()
        .json()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .try_init()
        .ok();

    tracing::debug!(service, "logging initialised (json)");
}
