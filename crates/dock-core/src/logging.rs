//! Diagnostic logging to stderr.

use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

/// Filter directives: `RUST_LOG` when set and valid, else the config's.
pub fn filter_for(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init(config: &LogConfig) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter_for(config))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
