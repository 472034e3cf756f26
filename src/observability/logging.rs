//! # Logging
//!
//! `tracing-subscriber` setup. `RUST_LOG` controls filtering (default
//! `tenant_controller=info`); `LOG_FORMAT=json` switches to JSON lines.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "tenant_controller=info";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into())
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored with a warning.
pub fn init_logging(log_format: &str) {
    let result = if log_format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter())
            .with_current_span(true)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .try_init()
    };

    if let Err(e) = result {
        tracing::warn!("Tracing subscriber already initialized: {}", e);
    }
}
