//! Tracing subscriber setup for embedders and tests.

use sentinel_domain::SentinelError;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_directives` applies
/// (e.g. `"info,sentinel_core=debug"`). Safe to call more than once:
/// subsequent calls are no-ops, which keeps test setups simple.
pub fn init_logging(default_directives: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Convert a `SentinelError` into a stable label suitable for
/// metrics/logging.
#[inline]
#[must_use]
pub fn error_label(error: &SentinelError) -> &'static str {
    match error {
        SentinelError::Queue(_) => "queue",
        SentinelError::Network(_) => "network",
        SentinelError::Unavailable(_) => "unavailable",
        SentinelError::Storage(_) => "storage",
        SentinelError::Broadcast(_) => "broadcast",
        SentinelError::Config(_) => "config",
        SentinelError::NotFound(_) => "not_found",
        SentinelError::InvalidInput(_) => "invalid_input",
        SentinelError::Internal(_) => "internal",
    }
}
