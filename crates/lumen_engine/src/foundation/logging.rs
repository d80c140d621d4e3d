//! Logging utilities and structured logging support

pub use log::{debug, error, info, trace, warn};

/// Initialize the logging system from `RUST_LOG`, defaulting to `info`
///
/// Calling it again after a logger is installed has no effect.
pub fn init() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    init_with_filter(&filter);
}

/// Initialize the logging system with explicit `env_logger` filter directives
pub fn init_with_filter(filter: &str) {
    let result = env_logger::Builder::new()
        .parse_filters(filter)
        .format_timestamp_millis()
        .try_init();

    if result.is_err() {
        log::debug!("Logger already initialized, ignoring filter '{}'", filter);
    }
}
