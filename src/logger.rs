//! Centralized logging configuration for the apex-block-sparse binary and benches
//!
//! The library itself only emits `tracing` events. Installing a subscriber is
//! left to executables, which call one of the functions below once at startup.

use std::error::Error;

use tracing::Level;
use tracing_subscriber::fmt::time::SystemTime;

/// Initialize the tracing subscriber with the standard configuration
///
/// Default log level: INFO (overrideable via RUST_LOG environment variable)
///
/// # Example
/// ```no_run
/// use apex_block_sparse::init_logger;
///
/// fn main() {
///     init_logger();
///     tracing::info!("Application started");
/// }
/// ```
///
/// # Environment Variables
/// ```bash
/// RUST_LOG=debug cargo run --bin solve_random_problem
/// RUST_LOG=apex_block_sparse=trace cargo run --bin solve_random_problem
/// ```
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Initialize the tracing subscriber with a custom default level
///
/// Panics if a global subscriber was already installed.
pub fn init_logger_with_level(default_level: Level) {
    if let Err(err) = try_init_logger_with_level(default_level) {
        panic!("failed to install tracing subscriber: {err}");
    }
}

/// Same as [`init_logger_with_level`] but reports an already installed
/// subscriber as an error. Useful from tests, where many cases share a process.
pub fn try_init_logger_with_level(
    default_level: Level,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .with_timer(SystemTime)
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_thread_names(true)
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_reported() {
        let _ = try_init_logger_with_level(Level::DEBUG);
        assert!(try_init_logger_with_level(Level::DEBUG).is_err());
    }
}
