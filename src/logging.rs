use std::sync::Once;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// Ensure initialization happens only once
static INIT: Once = Once::new();

/// Initialize the logging system with sensible defaults.
///
/// Log level can be set using the RUST_LOG environment variable.
/// Example: RUST_LOG=debug,api_rate_limiter=trace
pub fn init() {
    INIT.call_once(|| {
        // Default to 'info' level if RUST_LOG is not set
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true) // several requests share one bucket row
                    .with_line_number(true),
            )
            .init();

        tracing::info!("Logging initialized");
    });
}

/// Same as [`init`] but emits one JSON object per line.
pub fn init_json() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_current_span(false))
            .init();

        tracing::info!("Logging initialized");
    });
}

/// Macro for logging the outcome of one rate limit check
#[macro_export]
macro_rules! rate_limit_event {
    ($key:expr, $allowed:expr, $remaining:expr) => {
        tracing::info!(
            key = $key,
            consumed = $allowed,
            remaining = $remaining,
            time = %chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
            "Rate limit check"
        )
    };
}

/// Macro for logging bucket row operations with timing
#[macro_export]
macro_rules! storage_op {
    ($operation:expr, $bucket_id:expr, $result:expr, $elapsed_ms:expr) => {
        tracing::debug!(
            operation = $operation,
            bucket_id = $bucket_id,
            success = $result.is_ok(),
            elapsed_ms = $elapsed_ms,
            "Storage operation"
        )
    };
}
