//! Logging setup and the crate-wide log macros.

use tracing_subscriber::EnvFilter;

pub use tracing;
pub use tracing::{debug, error, info, warn};

const DEFAULT_FILTER: &str = "vmigrate=info";

/// Install the global fmt subscriber. Honours `RUST_LOG`; calling it twice is harmless.
pub fn init_logger() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => { $crate::logger::tracing::debug!($($arg)*) };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => { $crate::logger::tracing::info!($($arg)*) };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => { $crate::logger::tracing::warn!($($arg)*) };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => { $crate::logger::tracing::error!($($arg)*) };
}
