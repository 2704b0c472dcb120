use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Default filter when `RUST_LOG` is not set
pub const DEFAULT_LOG_FILTER: &str = "readalong_voice_lib=debug,readalong_relay=debug,warn";

/// Initialize logging with tracing
///
/// - Reads the filter from `RUST_LOG` if available
/// - Falls back to [`DEFAULT_LOG_FILTER`]
/// - Uses a formatted output layer
///
/// Safe to call more than once; later calls are ignored.
///
/// # Example
///
/// ```no_run
/// use readalong_voice_lib::utils::logging::init_logging;
///
/// init_logging();
/// ```
pub fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let installed = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!("ReadAlong voice logging initialized");
    }
}
