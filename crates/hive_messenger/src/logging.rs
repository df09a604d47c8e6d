use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::error::MessengerError;

/// Initializes compact console logging. `RUST_LOG` wins over `default_filter`.
///
/// Protocol chatter (gaps, replays, discovery) is emitted at `debug` and only
/// when the messenger's `debug` flag is set.
pub fn init_logging(default_filter: &str) -> Result<(), MessengerError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false).compact())
        .try_init()
        .map_err(|e| MessengerError::Logging(e.to_string()))
}

/// Initialize logging to a daily-rotated file in `logs_dir`.
/// The returned guard must stay alive for buffered lines to be flushed.
pub fn init_logging_to_dir(logs_dir: &Path, filter: &str) -> Result<WorkerGuard, MessengerError> {
    std::fs::create_dir_all(logs_dir)?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, "hive_messenger");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .try_init()
        .map_err(|e| MessengerError::Logging(e.to_string()))?;

    Ok(guard)
}
