//! Tracing setup: console plus a daily-rolling file in the data directory.

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "jwt_refresher=info";

/// Rotated log files kept on disk; older ones are removed.
pub const MAX_LOG_FILES: usize = 5;

/// Initializes the global subscriber.
///
/// Keep the returned guard alive for the lifetime of the process, dropping it
/// flushes and stops the file writer.
pub fn init_logging(log_dir: &Path, file_name: &str) -> Result<WorkerGuard> {
    let file_appender = file_appender(log_dir, file_name)?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .try_init()
        .map_err(|e| anyhow!("Failed to set global default subscriber: {}", e))?;

    Ok(guard)
}

/// Daily rotation, keeping the newest [`MAX_LOG_FILES`] files.
fn file_appender(log_dir: &Path, file_name: &str) -> Result<RollingFileAppender> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .max_log_files(MAX_LOG_FILES)
        .filename_prefix(file_name)
        .build(log_dir)
        .with_context(|| format!("Failed to create log file in {}", log_dir.display()))
}
