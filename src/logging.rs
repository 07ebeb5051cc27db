use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::config::LoggingConfig;

/// Environment variable overriding the configured filter.
pub const LOG_ENV: &str = "LANESYNC_LOG";

const LOG_FILE_PREFIX: &str = "lanesync.log";

/// Install the global subscriber.
///
/// Logs go to a daily rolling file under `data_dir/logs`, or to stderr when
/// configured. The returned guard flushes the file writer on drop and must be
/// kept alive for the life of the process.
pub fn init(config: &LoggingConfig, data_dir: &Path) -> Result<Option<WorkerGuard>> {
  let filter = build_filter(config)?;

  if config.stderr {
    tracing_subscriber::registry()
      .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
      .with(filter)
      .try_init()
      .map_err(|e| eyre!("Failed to install logger: {}", e))?;
    return Ok(None);
  }

  let log_dir = data_dir.join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX);
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::registry()
    .with(fmt::layer().with_ansi(false).with_writer(writer))
    .with(filter)
    .try_init()
    .map_err(|e| eyre!("Failed to install logger: {}", e))?;

  Ok(Some(guard))
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
  match std::env::var(LOG_ENV) {
    Ok(directives) if !directives.trim().is_empty() => EnvFilter::try_new(directives)
      .map_err(|e| eyre!("Invalid {} value: {}", LOG_ENV, e)),
    _ => EnvFilter::try_new(&config.level)
      .map_err(|e| eyre!("Invalid logging.level '{}': {}", config.level, e)),
  }
}
