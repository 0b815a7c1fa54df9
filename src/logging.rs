use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogConfig;

/// Send tracing output to the log file so it never mixes with command output.
///
/// RUST_LOG takes precedence over the configured level. The returned guard
/// flushes pending lines on drop and must live as long as `main`.
pub fn init(config: &LogConfig) -> Result<Option<WorkerGuard>> {
  let Some(path) = config.file_path() else {
    return Ok(None);
  };
  let (Some(dir), Some(file_name)) = (path.parent(), path.file_name()) else {
    return Err(eyre!("Invalid log file path: {}", path.display()));
  };
  std::fs::create_dir_all(dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(&config.level))
    .unwrap_or_else(|_| EnvFilter::new("info"));

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));

  tracing_subscriber::registry()
    .with(filter)
    .with(
      fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true),
    )
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(Some(guard))
}
