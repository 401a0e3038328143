//! Tracing setup: daily log files, with warnings echoed to stderr.

use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::{data_dir, LoggingConfig};

/// Install the global subscriber. Keep the returned guard alive until exit
/// or buffered lines are lost.
pub fn init(config: &LoggingConfig) -> Result<WorkerGuard> {
  let dir = log_dir(config)?;
  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let appender = RollingFileAppender::builder()
    .rotation(Rotation::DAILY)
    .filename_prefix("compliance-cache")
    .filename_suffix("log")
    .build(&dir)
    .map_err(|e| eyre!("Failed to create log file appender: {}", e))?;
  let (writer, guard) = tracing_appender::non_blocking(appender);

  // RUST_LOG wins over the configured level
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

  let file = fmt::layer().with_writer(writer).with_ansi(false);
  let console = fmt::layer()
    .with_writer(std::io::stderr)
    .with_target(false)
    .with_filter(LevelFilter::WARN);

  tracing_subscriber::registry()
    .with(filter)
    .with(file)
    .with(console)
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  tracing::debug!(log_dir = %dir.display(), "logging initialized");
  Ok(guard)
}

fn log_dir(config: &LoggingConfig) -> Result<PathBuf> {
  match &config.dir {
    Some(dir) => Ok(dir.clone()),
    None => Ok(data_dir()?.join("logs")),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_explicit_log_dir() {
    let config = LoggingConfig {
      level: "debug".to_string(),
      dir: Some(PathBuf::from("/tmp/cc-logs")),
    };
    assert_eq!(log_dir(&config).unwrap(), PathBuf::from("/tmp/cc-logs"));
  }
}
