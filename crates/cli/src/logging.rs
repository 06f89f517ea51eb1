//! Logging setup for the launcher and the daemon

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt::writer::MakeWriterExt};
use volley::config::DaemonConfig;

/// Parse log level from config string
fn parse_log_level(level: &str) -> tracing::Level {
  match level.to_lowercase().as_str() {
    "off" | "error" => tracing::Level::ERROR,
    "warn" => tracing::Level::WARN,
    "info" => tracing::Level::INFO,
    "debug" => tracing::Level::DEBUG,
    "trace" => tracing::Level::TRACE,
    _ => tracing::Level::INFO,
  }
}

fn env_filter(level: &str) -> EnvFilter {
  // RUST_LOG still wins over the configured level
  EnvFilter::builder()
    .with_default_directive(parse_log_level(level).into())
    .from_env_lossy()
}

/// Initialize logging for launcher-side commands (console only)
pub fn init_cli_logging(level: Option<&str>) {
  tracing_subscriber::fmt()
    .with_env_filter(env_filter(level.unwrap_or("warn")))
    .with_target(false)
    .with_writer(std::io::stderr)
    .init();
}

/// Initialize logging for the daemon.
///
/// Logs go to stdout without ANSI, where the launcher relays them, and to a
/// rolling file under the volley home directory.
///
/// Returns the guard that must be kept alive for the duration of the program
pub fn init_daemon_logging(config: &DaemonConfig, level: Option<&str>) -> Option<WorkerGuard> {
  let filter = env_filter(level.unwrap_or(&config.log_level));

  let log_dir = volley::dirs::default_log_dir();
  if std::fs::create_dir_all(&log_dir).is_err() {
    // Fall back to stdout-only logging
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_ansi(false)
      .init();
    return None;
  }

  let file_appender = match config.log_rotation.as_str() {
    "hourly" => tracing_appender::rolling::hourly(&log_dir, "volley-daemon.log"),
    "never" => tracing_appender::rolling::never(&log_dir, "volley-daemon.log"),
    _ => tracing_appender::rolling::daily(&log_dir, "volley-daemon.log"),
  };
  let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_target(true)
    .with_ansi(false)
    .with_writer(std::io::stdout.and(file_writer))
    .init();

  Some(guard)
}
