//! Logging setup for CLI commands and the daemon.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Console-only logging for one-shot CLI commands.
pub fn init_cli_logging() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()))
    .with_writer(std::io::stderr)
    .init();
}

/// Daemon logging: daily-rolling files under `<user_data>/logs/`, console
/// mirror when running in the foreground.
///
/// The returned guard must stay alive for the process lifetime.
pub fn init_daemon_logging(logs_dir: &Path, foreground: bool) -> Option<WorkerGuard> {
  let filter = || EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());

  if foreground {
    tracing_subscriber::fmt().with_env_filter(filter()).init();
    return None;
  }

  let appender = tracing_appender::rolling::daily(logs_dir, "lodestone.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  tracing_subscriber::fmt()
    .with_env_filter(filter())
    .with_writer(writer)
    .with_ansi(false)
    .init();
  Some(guard)
}

/// Remove rolled log files older than `retention_days`.
pub fn sweep_old_logs(logs_dir: &Path, retention_days: u64) {
  if retention_days == 0 {
    return;
  }
  let Ok(entries) = std::fs::read_dir(logs_dir) else {
    return;
  };
  let cutoff = std::time::SystemTime::now() - std::time::Duration::from_secs(retention_days * 24 * 3600);
  for entry in entries.flatten() {
    let Ok(metadata) = entry.metadata() else { continue };
    let Ok(modified) = metadata.modified() else { continue };
    if metadata.is_file() && modified < cutoff {
      let _ = std::fs::remove_file(entry.path());
    }
  }
}
