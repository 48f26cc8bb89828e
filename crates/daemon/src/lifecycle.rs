//! Daemon entry: wires core, router and server; maps outcomes to process
//! exit codes (0 clean, 1 fatal init error, 2 database corruption).

use std::path::PathBuf;

use lodestone_core::UserDataDirs;
use thiserror::Error;
use tokio::signal;
use tracing::{error, info, warn};

use crate::core::InitError;
use crate::{DaemonCore, Router, Server};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
  Clean = 0,
  FatalInit = 1,
  DbCorrupt = 2,
}

#[derive(Debug, Error)]
pub enum LifecycleError {
  #[error("Server error: {0}")]
  Server(#[from] crate::server::ServerError),
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
  pub user_data: PathBuf,
  /// Override for the embed-worker binary (tests, packaging layouts).
  pub worker_binary: Option<PathBuf>,
  /// Initialize immediately instead of waiting for an `init` request.
  pub eager_init: bool,
}

impl Default for DaemonConfig {
  fn default() -> Self {
    Self {
      user_data: UserDataDirs::resolve().root().to_path_buf(),
      worker_binary: None,
      eager_init: true,
    }
  }
}

pub struct Daemon {
  config: DaemonConfig,
}

impl Daemon {
  pub fn new(config: DaemonConfig) -> Self {
    Self { config }
  }

  /// Run until a shutdown request or signal. Returns the process exit code.
  pub async fn run(self) -> ExitCode {
    let dirs = UserDataDirs::new(&self.config.user_data);
    let core = DaemonCore::new(dirs.clone(), self.config.worker_binary.clone());

    if self.config.eager_init {
      match core.init().await {
        Ok(result) => info!(schema_version = result.schema_version, "Initialized"),
        Err(InitError::DbCorrupt(message)) => {
          error!(message, "Database corrupt; wipe the data directory and re-index");
          return ExitCode::DbCorrupt;
        }
        Err(e) => {
          error!(error = %e, "Initialization failed");
          return ExitCode::FatalInit;
        }
      }

      // Resume watching folders remembered from the previous run.
      let folders = core.watched_folders();
      if !folders.is_empty()
        && let Err(e) = core.watch_start(folders, Default::default()).await
      {
        warn!(error = %e, "Failed to resume watched folders");
      }
    }

    let server = Server::new(Router::new(core.clone()), dirs.socket_path());
    let shutdown_handle = server.shutdown_handle();

    // Signals trigger the same ordered shutdown as a `shutdown` request.
    {
      let core = core.clone();
      let shutdown_handle = shutdown_handle.clone();
      tokio::spawn(async move {
        wait_for_signal().await;
        info!("Signal received, shutting down");
        let report = core.shutdown().await;
        if !report.clean() {
          warn!(?report, "Shutdown completed with timeouts");
        }
        shutdown_handle.shutdown();
      });
    }

    if let Err(e) = server.run().await {
      error!(error = %e, "Server failed");
      return ExitCode::FatalInit;
    }

    // A shutdown request stops the server before the core finishes its
    // step list only if the connection dropped; make sure it ran.
    if core.state() != crate::LifecycleState::Terminated {
      let report = core.shutdown().await;
      if !report.clean() {
        warn!(?report, "Shutdown completed with timeouts");
      }
    }
    ExitCode::Clean
  }
}

async fn wait_for_signal() {
  #[cfg(unix)]
  {
    let mut sigterm =
      signal::unix::signal(signal::unix::SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
      _ = signal::ctrl_c() => {}
      _ = sigterm.recv() => {}
    }
  }
  #[cfg(not(unix))]
  {
    let _ = signal::ctrl_c().await;
  }
}
