//! Unix socket server: newline-delimited JSON request/response, with
//! unsolicited progress events pushed to every open connection.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ipc::{Request, Response};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::Router;

#[derive(Error, Debug)]
pub enum ServerError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("JSON error: {0}")]
  Json(#[from] serde_json::Error),
}

pub struct Server {
  socket_path: PathBuf,
  router: Arc<Router>,
  shutdown_tx: broadcast::Sender<()>,
}

/// Clonable handle that stops the accept loop.
#[derive(Clone)]
pub struct ShutdownHandle {
  tx: broadcast::Sender<()>,
}

impl ShutdownHandle {
  pub fn shutdown(&self) {
    let _ = self.tx.send(());
  }
}

impl Server {
  pub fn new(router: Router, socket_path: PathBuf) -> Self {
    let (shutdown_tx, _) = broadcast::channel(1);
    Self {
      socket_path,
      router: Arc::new(router),
      shutdown_tx,
    }
  }

  pub fn shutdown_handle(&self) -> ShutdownHandle {
    ShutdownHandle {
      tx: self.shutdown_tx.clone(),
    }
  }

  pub fn socket_path(&self) -> &Path {
    &self.socket_path
  }

  pub async fn run(&self) -> Result<(), ServerError> {
    if self.socket_path.exists() {
      std::fs::remove_file(&self.socket_path)?;
    }
    if let Some(parent) = self.socket_path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(&self.socket_path)?;
    info!(socket = %self.socket_path.display(), "Daemon listening");

    let mut shutdown_rx = self.shutdown_tx.subscribe();
    loop {
      tokio::select! {
        result = listener.accept() => {
          match result {
            Ok((stream, _)) => {
              let router = Arc::clone(&self.router);
              let shutdown = self.shutdown_handle();
              tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, router, shutdown).await {
                  debug!(error = %e, "Connection ended with error");
                }
              });
            }
            Err(e) => error!(error = %e, "Accept failed"),
          }
        }
        _ = shutdown_rx.recv() => {
          info!("Server stopping");
          break;
        }
      }
    }

    if self.socket_path.exists() {
      std::fs::remove_file(&self.socket_path)?;
    }
    Ok(())
  }
}

async fn handle_connection(
  stream: UnixStream,
  router: Arc<Router>,
  shutdown: ShutdownHandle,
) -> Result<(), ServerError> {
  let (reader, mut writer) = stream.into_split();
  let mut reader = BufReader::new(reader);
  let mut line = String::new();
  let mut progress_rx = router.core().subscribe_progress();

  loop {
    line.clear();
    tokio::select! {
      read = reader.read_line(&mut line) => {
        if read? == 0 {
          return Ok(());
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
          continue;
        }

        let request: Request = match serde_json::from_str(trimmed) {
          Ok(request) => request,
          Err(e) => {
            warn!(error = %e, "Unparseable request");
            let response = Response::<()>::error(None, -32700, &format!("parse error: {e}"));
            write_json(&mut writer, &response).await?;
            continue;
          }
        };

        let is_shutdown = request.method == ipc::Method::Shutdown;
        let response = router.dispatch(request).await;
        write_json(&mut writer, &response).await?;

        if is_shutdown {
          shutdown.shutdown();
          return Ok(());
        }
      }

      event = progress_rx.recv() => {
        match event {
          Ok(event) => write_json(&mut writer, &Response::event(event)).await?,
          // Fell behind; skip to the live edge.
          Err(broadcast::error::RecvError::Lagged(skipped)) => {
            debug!(skipped, "Progress stream lagged");
          }
          Err(broadcast::error::RecvError::Closed) => return Ok(()),
        }
      }
    }
  }
}

async fn write_json<T: serde::Serialize>(
  writer: &mut tokio::net::unix::OwnedWriteHalf,
  value: &T,
) -> Result<(), ServerError> {
  let mut payload = serde_json::to_vec(value)?;
  payload.push(b'\n');
  writer.write_all(&payload).await?;
  Ok(())
}
