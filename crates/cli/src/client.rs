//! Socket client used by one-shot CLI commands.

use std::path::Path;

use anyhow::{Context, bail};
use ipc::{Method, ProgressEvent, Request, Response};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

pub struct DaemonClient {
  reader: BufReader<tokio::net::unix::OwnedReadHalf>,
  writer: tokio::net::unix::OwnedWriteHalf,
  next_id: u64,
}

impl DaemonClient {
  pub async fn connect(socket_path: &Path) -> anyhow::Result<Self> {
    let stream = UnixStream::connect(socket_path)
      .await
      .with_context(|| format!("no daemon at {} (start one with `lodestone daemon run`)", socket_path.display()))?;
    let (reader, writer) = stream.into_split();
    Ok(Self {
      reader: BufReader::new(reader),
      writer,
      next_id: 1,
    })
  }

  /// Send one request and wait for its response, surfacing progress events
  /// through `on_progress` meanwhile.
  pub async fn call_with_progress<P: Serialize>(
    &mut self,
    method: Method,
    params: P,
    mut on_progress: impl FnMut(ProgressEvent),
  ) -> anyhow::Result<Value> {
    let id = self.next_id;
    self.next_id += 1;

    let request = Request {
      id: Some(id),
      method,
      params: serde_json::to_value(params)?,
    };
    let mut payload = serde_json::to_vec(&request)?;
    payload.push(b'\n');
    self.writer.write_all(&payload).await?;

    let mut line = String::new();
    loop {
      line.clear();
      let read = self.reader.read_line(&mut line).await?;
      if read == 0 {
        bail!("daemon closed the connection");
      }
      let response: Response = serde_json::from_str(line.trim())?;

      if let Some(event) = response.progress {
        on_progress(event);
        continue;
      }
      if response.id != Some(id) {
        continue;
      }
      if let Some(error) = response.error {
        bail!("daemon error {}: {}", error.code, error.message);
      }
      return response.result.context("empty response");
    }
  }

  pub async fn call<P: Serialize>(&mut self, method: Method, params: P) -> anyhow::Result<Value> {
    self.call_with_progress(method, params, |_| {}).await
  }
}
