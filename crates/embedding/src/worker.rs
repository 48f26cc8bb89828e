//! Host-side handle to one embedder worker process.
//!
//! The worker is a child process speaking length-prefixed JSON frames over
//! stdin/stdout. Requests carry monotonic ids; a reader task routes replies
//! back to the matching waiter. Loss of the pipe or a dead child fails every
//! in-flight request with `WorkerCrash`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use ipc::{WorkerReply, WorkerRequest};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, warn};

use crate::EmbedError;

/// How one worker process is spawned and driven.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
  /// Path to the `lodestone-embed-worker` binary.
  pub binary: PathBuf,
  pub model_name: String,
  /// Model artifact cache (`<user_data>/models`).
  pub cache_dir: PathBuf,
  pub request_timeout: Duration,
}

impl WorkerConfig {
  /// Locate the worker binary next to the current executable, honoring the
  /// `LODESTONE_WORKER_BIN` override.
  pub fn locate_binary() -> PathBuf {
    if let Ok(path) = std::env::var("LODESTONE_WORKER_BIN") {
      return PathBuf::from(path);
    }
    let name = if cfg!(windows) {
      "lodestone-embed-worker.exe"
    } else {
      "lodestone-embed-worker"
    };
    std::env::current_exe()
      .ok()
      .and_then(|exe| exe.parent().map(|dir| dir.join(name)))
      .unwrap_or_else(|| PathBuf::from(name))
  }
}

/// Unsolicited worker traffic surfaced to the daemon.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
  DownloadProgress { loaded: u64, total: u64 },
  Fatal { worker_index: usize, message: String },
}

struct Shared {
  ready: AtomicBool,
  exited: AtomicBool,
  dim: AtomicUsize,
  next_id: AtomicU64,
  pending: Mutex<HashMap<u64, oneshot::Sender<WorkerReply>>>,
  child: Mutex<Child>,
}

/// Cloneable handle to one worker process.
#[derive(Clone)]
pub struct WorkerHandle {
  tx: mpsc::Sender<WorkerRequest>,
  shared: Arc<Shared>,
  request_timeout: Duration,
}

impl WorkerHandle {
  /// Spawn the child, send `init` and start the reader/monitor tasks.
  ///
  /// Returns before the model is loaded; `is_ready()` flips when the worker
  /// reports `ready`.
  pub fn spawn(config: &WorkerConfig, events: mpsc::Sender<WorkerEvent>, worker_index: usize) -> Result<Self, EmbedError> {
    let mut child = Command::new(&config.binary)
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .stderr(Stdio::inherit())
      .kill_on_drop(true)
      .spawn()
      .map_err(|e| EmbedError::Spawn(e.to_string()))?;

    let stdin = child.stdin.take().ok_or_else(|| EmbedError::Spawn("no stdin pipe".into()))?;
    let stdout = child
      .stdout
      .take()
      .ok_or_else(|| EmbedError::Spawn("no stdout pipe".into()))?;

    let shared = Arc::new(Shared {
      ready: AtomicBool::new(false),
      exited: AtomicBool::new(false),
      dim: AtomicUsize::new(0),
      next_id: AtomicU64::new(1),
      pending: Mutex::new(HashMap::new()),
      child: Mutex::new(child),
    });

    let (tx, mut rx) = mpsc::channel::<WorkerRequest>(64);

    // Writer task: serialize requests onto the child's stdin.
    let mut sink = FramedWrite::new(stdin, LengthDelimitedCodec::new());
    tokio::spawn(async move {
      while let Some(request) = rx.recv().await {
        let bytes = match serde_json::to_vec(&request) {
          Ok(b) => b,
          Err(e) => {
            warn!(error = %e, "Failed to serialize worker request");
            continue;
          }
        };
        if sink.send(bytes.into()).await.is_err() {
          break;
        }
      }
    });

    // Reader task: route replies to waiters, surface events.
    let reader_shared = shared.clone();
    let mut stream = FramedRead::new(stdout, LengthDelimitedCodec::new());
    tokio::spawn(async move {
      while let Some(frame) = stream.next().await {
        let frame = match frame {
          Ok(f) => f,
          Err(e) => {
            warn!(worker_index, error = %e, "Worker frame error");
            break;
          }
        };
        let reply: WorkerReply = match serde_json::from_slice(&frame) {
          Ok(r) => r,
          Err(e) => {
            warn!(worker_index, error = %e, "Undecodable worker frame");
            continue;
          }
        };

        if let Some(id) = reply_id(&reply) {
          let waiter = reader_shared.pending.lock().await.remove(&id);
          if let Some(waiter) = waiter {
            let _ = waiter.send(reply);
          } else {
            debug!(worker_index, id, "Reply for unknown request id");
          }
          continue;
        }

        match reply {
          WorkerReply::Ready { dim } => {
            reader_shared.dim.store(dim, Ordering::SeqCst);
            reader_shared.ready.store(true, Ordering::SeqCst);
            debug!(worker_index, dim, "Worker ready");
          }
          WorkerReply::DownloadProgress { loaded, total } => {
            let _ = events.try_send(WorkerEvent::DownloadProgress { loaded, total });
          }
          WorkerReply::Fatal { message } => {
            warn!(worker_index, message, "Worker reported fatal error");
            let _ = events.try_send(WorkerEvent::Fatal {
              worker_index,
              message,
            });
          }
          _ => {}
        }
      }

      // Pipe closed: the worker is gone. Drop all waiters so in-flight
      // requests fail fast instead of timing out.
      reader_shared.ready.store(false, Ordering::SeqCst);
      reader_shared.exited.store(true, Ordering::SeqCst);
      reader_shared.pending.lock().await.clear();
    });

    let handle = Self {
      tx,
      shared,
      request_timeout: config.request_timeout,
    };
    handle.send_fire_and_forget(WorkerRequest::Init {
      model_name: config.model_name.clone(),
      cache_dir: config.cache_dir.to_string_lossy().into_owned(),
    });
    Ok(handle)
  }

  fn send_fire_and_forget(&self, request: WorkerRequest) {
    let tx = self.tx.clone();
    tokio::spawn(async move {
      let _ = tx.send(request).await;
    });
  }

  pub fn is_ready(&self) -> bool {
    self.shared.ready.load(Ordering::SeqCst) && !self.has_exited()
  }

  pub fn has_exited(&self) -> bool {
    self.shared.exited.load(Ordering::SeqCst)
  }

  /// Vector dimension reported by `ready` (0 until then).
  pub fn dim(&self) -> usize {
    self.shared.dim.load(Ordering::SeqCst)
  }

  async fn request(&self, id: u64, request: WorkerRequest) -> Result<WorkerReply, EmbedError> {
    let (reply_tx, reply_rx) = oneshot::channel();
    self.shared.pending.lock().await.insert(id, reply_tx);

    if self.tx.send(request).await.is_err() {
      self.shared.pending.lock().await.remove(&id);
      return Err(EmbedError::WorkerCrash("worker channel closed".into()));
    }

    match tokio::time::timeout(self.request_timeout, reply_rx).await {
      Ok(Ok(reply)) => Ok(reply),
      Ok(Err(_)) => Err(EmbedError::WorkerCrash("worker exited mid-request".into())),
      Err(_) => {
        self.shared.pending.lock().await.remove(&id);
        Err(EmbedError::Timeout)
      }
    }
  }

  /// Embed a batch of texts. Vectors come back L2-normalized.
  pub async fn embed(&self, texts: Vec<String>, is_query: bool) -> Result<Vec<Vec<f32>>, EmbedError> {
    let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
    let expected = texts.len();
    match self.request(id, WorkerRequest::Embed { id, texts, is_query }).await? {
      WorkerReply::EmbedOk { vectors, .. } => {
        if vectors.len() != expected {
          return Err(EmbedError::Protocol(format!(
            "expected {expected} vectors, got {}",
            vectors.len()
          )));
        }
        Ok(vectors)
      }
      WorkerReply::EmbedErr { message, .. } => Err(EmbedError::Protocol(message)),
      other => Err(EmbedError::Protocol(format!("unexpected reply: {other:?}"))),
    }
  }

  /// Sample the worker's resident memory and lifetime file count.
  pub async fn health(&self) -> Result<(u64, u64), EmbedError> {
    let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
    match self.request(id, WorkerRequest::Health { id }).await? {
      WorkerReply::HealthOk {
        rss_bytes,
        files_processed,
        ..
      } => Ok((rss_bytes, files_processed)),
      other => Err(EmbedError::Protocol(format!("unexpected reply: {other:?}"))),
    }
  }

  /// Ask the worker to exit; force-kill after `grace`.
  pub async fn shutdown(&self, grace: Duration) {
    self.send_fire_and_forget(WorkerRequest::Shutdown);

    let deadline = tokio::time::Instant::now() + grace;
    loop {
      if self.try_reap().await {
        return;
      }
      if tokio::time::Instant::now() >= deadline {
        break;
      }
      tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let mut child = self.shared.child.lock().await;
    if let Err(e) = child.start_kill() {
      debug!(error = %e, "Worker kill failed (already gone)");
    }
    self.shared.exited.store(true, Ordering::SeqCst);
    self.shared.ready.store(false, Ordering::SeqCst);
  }

  /// Non-blocking reap; true when the child has exited.
  pub async fn try_reap(&self) -> bool {
    if self.shared.exited.load(Ordering::SeqCst) {
      return true;
    }
    let mut child = self.shared.child.lock().await;
    match child.try_wait() {
      Ok(Some(status)) => {
        debug!(code = status.code().unwrap_or(-1), "Worker exited");
        self.shared.exited.store(true, Ordering::SeqCst);
        self.shared.ready.store(false, Ordering::SeqCst);
        true
      }
      Ok(None) => false,
      Err(_) => true,
    }
  }
}

fn reply_id(reply: &WorkerReply) -> Option<u64> {
  match reply {
    WorkerReply::EmbedOk { id, .. } | WorkerReply::EmbedErr { id, .. } | WorkerReply::HealthOk { id, .. } => Some(*id),
    _ => None,
  }
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;

  fn config(binary: &str) -> WorkerConfig {
    WorkerConfig {
      binary: PathBuf::from(binary),
      model_name: "test-model".to_string(),
      cache_dir: PathBuf::from("/tmp"),
      request_timeout: Duration::from_millis(500),
    }
  }

  #[tokio::test]
  async fn missing_binary_fails_to_spawn() {
    let (events_tx, _events_rx) = mpsc::channel(4);
    let result = WorkerHandle::spawn(&config("/definitely/not/a/binary"), events_tx, 0);
    assert!(matches!(result, Err(EmbedError::Spawn(_))));
  }

  #[tokio::test]
  async fn exited_child_is_reaped_and_never_ready() {
    let (events_tx, _events_rx) = mpsc::channel(4);
    // `true` exits immediately without speaking the protocol.
    let handle = WorkerHandle::spawn(&config("/bin/true"), events_tx, 0).unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !handle.try_reap().await {
      assert!(tokio::time::Instant::now() < deadline, "child never reaped");
      tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(handle.has_exited());
    assert!(!handle.is_ready());
  }

  #[tokio::test]
  async fn embed_on_dead_worker_errors() {
    let (events_tx, _events_rx) = mpsc::channel(4);
    let handle = WorkerHandle::spawn(&config("/bin/true"), events_tx, 0).unwrap();

    while !handle.try_reap().await {
      tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let result = handle.embed(vec!["text".to_string()], false).await;
    assert!(result.is_err());
  }
}
