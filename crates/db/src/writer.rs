//! Single-writer queue in front of the vector store.
//!
//! Every mutation is a [`WriteTask`] drained serially by one background
//! task, so the backend handle has exactly one writer at a time and
//! delete-then-insert sequences serialize without backend transactions.
//! Transient failures retry with exponential backoff before propagating.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use lodestone_core::FileStatusRow;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::{ChunkRow, VectorStore};

const WRITE_RETRIES: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// One unit of serialized write work.
#[derive(Debug)]
pub enum WriteTask {
  DeleteByPath { path: String },
  InsertChunks { rows: Vec<ChunkRow> },
  UpsertStatus { row: Box<FileStatusRow> },
  DeleteStatus { path: String },
}

struct WriteRequest {
  task: WriteTask,
  ack: Option<oneshot::Sender<Result<(), String>>>,
}

type InvalidateHook = Arc<dyn Fn() + Send + Sync>;

/// Handle to the serializer task.
#[derive(Clone)]
pub struct WriteQueue {
  tx: mpsc::Sender<WriteRequest>,
  depth: Arc<AtomicUsize>,
}

impl WriteQueue {
  /// Spawn the serializer over `store`. `on_write` fires after every
  /// successful task (stats-cache invalidation).
  pub fn start(store: Arc<VectorStore>, on_write: Option<InvalidateHook>) -> Self {
    let (tx, mut rx) = mpsc::channel::<WriteRequest>(1024);
    let depth = Arc::new(AtomicUsize::new(0));

    let drain_depth = depth.clone();
    tokio::spawn(async move {
      debug!("Write queue serializer starting");
      while let Some(request) = rx.recv().await {
        let result = execute_with_retries(&store, &request.task).await;
        if result.is_ok()
          && let Some(hook) = &on_write
        {
          hook();
        }
        if let Err(ref message) = result {
          error!(message, "Write task failed permanently");
        }
        if let Some(ack) = request.ack {
          let _ = ack.send(result);
        }
        drain_depth.fetch_sub(1, Ordering::SeqCst);
      }
      debug!("Write queue serializer stopped");
    });

    Self { tx, depth }
  }

  /// Enqueue without waiting for completion.
  pub async fn submit(&self, task: WriteTask) {
    self.depth.fetch_add(1, Ordering::SeqCst);
    if self.tx.send(WriteRequest { task, ack: None }).await.is_err() {
      self.depth.fetch_sub(1, Ordering::SeqCst);
      warn!("Write queue closed; task dropped");
    }
  }

  /// Enqueue and wait for the task to commit.
  pub async fn submit_wait(&self, task: WriteTask) -> Result<(), String> {
    let (ack_tx, ack_rx) = oneshot::channel();
    self.depth.fetch_add(1, Ordering::SeqCst);
    if self
      .tx
      .send(WriteRequest {
        task,
        ack: Some(ack_tx),
      })
      .await
      .is_err()
    {
      self.depth.fetch_sub(1, Ordering::SeqCst);
      return Err("write queue closed".to_string());
    }
    ack_rx.await.unwrap_or_else(|_| Err("write queue dropped task".to_string()))
  }

  pub fn depth(&self) -> usize {
    self.depth.load(Ordering::SeqCst)
  }

  /// Wait for every enqueued task to finish.
  pub async fn drain(&self, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while self.depth() > 0 {
      if tokio::time::Instant::now() >= deadline {
        return false;
      }
      tokio::time::sleep(Duration::from_millis(20)).await;
    }
    true
  }
}

async fn execute_with_retries(store: &VectorStore, task: &WriteTask) -> Result<(), String> {
  let mut attempt = 0;
  loop {
    let result = execute(store, task).await;
    match result {
      Ok(()) => return Ok(()),
      Err(e) if e.is_transient() && attempt < WRITE_RETRIES => {
        let delay = RETRY_BASE_DELAY * 2u32.pow(attempt);
        warn!(attempt, error = %e, "Transient write failure, backing off");
        tokio::time::sleep(delay).await;
        attempt += 1;
      }
      Err(e) => return Err(e.to_string()),
    }
  }
}

async fn execute(store: &VectorStore, task: &WriteTask) -> crate::Result<()> {
  match task {
    WriteTask::DeleteByPath { path } => store.delete_chunks_by_path(path).await,
    WriteTask::InsertChunks { rows } => store.insert_chunks(rows.clone()).await,
    WriteTask::UpsertStatus { row } => store.upsert_status(row).await,
    WriteTask::DeleteStatus { path } => store.delete_status(path).await,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use lodestone_core::FileStatus;

  fn chunk(path: &str, index: u32) -> ChunkRow {
    ChunkRow {
      id: format!("{path}:{index}"),
      path: path.to_string(),
      title: "t".to_string(),
      page: 1,
      offset: 0,
      chunk_index: index,
      text: "text".to_string(),
      vector: vec![1.0, 0.0, 0.0, 0.0],
      mtime: 0,
      indexed_at: 0,
    }
  }

  #[tokio::test]
  async fn tasks_serialize_in_submission_order() {
    let tmp = tempfile::TempDir::new().unwrap();
    let store = Arc::new(VectorStore::open(&tmp.path().join("data"), 4).await.unwrap());
    let queue = WriteQueue::start(store.clone(), None);

    // delete → insert → status, exactly the per-file write sequence.
    queue
      .submit(WriteTask::DeleteByPath {
        path: "/docs/a.txt".into(),
      })
      .await;
    queue
      .submit(WriteTask::InsertChunks {
        rows: vec![chunk("/docs/a.txt", 0), chunk("/docs/a.txt", 1)],
      })
      .await;
    let status = FileStatusRow {
      path: "/docs/a.txt".into(),
      status: FileStatus::Indexed,
      parser_version: 1,
      chunk_count: 2,
      error_message: None,
      last_modified: 0,
      indexed_at: 0,
      last_retry: 0,
      file_hash: "h".into(),
    };
    queue
      .submit_wait(WriteTask::UpsertStatus { row: Box::new(status) })
      .await
      .unwrap();

    assert!(queue.drain(Duration::from_secs(5)).await);
    assert_eq!(store.chunks_for_path("/docs/a.txt").await.unwrap().len(), 2);
    assert_eq!(
      store.get_status("/docs/a.txt").await.unwrap().unwrap().chunk_count,
      2
    );
  }

  #[tokio::test]
  async fn reindex_sequence_replaces_rows() {
    let tmp = tempfile::TempDir::new().unwrap();
    let store = Arc::new(VectorStore::open(&tmp.path().join("data"), 4).await.unwrap());
    let queue = WriteQueue::start(store.clone(), None);

    queue
      .submit(WriteTask::InsertChunks {
        rows: vec![chunk("/docs/a.txt", 0), chunk("/docs/a.txt", 1), chunk("/docs/a.txt", 2)],
      })
      .await;
    queue.drain(Duration::from_secs(5)).await;

    // Re-index with fewer chunks: reader sees old set or new set, never both.
    queue
      .submit(WriteTask::DeleteByPath {
        path: "/docs/a.txt".into(),
      })
      .await;
    queue
      .submit_wait(WriteTask::InsertChunks {
        rows: vec![chunk("/docs/a.txt", 0)],
      })
      .await
      .unwrap();

    let rows = store.chunks_for_path("/docs/a.txt").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].chunk_index, 0);
  }

  #[tokio::test]
  async fn invalidation_hook_fires_per_write() {
    let tmp = tempfile::TempDir::new().unwrap();
    let store = Arc::new(VectorStore::open(&tmp.path().join("data"), 4).await.unwrap());
    let fired = Arc::new(AtomicUsize::new(0));
    let hook = {
      let fired = fired.clone();
      Arc::new(move || {
        fired.fetch_add(1, Ordering::SeqCst);
      }) as InvalidateHook
    };
    let queue = WriteQueue::start(store, Some(hook));

    queue
      .submit_wait(WriteTask::DeleteByPath { path: "/x".into() })
      .await
      .unwrap();
    queue
      .submit_wait(WriteTask::DeleteStatus { path: "/x".into() })
      .await
      .unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 2);
  }
}
