//! The file queue: bounded parse parallelism feeding the embedding queue.
//!
//! One consumer pops jobs (front-insertable so parser upgrades outrun new
//! work), parses at most `cpu_concurrency` files at a time on the blocking
//! pool, chunks the extracted text and hands chunks to the embedding queue,
//! which applies its own backpressure. Outcomes land in the file-status
//! ledger through the write queue.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, UNIX_EPOCH};

use chrono::Utc;
use db::{WriteQueue, WriteTask};
use embedding::EmbeddingQueue;
use ipc::ProgressEvent;
use lodestone_core::{ChunkMeta, FileStatus, FileStatusRow, file_fingerprint};
use parser::ParseError;
use tokio::sync::{Notify, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::chunker::{ChunkerConfig, chunk_text};
use crate::reindex::should_reindex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileJob {
  Index { path: PathBuf },
  Delete { path: PathBuf },
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
  /// Files parsed in parallel (0 = derive from hardware).
  pub cpu_concurrency: usize,
  pub chunker: ChunkerConfig,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      cpu_concurrency: 0,
      chunker: ChunkerConfig::default(),
    }
  }
}

impl PipelineConfig {
  fn effective_concurrency(&self) -> usize {
    if self.cpu_concurrency > 0 {
      self.cpu_concurrency
    } else {
      (num_cpus::get() / 2).max(1)
    }
  }
}

/// Shared progress counters for `progress` snapshots.
#[derive(Default)]
pub struct PipelineCounters {
  pub queued: AtomicU64,
  pub processing: AtomicU64,
  pub done: AtomicU64,
  pub errors: AtomicU64,
}

/// Cloneable enqueue handle used by the watcher and reindex service.
#[derive(Clone)]
pub struct PipelineHandle {
  jobs: Arc<Mutex<VecDeque<FileJob>>>,
  work: Arc<Notify>,
  counters: Arc<PipelineCounters>,
}

impl PipelineHandle {
  fn new(counters: Arc<PipelineCounters>) -> Self {
    Self {
      jobs: Arc::new(Mutex::new(VecDeque::new())),
      work: Arc::new(Notify::new()),
      counters,
    }
  }

  pub async fn enqueue(&self, job: FileJob) -> Result<(), String> {
    self.push(job, false);
    Ok(())
  }

  /// Prepend jobs so they run ahead of previously queued work.
  pub fn enqueue_front(&self, jobs: Vec<FileJob>) {
    for job in jobs.into_iter().rev() {
      self.push(job, true);
    }
  }

  fn push(&self, job: FileJob, front: bool) {
    {
      let mut jobs = self.jobs.lock().expect("file queue state");
      if front {
        jobs.push_front(job);
      } else {
        jobs.push_back(job);
      }
    }
    self.counters.queued.fetch_add(1, Ordering::SeqCst);
    self.work.notify_one();
  }

  fn pop(&self) -> Option<FileJob> {
    let job = self.jobs.lock().expect("file queue state").pop_front();
    if job.is_some() {
      self.counters.queued.fetch_sub(1, Ordering::SeqCst);
    }
    job
  }

  pub fn depth(&self) -> usize {
    self.jobs.lock().expect("file queue state").len()
  }
}

/// The file-queue consumer and per-file indexing logic.
pub struct FilePipeline {
  handle: PipelineHandle,
  store: Arc<db::VectorStore>,
  writes: WriteQueue,
  embed_queue: Arc<EmbeddingQueue>,
  config: PipelineConfig,
  semaphore: Arc<Semaphore>,
  counters: Arc<PipelineCounters>,
  progress_tx: Option<mpsc::Sender<ProgressEvent>>,
  paused: AtomicBool,
  file_seq: AtomicU64,
  in_flight: AtomicU64,
}

impl FilePipeline {
  pub fn new(
    store: Arc<db::VectorStore>,
    writes: WriteQueue,
    embed_queue: Arc<EmbeddingQueue>,
    config: PipelineConfig,
    progress_tx: Option<mpsc::Sender<ProgressEvent>>,
  ) -> Arc<Self> {
    let counters = Arc::new(PipelineCounters::default());
    let handle = PipelineHandle::new(counters.clone());
    let permits = config.effective_concurrency();

    Arc::new(Self {
      handle,
      store,
      writes,
      embed_queue,
      config,
      semaphore: Arc::new(Semaphore::new(permits)),
      counters,
      progress_tx,
      paused: AtomicBool::new(false),
      file_seq: AtomicU64::new(0),
      in_flight: AtomicU64::new(0),
    })
  }

  pub fn handle(&self) -> PipelineHandle {
    self.handle.clone()
  }

  pub fn counters(&self) -> &PipelineCounters {
    &self.counters
  }

  pub fn set_paused(&self, paused: bool) {
    self.paused.store(paused, Ordering::SeqCst);
    self.embed_queue.set_paused(paused);
    if !paused {
      self.handle.work.notify_one();
    }
  }

  pub fn is_paused(&self) -> bool {
    self.paused.load(Ordering::SeqCst)
  }

  /// Consumer loop; spawn once.
  pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
    info!(
      concurrency = self.config.effective_concurrency(),
      "File pipeline starting"
    );

    loop {
      if cancel.is_cancelled() {
        break;
      }
      if self.is_paused() {
        tokio::select! {
          biased;
          _ = cancel.cancelled() => break,
          _ = tokio::time::sleep(Duration::from_millis(100)) => continue,
        }
      }

      match self.handle.pop() {
        Some(FileJob::Delete { path }) => self.delete_file(&path).await,
        Some(FileJob::Index { path }) => {
          // Counted before the permit wait so drain() sees the job.
          self.in_flight.fetch_add(1, Ordering::SeqCst);
          let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
              self.in_flight.fetch_sub(1, Ordering::SeqCst);
              break;
            }
          };
          let pipeline = self.clone();
          tokio::spawn(async move {
            pipeline.counters.processing.fetch_add(1, Ordering::SeqCst);
            pipeline.index_file(&path).await;
            pipeline.counters.processing.fetch_sub(1, Ordering::SeqCst);
            pipeline.in_flight.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
          });
        }
        None => {
          tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = self.handle.work.notified() => {}
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
          }
        }
      }
    }

    debug!("File pipeline stopped");
  }

  /// Wait until the queue is empty and no file is mid-parse. Unbounded by
  /// design: shutdown wants every in-flight file finished.
  pub async fn drain(&self) {
    loop {
      if self.handle.depth() == 0 && self.in_flight.load(Ordering::SeqCst) == 0 {
        return;
      }
      tokio::time::sleep(Duration::from_millis(50)).await;
    }
  }

  async fn delete_file(&self, path: &Path) {
    let path_str = path.to_string_lossy().into_owned();
    debug!(path = %path_str, "Removing file from index");
    self
      .writes
      .submit(WriteTask::DeleteByPath {
        path: path_str.clone(),
      })
      .await;
    self.writes.submit(WriteTask::DeleteStatus { path: path_str }).await;
  }

  async fn index_file(&self, path: &Path) {
    let path_str = path.to_string_lossy().into_owned();

    let Ok(metadata) = std::fs::metadata(path) else {
      // Vanished between event and processing.
      self.delete_file(path).await;
      return;
    };
    let mtime = metadata
      .modified()
      .ok()
      .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
      .map(|d| d.as_millis() as i64)
      .unwrap_or(0);
    let file_hash = file_fingerprint(metadata.len(), mtime, &path_str);

    let extension = path
      .extension()
      .and_then(|e| e.to_str())
      .map(|e| e.to_ascii_lowercase())
      .unwrap_or_default();
    let parser_version = parser::current_parser_version(&extension);

    // Watcher bursts and rescans re-deliver unchanged files; skip them.
    let existing = self.store.get_status(&path_str).await.ok().flatten();
    if !should_reindex(
      existing.as_ref(),
      &file_hash,
      parser_version,
      Utc::now().timestamp_millis(),
    ) {
      trace!(path = %path_str, "Up to date, skipping");
      return;
    }

    let queued_row = FileStatusRow {
      path: path_str.clone(),
      status: FileStatus::Queued,
      parser_version,
      chunk_count: 0,
      error_message: None,
      last_modified: mtime,
      indexed_at: existing.as_ref().map(|r| r.indexed_at).unwrap_or(0),
      last_retry: Utc::now().timestamp_millis(),
      file_hash: file_hash.clone(),
    };
    self
      .writes
      .submit(WriteTask::UpsertStatus {
        row: Box::new(queued_row.clone()),
      })
      .await;

    // Parsers are synchronous CPU work.
    let parse_path = path.to_path_buf();
    let parsed = tokio::task::spawn_blocking(move || parser::parse_file(&parse_path)).await;
    let extracted = match parsed {
      Ok(Ok(extracted)) => extracted,
      Ok(Err(e)) => {
        self.record_parse_failure(queued_row, e).await;
        return;
      }
      Err(join_error) => {
        warn!(path = %path_str, error = %join_error, "Parser task panicked");
        self
          .record_parse_failure(queued_row, ParseError::corrupt("parser", "parser task panicked"))
          .await;
        return;
      }
    };

    // Chunk page by page; chunk_index runs across the whole file.
    let file_index = self.file_seq.fetch_add(1, Ordering::SeqCst);
    let mut chunks: Vec<(String, ChunkMeta)> = Vec::new();
    for page in &extracted.pages {
      for chunk in chunk_text(&page.text, &self.config.chunker) {
        let chunk_index = chunks.len() as u32;
        chunks.push((
          chunk.text,
          ChunkMeta {
            path: path_str.clone(),
            page: page.number,
            offset: chunk.offset,
            chunk_index,
            file_index,
            mtime,
          },
        ));
      }
    }
    let total = chunks.len();

    if total == 0 {
      self.record_parse_failure(queued_row, ParseError::Empty).await;
      return;
    }

    // Old rows go first so a reader sees the old set or the new set.
    self
      .writes
      .submit(WriteTask::DeleteByPath {
        path: path_str.clone(),
      })
      .await;

    let handle = self.embed_queue.add_chunks(chunks, &path_str, file_index).await;
    let outcome = match handle.await {
      Ok(outcome) => outcome,
      Err(_) => {
        warn!(path = %path_str, "Embedding tracker dropped");
        self.finish_file(queued_row, FileStatus::Error, 0, Some("embedding aborted".into())).await;
        return;
      }
    };

    self.emit(ProgressEvent::File {
      path: path_str.clone(),
      chunks_done: outcome.embedded as u32,
      chunks_total: total as u32,
    });

    if outcome.embedded > 0 {
      let message = (!outcome.errors.is_empty()).then(|| outcome.errors.join("; "));
      self
        .finish_file(queued_row, FileStatus::Indexed, outcome.embedded as u32, message)
        .await;
    } else {
      let message = Some(if outcome.errors.is_empty() {
        "all chunks dropped".to_string()
      } else {
        outcome.errors.join("; ")
      });
      self.finish_file(queued_row, FileStatus::Error, 0, message).await;
    }
  }

  async fn record_parse_failure(&self, row: FileStatusRow, error: ParseError) {
    let status = match error {
      ParseError::Io(_) => FileStatus::Error,
      _ => FileStatus::Failed,
    };
    debug!(path = %row.path, error = %error, "Parse failed");
    self.finish_file(row, status, 0, Some(error.to_string())).await;
  }

  async fn finish_file(&self, mut row: FileStatusRow, status: FileStatus, chunk_count: u32, message: Option<String>) {
    row.status = status;
    row.chunk_count = chunk_count;
    row.error_message = message;
    if status == FileStatus::Indexed {
      row.indexed_at = Utc::now().timestamp_millis();
      self.counters.done.fetch_add(1, Ordering::SeqCst);
    } else {
      self.counters.errors.fetch_add(1, Ordering::SeqCst);
    }
    self.writes.submit(WriteTask::UpsertStatus { row: Box::new(row) }).await;
  }

  fn emit(&self, event: ProgressEvent) {
    if let Some(tx) = &self.progress_tx {
      let _ = tx.try_send(event);
    }
  }
}

/// Title shown in search results: file name without extension.
pub fn title_for_path(path: &Path) -> String {
  path
    .file_stem()
    .map(|stem| stem.to_string_lossy().into_owned())
    .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
