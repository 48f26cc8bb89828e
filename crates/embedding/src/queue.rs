//! The bounded embedding queue.
//!
//! One FIFO of chunks feeds the worker pool. The consumer forms dynamic
//! batches by token estimate, tracks in-flight batches per worker, retries
//! failed batches at the front of the queue and recovers batches stranded by
//! a worker restart. Producers suspend when the queue is full.
//!
//! Bookkeeping invariants, all maintained under one lock:
//! - `processing_batches == active_batches.len()` at every stable point
//! - a chunk is in `queue`, in an active batch, or counted in its tracker
//! - a tracker's `processed` only grows and never exceeds `total`
//! - a file's completion handle resolves exactly once

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lodestone_core::{ChunkMeta, estimate_tokens};
use tokio::sync::{Notify, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::{EmbedError, Embedder};

#[derive(Debug, Clone)]
pub struct QueueConfig {
  /// Queue capacity in chunks; producers suspend at or above this depth.
  pub max_queue_size: usize,
  pub max_concurrent_batches: usize,
  /// Estimated-token budget per batch.
  pub max_tokens_per_batch: usize,
  /// Chunk-count limit per batch.
  pub max_batch_len: usize,
  pub max_retries: u32,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      max_queue_size: 2000,
      max_concurrent_batches: 2,
      max_tokens_per_batch: 8000,
      max_batch_len: 32,
      max_retries: 3,
    }
  }
}

/// One chunk waiting to be embedded.
#[derive(Debug, Clone)]
pub struct QueuedChunk {
  pub text: String,
  pub meta: ChunkMeta,
  pub retry_count: u32,
}

/// A chunk with its vector, handed to the write path.
#[derive(Debug, Clone)]
pub struct EmbeddedChunk {
  pub text: String,
  pub meta: ChunkMeta,
  pub vector: Vec<f32>,
}

/// The injected write path. Implemented over the vector store's write queue.
#[async_trait]
pub trait BatchSink: Send + Sync {
  async fn store(&self, chunks: Vec<EmbeddedChunk>) -> Result<(), String>;
}

/// Final accounting for one file.
#[derive(Debug, Clone)]
pub struct FileOutcome {
  pub total: usize,
  pub embedded: usize,
  pub dropped: usize,
  pub errors: Vec<String>,
}

/// Resolves when every chunk of the file is embedded or dropped.
pub type FileHandle = oneshot::Receiver<FileOutcome>;

/// Counters for progress reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
  pub queued: usize,
  pub processing_batches: usize,
  pub files_in_flight: usize,
  pub files_done: u64,
  pub errors: u64,
  pub paused: bool,
}

struct FileTracker {
  total: usize,
  processed: usize,
  embedded: usize,
  dropped: usize,
  errors: Vec<String>,
  done_tx: Option<oneshot::Sender<FileOutcome>>,
}

struct ActiveBatch {
  chunks: Vec<QueuedChunk>,
  worker_index: Option<usize>,
  /// Embed finished, write in progress: no longer recoverable.
  storing: bool,
}

#[derive(Default)]
struct State {
  queue: VecDeque<QueuedChunk>,
  trackers: HashMap<String, FileTracker>,
  active_batches: HashMap<u64, ActiveBatch>,
  processing_batches: usize,
  next_batch_id: u64,
  files_done: u64,
  errors_total: u64,
  paused: bool,
}

type CompletionCallback = Arc<dyn Fn(&str, &FileOutcome) + Send + Sync>;

pub struct EmbeddingQueue {
  config: QueueConfig,
  state: Mutex<State>,
  /// Producers wait here for queue space.
  space: Notify,
  /// The consumer waits here for work or freed batch slots.
  work: Notify,
  embedder: Arc<dyn Embedder>,
  sink: Arc<dyn BatchSink>,
  on_file_complete: std::sync::RwLock<Option<CompletionCallback>>,
}

impl EmbeddingQueue {
  pub fn new(config: QueueConfig, embedder: Arc<dyn Embedder>, sink: Arc<dyn BatchSink>) -> Arc<Self> {
    Arc::new(Self {
      config,
      state: Mutex::new(State::default()),
      space: Notify::new(),
      work: Notify::new(),
      embedder,
      sink,
      on_file_complete: std::sync::RwLock::new(None),
    })
  }

  pub fn set_on_file_complete(&self, callback: CompletionCallback) {
    *self.on_file_complete.write().expect("completion callback lock") = Some(callback);
  }

  pub fn snapshot(&self) -> QueueSnapshot {
    let state = self.state.lock().expect("queue state");
    QueueSnapshot {
      queued: state.queue.len(),
      processing_batches: state.processing_batches,
      files_in_flight: state.trackers.len(),
      files_done: state.files_done,
      errors: state.errors_total,
      paused: state.paused,
    }
  }

  pub fn set_paused(&self, paused: bool) {
    self.state.lock().expect("queue state").paused = paused;
    if !paused {
      self.work.notify_one();
    }
  }

  /// Register a file and enqueue its chunks, suspending on backpressure.
  ///
  /// The returned handle resolves once every chunk is accounted for. A file
  /// with zero chunks resolves immediately.
  pub async fn add_chunks(&self, chunks: Vec<(String, ChunkMeta)>, path: &str, _file_index: u64) -> FileHandle {
    let (done_tx, done_rx) = oneshot::channel();
    let total = chunks.len();

    {
      let mut state = self.state.lock().expect("queue state");
      if total == 0 {
        let _ = done_tx.send(FileOutcome {
          total: 0,
          embedded: 0,
          dropped: 0,
          errors: Vec::new(),
        });
        state.files_done += 1;
        return done_rx;
      }
      // The file queue sends one run per path at a time; a replaced tracker
      // would mean its previous handle never resolves, so keep the newest.
      if state.trackers.contains_key(path) {
        warn!(path, "Replacing unfinished tracker for re-queued file");
      }
      state.trackers.insert(
        path.to_string(),
        FileTracker {
          total,
          processed: 0,
          embedded: 0,
          dropped: 0,
          errors: Vec::new(),
          done_tx: Some(done_tx),
        },
      );
    }

    for (text, meta) in chunks {
      loop {
        let notified = self.space.notified();
        {
          let mut state = self.state.lock().expect("queue state");
          if state.queue.len() < self.config.max_queue_size {
            state.queue.push_back(QueuedChunk {
              text,
              meta,
              retry_count: 0,
            });
            break;
          }
        }
        notified.await;
        continue;
      }
      self.work.notify_one();
    }

    done_rx
  }

  /// Consumer loop. Spawn once; runs until `cancel` fires.
  pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
    debug!(
      max_queue_size = self.config.max_queue_size,
      max_concurrent_batches = self.config.max_concurrent_batches,
      "Embedding queue consumer starting"
    );

    loop {
      let batch = self.form_batch();
      match batch {
        Some((batch_id, texts)) => {
          let queue = self.clone();
          tokio::spawn(async move {
            queue.process_batch(batch_id, texts).await;
          });
        }
        None => {
          tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = self.work.notified() => {}
            // Guard against lost wakeups.
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
          }
        }
      }
      if cancel.is_cancelled() {
        break;
      }
    }

    debug!("Embedding queue consumer stopped");
  }

  /// Greedily take chunks from the front within the token and count budgets.
  /// Always takes at least one chunk. Returns `None` when idle or saturated.
  fn form_batch(&self) -> Option<(u64, Vec<String>)> {
    let mut state = self.state.lock().expect("queue state");
    if state.paused || state.queue.is_empty() || state.processing_batches >= self.config.max_concurrent_batches {
      return None;
    }

    let first = state.queue.pop_front()?;
    let mut tokens = estimate_tokens(&first.text);
    let mut chunks = vec![first];

    while chunks.len() < self.config.max_batch_len {
      let Some(next) = state.queue.front() else { break };
      let next_tokens = estimate_tokens(&next.text);
      if tokens + next_tokens > self.config.max_tokens_per_batch {
        break;
      }
      tokens += next_tokens;
      chunks.push(state.queue.pop_front().expect("front checked"));
    }

    let batch_id = state.next_batch_id;
    state.next_batch_id += 1;
    let texts = chunks.iter().map(|c| c.text.clone()).collect();
    state.active_batches.insert(
      batch_id,
      ActiveBatch {
        chunks,
        worker_index: None,
        storing: false,
      },
    );
    state.processing_batches += 1;
    trace!(batch_id, tokens, "Formed embedding batch");

    // Chunks left the queue; wake suspended producers.
    self.space.notify_waiters();
    Some((batch_id, texts))
  }

  async fn process_batch(&self, batch_id: u64, texts: Vec<String>) {
    let on_assign = move |worker_index: usize| {
      let mut state = self.state.lock().expect("queue state");
      if let Some(batch) = state.active_batches.get_mut(&batch_id) {
        batch.worker_index = Some(worker_index);
      }
    };

    match self.embedder.embed_batch(texts, false, &on_assign).await {
      Ok(vectors) => {
        // Freeze the batch against restart recovery before writing.
        let chunks = {
          let mut state = self.state.lock().expect("queue state");
          let Some(batch) = state.active_batches.get_mut(&batch_id) else {
            // Recovered while embedding; the chunks are back in the queue.
            return;
          };
          batch.storing = true;
          batch.chunks.clone()
        };

        let embedded: Vec<EmbeddedChunk> = chunks
          .iter()
          .zip(vectors)
          .map(|(chunk, vector)| EmbeddedChunk {
            text: chunk.text.clone(),
            meta: chunk.meta.clone(),
            vector,
          })
          .collect();

        match self.sink.store(embedded).await {
          Ok(()) => self.finish_batch(batch_id, None),
          Err(message) => self.finish_batch(batch_id, Some(message)),
        }
      }
      Err(e) => self.finish_batch(batch_id, Some(e.to_string())),
    }
  }

  /// Success, retry or drop; always restores `processing_batches == |active|`.
  fn finish_batch(&self, batch_id: u64, failure: Option<String>) {
    let mut completions: Vec<(String, FileOutcome)> = Vec::new();
    {
      let mut state = self.state.lock().expect("queue state");
      let Some(mut batch) = state.active_batches.remove(&batch_id) else {
        // Already recovered after a worker restart.
        return;
      };
      state.processing_batches -= 1;

      match failure {
        None => {
          for chunk in &batch.chunks {
            record_processed(&mut state, &chunk.meta.path, None, &mut completions);
          }
        }
        Some(message) => {
          let retryable = batch.chunks.iter().all(|c| c.retry_count < self.config.max_retries);
          if retryable {
            debug!(batch_id, message, "Retrying failed batch at queue front");
            for chunk in batch.chunks.iter_mut() {
              chunk.retry_count += 1;
            }
            // Prepend in reverse so in-batch order survives.
            for chunk in batch.chunks.into_iter().rev() {
              state.queue.push_front(chunk);
            }
          } else {
            error!(batch_id, message, chunks = batch.chunks.len(), "Dropping batch after max retries");
            state.errors_total += batch.chunks.len() as u64;
            for chunk in &batch.chunks {
              record_processed(&mut state, &chunk.meta.path, Some(message.clone()), &mut completions);
            }
          }
        }
      }
    }

    for (path, outcome) in completions {
      let callback = self.on_file_complete.read().expect("completion callback lock").clone();
      if let Some(callback) = callback {
        callback(&path, &outcome);
      }
    }
    self.work.notify_one();
  }

  /// Restart recovery: requeue every non-storing batch assigned to
  /// `worker_index` (or not yet assigned) at the queue front.
  ///
  /// Without this a restart would leak `processing_batches` and deadlock the
  /// consumer at the concurrency ceiling.
  pub fn recover_worker(&self, worker_index: usize) {
    let mut state = self.state.lock().expect("queue state");
    let ids: Vec<u64> = state
      .active_batches
      .iter()
      .filter(|(_, batch)| !batch.storing && batch.worker_index.is_none_or(|w| w == worker_index))
      .map(|(id, _)| *id)
      .collect();

    if ids.is_empty() {
      return;
    }
    warn!(worker_index, batches = ids.len(), "Recovering batches from restarted worker");

    for id in ids {
      let batch = state.active_batches.remove(&id).expect("id collected under lock");
      state.processing_batches -= 1;
      for chunk in batch.chunks.into_iter().rev() {
        state.queue.push_front(chunk);
      }
    }
    drop(state);
    self.work.notify_one();
  }

  /// Wait for the queue and all in-flight batches to drain.
  pub async fn drain(&self, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
      {
        let state = self.state.lock().expect("queue state");
        if state.queue.is_empty() && state.processing_batches == 0 {
          return true;
        }
      }
      if tokio::time::Instant::now() >= deadline {
        return false;
      }
      tokio::time::sleep(Duration::from_millis(25)).await;
    }
  }

  #[cfg(test)]
  fn assert_invariants(&self) {
    let state = self.state.lock().expect("queue state");
    assert_eq!(
      state.processing_batches,
      state.active_batches.len(),
      "processing_batches must equal |active_batches|"
    );
    for (path, tracker) in &state.trackers {
      assert!(tracker.processed <= tracker.total, "tracker overflow for {path}");
    }
  }
}

/// Account one chunk against its tracker; collect finished files.
fn record_processed(state: &mut State, path: &str, error: Option<String>, completions: &mut Vec<(String, FileOutcome)>) {
  let Some(tracker) = state.trackers.get_mut(path) else {
    warn!(path, "Chunk completed for unknown tracker");
    return;
  };

  tracker.processed += 1;
  match error {
    None => tracker.embedded += 1,
    Some(message) => {
      tracker.dropped += 1;
      if tracker.errors.last() != Some(&message) {
        tracker.errors.push(message);
      }
    }
  }

  if tracker.processed >= tracker.total {
    let mut tracker = state.trackers.remove(path).expect("tracker present");
    state.files_done += 1;
    let outcome = FileOutcome {
      total: tracker.total,
      embedded: tracker.embedded,
      dropped: tracker.dropped,
      errors: std::mem::take(&mut tracker.errors),
    };
    if let Some(done_tx) = tracker.done_tx.take() {
      let _ = done_tx.send(outcome.clone());
    }
    completions.push((path.to_string(), outcome));
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn meta(path: &str, index: u32) -> ChunkMeta {
    ChunkMeta {
      path: path.to_string(),
      page: 1,
      offset: index * 100,
      chunk_index: index,
      file_index: 0,
      mtime: 0,
    }
  }

  fn chunks(path: &str, count: usize) -> Vec<(String, ChunkMeta)> {
    (0..count)
      .map(|i| (format!("chunk {i} of {path} with some words"), meta(path, i as u32)))
      .collect()
  }

  /// Deterministic embedder: fails the first `fail_first` calls, then
  /// returns unit vectors. Always assigns worker 0.
  struct FakeEmbedder {
    fail_first: AtomicUsize,
    calls: AtomicUsize,
  }

  impl FakeEmbedder {
    fn new(fail_first: usize) -> Arc<Self> {
      Arc::new(Self {
        fail_first: AtomicUsize::new(fail_first),
        calls: AtomicUsize::new(0),
      })
    }
  }

  #[async_trait]
  impl Embedder for FakeEmbedder {
    async fn embed_batch(
      &self,
      texts: Vec<String>,
      _is_query: bool,
      on_assign: &(dyn Fn(usize) + Send + Sync),
    ) -> Result<Vec<Vec<f32>>, EmbedError> {
      on_assign(0);
      self.calls.fetch_add(1, Ordering::SeqCst);
      if self.fail_first.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
        return Err(EmbedError::WorkerCrash("synthetic crash".into()));
      }
      Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
    }
  }

  #[derive(Default)]
  struct RecordingSink {
    batches: Mutex<Vec<Vec<EmbeddedChunk>>>,
  }

  #[async_trait]
  impl BatchSink for RecordingSink {
    async fn store(&self, chunks: Vec<EmbeddedChunk>) -> Result<(), String> {
      self.batches.lock().unwrap().push(chunks);
      Ok(())
    }
  }

  fn small_config() -> QueueConfig {
    QueueConfig {
      max_queue_size: 64,
      max_concurrent_batches: 2,
      max_tokens_per_batch: 8000,
      max_batch_len: 8,
      max_retries: 3,
    }
  }

  #[tokio::test]
  async fn file_completes_and_chunks_are_stored() {
    let sink = Arc::new(RecordingSink::default());
    let queue = EmbeddingQueue::new(small_config(), FakeEmbedder::new(0), sink.clone());
    let cancel = CancellationToken::new();
    tokio::spawn(queue.clone().run(cancel.clone()));

    let handle = queue.add_chunks(chunks("/docs/a.txt", 5), "/docs/a.txt", 0).await;
    let outcome = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();

    assert_eq!(outcome.total, 5);
    assert_eq!(outcome.embedded, 5);
    assert_eq!(outcome.dropped, 0);

    assert!(queue.drain(Duration::from_secs(1)).await);
    queue.assert_invariants();
    assert_eq!(queue.snapshot().processing_batches, 0);

    let stored: usize = sink.batches.lock().unwrap().iter().map(|b| b.len()).sum();
    assert_eq!(stored, 5);
    cancel.cancel();
  }

  #[tokio::test]
  async fn completion_callback_fires_once_per_file() {
    let queue = EmbeddingQueue::new(small_config(), FakeEmbedder::new(0), Arc::new(RecordingSink::default()));
    let fired = Arc::new(AtomicUsize::new(0));
    {
      let fired = fired.clone();
      queue.set_on_file_complete(Arc::new(move |path, outcome| {
        assert_eq!(path, "/docs/cb.txt");
        assert_eq!(outcome.total, 3);
        fired.fetch_add(1, Ordering::SeqCst);
      }));
    }
    let cancel = CancellationToken::new();
    tokio::spawn(queue.clone().run(cancel.clone()));

    let handle = queue.add_chunks(chunks("/docs/cb.txt", 3), "/docs/cb.txt", 0).await;
    tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    cancel.cancel();
  }

  #[tokio::test]
  async fn zero_chunk_file_resolves_immediately() {
    let queue = EmbeddingQueue::new(small_config(), FakeEmbedder::new(0), Arc::new(RecordingSink::default()));
    let handle = queue.add_chunks(Vec::new(), "/docs/empty.txt", 0).await;
    let outcome = handle.await.unwrap();
    assert_eq!(outcome.total, 0);
  }

  #[tokio::test]
  async fn batches_respect_token_budget() {
    let sink = Arc::new(RecordingSink::default());
    let config = QueueConfig {
      max_tokens_per_batch: 100,
      max_batch_len: 32,
      ..small_config()
    };
    let queue = EmbeddingQueue::new(config.clone(), FakeEmbedder::new(0), sink.clone());
    let cancel = CancellationToken::new();
    tokio::spawn(queue.clone().run(cancel.clone()));

    // 40 tokens each: at most two per batch under a 100-token budget.
    let big = (0..10)
      .map(|i| ("x".repeat(160), meta("/docs/big.txt", i)))
      .collect::<Vec<_>>();
    let handle = queue.add_chunks(big, "/docs/big.txt", 0).await;
    tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();

    for batch in sink.batches.lock().unwrap().iter() {
      let tokens: usize = batch.iter().map(|c| estimate_tokens(&c.text)).sum();
      assert!(
        batch.len() == 1 || tokens <= config.max_tokens_per_batch,
        "batch of {} chunks with {tokens} tokens",
        batch.len()
      );
    }
    cancel.cancel();
  }

  #[tokio::test]
  async fn transient_failures_are_retried() {
    let sink = Arc::new(RecordingSink::default());
    let embedder = FakeEmbedder::new(2);
    let queue = EmbeddingQueue::new(small_config(), embedder.clone(), sink.clone());
    let cancel = CancellationToken::new();
    tokio::spawn(queue.clone().run(cancel.clone()));

    let handle = queue.add_chunks(chunks("/docs/retry.txt", 4), "/docs/retry.txt", 0).await;
    let outcome = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();

    assert_eq!(outcome.embedded, 4);
    assert_eq!(outcome.dropped, 0);
    assert!(embedder.calls.load(Ordering::SeqCst) >= 3);
    queue.assert_invariants();
    cancel.cancel();
  }

  #[tokio::test]
  async fn exhausted_retries_drop_the_batch_but_complete_the_file() {
    let sink = Arc::new(RecordingSink::default());
    let queue = EmbeddingQueue::new(small_config(), FakeEmbedder::new(usize::MAX), sink.clone());
    let cancel = CancellationToken::new();
    tokio::spawn(queue.clone().run(cancel.clone()));

    let handle = queue.add_chunks(chunks("/docs/doomed.txt", 3), "/docs/doomed.txt", 0).await;
    let outcome = tokio::time::timeout(Duration::from_secs(10), handle).await.unwrap().unwrap();

    assert_eq!(outcome.total, 3);
    assert_eq!(outcome.embedded, 0);
    assert_eq!(outcome.dropped, 3);
    assert!(!outcome.errors.is_empty());

    assert!(queue.drain(Duration::from_secs(1)).await);
    queue.assert_invariants();
    assert!(sink.batches.lock().unwrap().is_empty());
    assert!(queue.snapshot().errors >= 3);
    cancel.cancel();
  }

  #[tokio::test]
  async fn backpressure_bounds_queue_depth() {
    /// Embedder that parks until released, pinning chunks in the queue.
    struct ParkedEmbedder {
      release: Notify,
    }

    #[async_trait]
    impl Embedder for ParkedEmbedder {
      async fn embed_batch(
        &self,
        texts: Vec<String>,
        _is_query: bool,
        on_assign: &(dyn Fn(usize) + Send + Sync),
      ) -> Result<Vec<Vec<f32>>, EmbedError> {
        on_assign(0);
        self.release.notified().await;
        Ok(texts.iter().map(|_| vec![1.0]).collect())
      }
    }

    let embedder = Arc::new(ParkedEmbedder { release: Notify::new() });
    let config = QueueConfig {
      max_queue_size: 10,
      max_batch_len: 2,
      ..small_config()
    };
    let queue = EmbeddingQueue::new(config, embedder.clone(), Arc::new(RecordingSink::default()));
    let cancel = CancellationToken::new();
    tokio::spawn(queue.clone().run(cancel.clone()));

    let producer = {
      let queue = queue.clone();
      tokio::spawn(async move { queue.add_chunks(chunks("/docs/flood.txt", 50), "/docs/flood.txt", 0).await })
    };

    // The producer must stall well short of 50 queued chunks.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(queue.snapshot().queued <= 10, "depth {} exceeds bound", queue.snapshot().queued);
    assert!(!producer.is_finished());

    // Release the embedder repeatedly; everything drains.
    let handle = {
      loop {
        embedder.release.notify_waiters();
        if producer.is_finished() {
          break producer.await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
      }
    };
    let outcome = loop {
      embedder.release.notify_waiters();
      tokio::time::sleep(Duration::from_millis(10)).await;
      if queue.drain(Duration::from_millis(1)).await {
        break handle.await.unwrap();
      }
    };
    assert_eq!(outcome.embedded, 50);
    queue.assert_invariants();
    cancel.cancel();
  }

  #[tokio::test]
  async fn worker_restart_recovers_in_flight_batches() {
    /// Fails by hanging: the embed future never resolves, as when a worker
    /// process dies silently. Recovery must requeue its batch.
    struct HangingOnceEmbedder {
      hung: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for HangingOnceEmbedder {
      async fn embed_batch(
        &self,
        texts: Vec<String>,
        _is_query: bool,
        on_assign: &(dyn Fn(usize) + Send + Sync),
      ) -> Result<Vec<Vec<f32>>, EmbedError> {
        on_assign(0);
        if self.hung.fetch_add(1, Ordering::SeqCst) == 0 {
          // Simulate the crash surfacing after the pipe drops.
          tokio::time::sleep(Duration::from_millis(200)).await;
          return Err(EmbedError::WorkerCrash("pipe closed".into()));
        }
        Ok(texts.iter().map(|_| vec![1.0]).collect())
      }
    }

    let queue = EmbeddingQueue::new(
      small_config(),
      Arc::new(HangingOnceEmbedder { hung: AtomicUsize::new(0) }),
      Arc::new(RecordingSink::default()),
    );
    let cancel = CancellationToken::new();
    tokio::spawn(queue.clone().run(cancel.clone()));

    let handle = queue.add_chunks(chunks("/docs/crash.txt", 6), "/docs/crash.txt", 0).await;

    // Let the first batch get in flight, then simulate the pool's restart.
    tokio::time::sleep(Duration::from_millis(50)).await;
    queue.recover_worker(0);

    let outcome = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    assert_eq!(outcome.embedded + outcome.dropped, 6);
    assert_eq!(outcome.dropped, 0, "recovered chunks must not be dropped");

    assert!(queue.drain(Duration::from_secs(1)).await);
    queue.assert_invariants();
    assert_eq!(queue.snapshot().processing_batches, 0);
    cancel.cancel();
  }

  #[tokio::test]
  async fn recovery_leaves_other_workers_batches_alone() {
    let queue = EmbeddingQueue::new(small_config(), FakeEmbedder::new(0), Arc::new(RecordingSink::default()));

    // Hand-install two active batches on different workers.
    {
      let mut state = queue.state.lock().unwrap();
      for (id, worker) in [(1u64, 0usize), (2, 1)] {
        state.active_batches.insert(
          id,
          ActiveBatch {
            chunks: vec![QueuedChunk {
              text: "t".into(),
              meta: meta("/docs/x.txt", id as u32),
              retry_count: 0,
            }],
            worker_index: Some(worker),
            storing: false,
          },
        );
        state.processing_batches += 1;
      }
    }

    queue.recover_worker(0);

    let state = queue.state.lock().unwrap();
    assert_eq!(state.active_batches.len(), 1);
    assert!(state.active_batches.contains_key(&2));
    assert_eq!(state.processing_batches, 1);
    assert_eq!(state.queue.len(), 1);
  }

  #[tokio::test]
  async fn storing_batches_are_not_recovered() {
    let queue = EmbeddingQueue::new(small_config(), FakeEmbedder::new(0), Arc::new(RecordingSink::default()));
    {
      let mut state = queue.state.lock().unwrap();
      state.active_batches.insert(
        7,
        ActiveBatch {
          chunks: Vec::new(),
          worker_index: Some(0),
          storing: true,
        },
      );
      state.processing_batches += 1;
    }

    queue.recover_worker(0);

    let state = queue.state.lock().unwrap();
    assert!(state.active_batches.contains_key(&7));
    assert_eq!(state.processing_batches, 1);
  }

  #[tokio::test]
  async fn pause_stops_batch_formation() {
    let sink = Arc::new(RecordingSink::default());
    let queue = EmbeddingQueue::new(small_config(), FakeEmbedder::new(0), sink.clone());
    let cancel = CancellationToken::new();
    queue.set_paused(true);
    tokio::spawn(queue.clone().run(cancel.clone()));

    let handle = queue.add_chunks(chunks("/docs/p.txt", 2), "/docs/p.txt", 0).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(sink.batches.lock().unwrap().is_empty());
    assert_eq!(queue.snapshot().queued, 2);

    queue.set_paused(false);
    let outcome = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    assert_eq!(outcome.embedded, 2);
    cancel.cancel();
  }

  #[tokio::test]
  async fn thousand_chunks_with_flaky_embedder_all_account() {
    /// Fails every seventh call.
    struct FlakyEmbedder {
      calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
      async fn embed_batch(
        &self,
        texts: Vec<String>,
        _is_query: bool,
        on_assign: &(dyn Fn(usize) + Send + Sync),
      ) -> Result<Vec<Vec<f32>>, EmbedError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        on_assign(call % 3);
        if call % 7 == 6 {
          return Err(EmbedError::Timeout);
        }
        Ok(texts.iter().map(|_| vec![0.5, 0.5]).collect())
      }
    }

    let sink = Arc::new(RecordingSink::default());
    let config = QueueConfig {
      max_queue_size: 256,
      max_concurrent_batches: 4,
      ..small_config()
    };
    let queue = EmbeddingQueue::new(config, Arc::new(FlakyEmbedder { calls: AtomicUsize::new(0) }), sink.clone());
    let cancel = CancellationToken::new();
    tokio::spawn(queue.clone().run(cancel.clone()));

    let mut handles = Vec::new();
    for file in 0..20 {
      let path = format!("/docs/f{file}.txt");
      handles.push((path.clone(), queue.add_chunks(chunks(&path, 50), &path, file).await));
    }

    let mut accounted = 0;
    for (path, handle) in handles {
      let outcome = tokio::time::timeout(Duration::from_secs(30), handle)
        .await
        .unwrap_or_else(|_| panic!("{path} never completed"))
        .unwrap();
      assert_eq!(outcome.total, 50);
      accounted += outcome.embedded + outcome.dropped;
    }
    assert_eq!(accounted, 1000);

    assert!(queue.drain(Duration::from_secs(5)).await);
    queue.assert_invariants();
    assert_eq!(queue.snapshot().processing_batches, 0);
    cancel.cancel();
  }
}
