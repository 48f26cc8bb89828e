//! Worker pool: round-robin dispatch over ready workers plus restart policy.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::{RwLock, mpsc};
use tracing::{info, warn};

use crate::{EmbedError, WorkerConfig, WorkerEvent, WorkerHandle};

/// Something that can embed a batch of texts.
///
/// `on_assign` is called with the chosen worker index before dispatch so the
/// caller can tie in-flight work to a worker for restart recovery.
#[async_trait]
pub trait Embedder: Send + Sync {
  async fn embed_batch(
    &self,
    texts: Vec<String>,
    is_query: bool,
    on_assign: &(dyn Fn(usize) + Send + Sync),
  ) -> Result<Vec<Vec<f32>>, EmbedError>;
}

/// Invoked with the worker index before a worker is respawned; awaited so
/// lost-batch recovery completes before the replacement takes work.
pub type RestartCallback = Arc<dyn Fn(usize) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct PoolConfig {
  pub size: usize,
  pub worker: WorkerConfig,
  /// Restart a worker after it has embedded this many files.
  pub files_per_worker: u64,
  /// Restart a worker whose sampled RSS exceeds this.
  pub max_rss_bytes: u64,
  pub health_interval: Duration,
  pub shutdown_grace: Duration,
}

/// Pool size from hardware concurrency, bounded 1–4.
pub fn default_pool_size() -> usize {
  (num_cpus::get() / 2).clamp(1, 4)
}

/// Restarts beyond this count inside [`RESTART_WINDOW`] are surfaced as a
/// fatal event instead of silently looping.
const RESTART_STORM_LIMIT: usize = 5;
const RESTART_WINDOW: Duration = Duration::from_secs(60);

pub struct EmbedderPool {
  slots: Vec<RwLock<WorkerHandle>>,
  next: AtomicUsize,
  config: PoolConfig,
  events_tx: mpsc::Sender<WorkerEvent>,
  on_worker_restart: std::sync::RwLock<Option<RestartCallback>>,
  recent_restarts: std::sync::Mutex<std::collections::VecDeque<std::time::Instant>>,
}

impl EmbedderPool {
  /// Spawn all workers. They load the model in the background; use
  /// [`EmbedderPool::wait_any_ready`] before dispatching real work.
  pub fn spawn(config: PoolConfig, events_tx: mpsc::Sender<WorkerEvent>) -> Result<Self, EmbedError> {
    let mut slots = Vec::with_capacity(config.size);
    for index in 0..config.size {
      let handle = WorkerHandle::spawn(&config.worker, events_tx.clone(), index)?;
      slots.push(RwLock::new(handle));
    }
    info!(workers = config.size, "Embedder pool spawned");

    Ok(Self {
      slots,
      next: AtomicUsize::new(0),
      config,
      events_tx,
      on_worker_restart: std::sync::RwLock::new(None),
      recent_restarts: std::sync::Mutex::new(std::collections::VecDeque::new()),
    })
  }

  /// Install the lost-batch recovery callback (the embedding queue's).
  pub fn set_on_worker_restart(&self, callback: RestartCallback) {
    *self.on_worker_restart.write().expect("restart callback lock") = Some(callback);
  }

  pub fn size(&self) -> usize {
    self.slots.len()
  }

  pub async fn workers_alive(&self) -> usize {
    let mut alive = 0;
    for slot in &self.slots {
      if !slot.read().await.has_exited() {
        alive += 1;
      }
    }
    alive
  }

  /// Vector dimension reported by the first ready worker (0 if none yet).
  pub async fn dim(&self) -> usize {
    for slot in &self.slots {
      let dim = slot.read().await.dim();
      if dim > 0 {
        return dim;
      }
    }
    0
  }

  /// Wait until at least one worker is ready (model loaded), or time out.
  pub async fn wait_any_ready(&self, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
      for slot in &self.slots {
        if slot.read().await.is_ready() {
          return true;
        }
      }
      if tokio::time::Instant::now() >= deadline {
        return false;
      }
      tokio::time::sleep(Duration::from_millis(100)).await;
    }
  }

  /// Embed a single query text (search path).
  pub async fn embed_query(&self, text: String) -> Result<Vec<f32>, EmbedError> {
    let vectors = self.embed_batch(vec![text], true, &|_| {}).await?;
    vectors.into_iter().next().ok_or(EmbedError::Protocol("empty result".into()))
  }

  /// Track restart frequency; a storm means something is persistently wrong
  /// (bad model file, OOM loop) and deserves a user-visible error.
  fn note_restart(&self, index: usize) {
    let now = std::time::Instant::now();
    let mut restarts = self.recent_restarts.lock().expect("restart history");
    restarts.push_back(now);
    while restarts.front().is_some_and(|t| now.duration_since(*t) > RESTART_WINDOW) {
      restarts.pop_front();
    }
    if restarts.len() > RESTART_STORM_LIMIT {
      let _ = self.events_tx.try_send(WorkerEvent::Fatal {
        worker_index: index,
        message: format!("{} worker restarts within {:?}", restarts.len(), RESTART_WINDOW),
      });
    }
  }

  /// Restart worker `index`: recover its in-flight batches, then respawn.
  async fn restart_worker(&self, index: usize, reason: &str) {
    warn!(worker_index = index, reason, "Restarting embedder worker");
    self.note_restart(index);

    let callback = self.on_worker_restart.read().expect("restart callback lock").clone();
    if let Some(callback) = callback {
      callback(index).await;
    }

    match WorkerHandle::spawn(&self.config.worker, self.events_tx.clone(), index) {
      Ok(fresh) => {
        let old = {
          let mut slot = self.slots[index].write().await;
          std::mem::replace(&mut *slot, fresh)
        };
        // Make sure the old process is actually gone.
        old.shutdown(self.config.shutdown_grace).await;
      }
      Err(e) => {
        warn!(worker_index = index, error = %e, "Worker respawn failed; will retry next sweep");
      }
    }
  }

  /// Periodic health sweep. Runs until `cancel` fires.
  pub async fn run_maintenance(self: Arc<Self>, cancel: tokio_util::sync::CancellationToken) {
    let mut interval = tokio::time::interval(self.config.health_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        biased;
        _ = cancel.cancelled() => break,
        _ = interval.tick() => {}
      }

      for index in 0..self.slots.len() {
        let handle = self.slots[index].read().await.clone();

        if handle.try_reap().await {
          self.restart_worker(index, "exited").await;
          continue;
        }
        if !handle.is_ready() {
          continue;
        }

        match handle.health().await {
          Ok((rss, files)) => {
            if files >= self.config.files_per_worker {
              handle.shutdown(self.config.shutdown_grace).await;
              self.restart_worker(index, "file limit reached").await;
            } else if rss >= self.config.max_rss_bytes {
              handle.shutdown(self.config.shutdown_grace).await;
              self.restart_worker(index, "memory ceiling exceeded").await;
            }
          }
          Err(e) => {
            warn!(worker_index = index, error = %e, "Health probe failed");
          }
        }
      }
    }
  }

  /// Stop every worker: shutdown message first, kill after the grace period.
  pub async fn shutdown(&self) {
    for slot in &self.slots {
      let handle = slot.read().await.clone();
      handle.shutdown(self.config.shutdown_grace).await;
    }
    info!("Embedder pool shut down");
  }
}

#[async_trait]
impl Embedder for EmbedderPool {
  async fn embed_batch(
    &self,
    texts: Vec<String>,
    is_query: bool,
    on_assign: &(dyn Fn(usize) + Send + Sync),
  ) -> Result<Vec<Vec<f32>>, EmbedError> {
    // Round-robin over ready workers, skipping the rest.
    for _ in 0..self.slots.len() {
      let index = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
      let handle = self.slots[index].read().await.clone();
      if !handle.is_ready() {
        continue;
      }
      on_assign(index);
      return handle.embed(texts, is_query).await;
    }
    Err(EmbedError::NoWorker)
  }
}
