//! The orchestrator: owns every subsystem and sequences init, watching,
//! querying and the ordered shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use db::{VectorStore, WriteQueue};
use embedding::{EmbedderPool, EmbeddingQueue, PoolConfig, QueueConfig, WorkerConfig, WorkerEvent, default_pool_size};
use index::{
  FileJob, FilePipeline, PipelineConfig, ReindexService, ScanFilter, Scanner, WatcherConfig, WatcherTask,
};
use ipc::{
  Diagnostics, FolderStats, InitResult, ProgressEvent, ProgressSnapshot, ShutdownReport, StatsResult, WatchOptions,
};
use lodestone_core::{Config, Settings, UserDataDirs, WatchedFolder};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cache::StatsCache;
use crate::search::SearchService;
use crate::sink::StoreSink;
use crate::state::{LifecycleState, StateMachine};

/// How long init waits for one worker to come up (covers a cold model
/// download; progress events stream to the host meanwhile).
const MODEL_READY_TIMEOUT: Duration = Duration::from_secs(600);
const EMBED_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const WRITE_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum InitError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("Database corrupt or unreadable: {0}")]
  DbCorrupt(String),
  #[error("Failed to start embedder pool: {0}")]
  Pool(#[from] embedding::EmbedError),
  #[error("Embedding model did not become ready in time")]
  ModelTimeout,
  #[error("Daemon is not in a state that can initialize")]
  WrongState,
}

/// Everything that exists only after a successful `init`.
struct Runtime {
  store: Arc<VectorStore>,
  writes: WriteQueue,
  pool: Arc<EmbedderPool>,
  embed_queue: Arc<EmbeddingQueue>,
  pipeline: Arc<FilePipeline>,
  search: Arc<SearchService>,
  stats_cache: StatsCache,
  /// Cancelled by `watch_start` replacements and shutdown step 1.
  watcher_cancel: std::sync::Mutex<CancellationToken>,
  /// Consumer loops (file pipeline, embedding queue).
  tasks_cancel: CancellationToken,
  /// Periodic work: progress pump, pool maintenance (shutdown step 6).
  monitor_cancel: CancellationToken,
}

pub struct DaemonCore {
  dirs: UserDataDirs,
  config: Arc<std::sync::RwLock<Config>>,
  state: StateMachine,
  runtime: tokio::sync::RwLock<Option<Arc<Runtime>>>,
  progress_tx: broadcast::Sender<ProgressEvent>,
  worker_binary: Option<PathBuf>,
}

impl DaemonCore {
  pub fn new(dirs: UserDataDirs, worker_binary: Option<PathBuf>) -> Arc<Self> {
    let (progress_tx, _) = broadcast::channel(256);
    let config = Config::load_or_default(&dirs.config_path());
    Arc::new(Self {
      dirs,
      config: Arc::new(std::sync::RwLock::new(config)),
      state: StateMachine::new(),
      runtime: tokio::sync::RwLock::new(None),
      progress_tx,
      worker_binary,
    })
  }

  pub fn state(&self) -> LifecycleState {
    self.state.current()
  }

  pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent> {
    self.progress_tx.subscribe()
  }

  pub fn settings(&self) -> Settings {
    self.config.read().expect("config lock").settings.clone()
  }

  pub fn watched_folders(&self) -> Vec<String> {
    self
      .config
      .read()
      .expect("config lock")
      .watched_folders
      .iter()
      .map(|f| f.path.to_string_lossy().into_owned())
      .collect()
  }

  async fn runtime(&self) -> Option<Arc<Runtime>> {
    self.runtime.read().await.clone()
  }

  // ==========================================================================
  // Init
  // ==========================================================================

  pub async fn init(&self) -> Result<InitResult, InitError> {
    if !self.state.transition(LifecycleState::Initializing) {
      return Err(InitError::WrongState);
    }
    if let Err(e) = self.init_inner().await {
      self.state.transition(LifecycleState::Error);
      return Err(e);
    }
    self.state.transition(LifecycleState::Ready);

    let runtime = self.runtime().await.expect("runtime after init");
    let schema_version = runtime.store.schema_version().await.unwrap_or(0);
    Ok(InitResult {
      model_ready: true,
      schema_version,
    })
  }

  async fn init_inner(&self) -> Result<(), InitError> {
    self.dirs.ensure()?;
    let settings = self.settings();

    let store = VectorStore::open(&self.dirs.data_dir(), settings.embedder.dimensions)
      .await
      .map_err(|e| InitError::DbCorrupt(e.to_string()))?;
    let store = Arc::new(store);

    let stats_cache = StatsCache::new();
    let invalidate = {
      let cache = stats_cache.clone();
      Arc::new(move || cache.invalidate()) as Arc<dyn Fn() + Send + Sync>
    };
    let writes = WriteQueue::start(store.clone(), Some(invalidate));

    // Worker events feed the progress stream.
    let (events_tx, mut events_rx) = mpsc::channel::<WorkerEvent>(64);
    let progress_tx = self.progress_tx.clone();
    tokio::spawn(async move {
      while let Some(event) = events_rx.recv().await {
        match event {
          WorkerEvent::DownloadProgress { loaded, total } => {
            let _ = progress_tx.send(ProgressEvent::ModelDownload { loaded, total });
          }
          WorkerEvent::Fatal { worker_index, message } => {
            error!(worker_index, message, "Embedder worker fatal");
          }
        }
      }
    });

    let pool_size = if settings.embedder.pool_size > 0 {
      settings.embedder.pool_size
    } else {
      default_pool_size()
    };
    let pool = Arc::new(EmbedderPool::spawn(
      PoolConfig {
        size: pool_size,
        worker: WorkerConfig {
          binary: self.worker_binary.clone().unwrap_or_else(WorkerConfig::locate_binary),
          model_name: settings.embedder.model.clone(),
          cache_dir: self.dirs.models_dir(),
          request_timeout: Duration::from_secs(120),
        },
        files_per_worker: settings.embedder.files_per_worker,
        max_rss_bytes: settings.embedder.max_worker_rss_bytes,
        health_interval: Duration::from_secs(5),
        shutdown_grace: Duration::from_secs(3),
      },
      events_tx,
    )?);

    let embed_queue = EmbeddingQueue::new(
      QueueConfig {
        max_queue_size: settings.indexing.max_queue_size,
        max_concurrent_batches: settings.indexing.max_concurrent_batches,
        max_tokens_per_batch: settings.embedder.max_tokens_per_batch,
        max_batch_len: settings.embedder.max_batch_len,
        max_retries: settings.indexing.max_retries,
      },
      pool.clone(),
      Arc::new(StoreSink::new(writes.clone())),
    );

    embed_queue.set_on_file_complete(Arc::new(|path, outcome| {
      tracing::debug!(
        path,
        embedded = outcome.embedded,
        dropped = outcome.dropped,
        "File embedding complete"
      );
    }));

    // Lost-batch recovery runs before any worker respawn.
    {
      let queue = Arc::downgrade(&embed_queue);
      pool.set_on_worker_restart(Arc::new(move |worker_index| {
        let queue = queue.clone();
        Box::pin(async move {
          if let Some(queue) = queue.upgrade() {
            queue.recover_worker(worker_index);
          }
        })
      }));
    }

    let tasks_cancel = CancellationToken::new();
    let monitor_cancel = CancellationToken::new();
    tokio::spawn(embed_queue.clone().run(tasks_cancel.clone()));
    tokio::spawn(pool.clone().run_maintenance(monitor_cancel.clone()));

    let (file_events_tx, mut file_events_rx) = mpsc::channel::<ProgressEvent>(64);
    let pipeline = FilePipeline::new(
      store.clone(),
      writes.clone(),
      embed_queue.clone(),
      PipelineConfig {
        cpu_concurrency: settings.indexing.cpu_concurrency,
        chunker: Default::default(),
      },
      Some(file_events_tx),
    );
    tokio::spawn(pipeline.clone().run(tasks_cancel.clone()));

    let progress_tx = self.progress_tx.clone();
    tokio::spawn(async move {
      while let Some(event) = file_events_rx.recv().await {
        let _ = progress_tx.send(event);
      }
    });

    // Periodic pipeline snapshot for the host.
    {
      let progress_tx = self.progress_tx.clone();
      let pipeline = pipeline.clone();
      let embed_queue = embed_queue.clone();
      let cancel = monitor_cancel.clone();
      tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
          tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
          }
          let counters = pipeline.counters();
          let queue = embed_queue.snapshot();
          let _ = progress_tx.send(ProgressEvent::Indexing {
            stage: if queue.queued > 0 || queue.processing_batches > 0 {
              "embedding".to_string()
            } else {
              "idle".to_string()
            },
            queued: counters.queued.load(std::sync::atomic::Ordering::SeqCst),
            processing: counters.processing.load(std::sync::atomic::Ordering::SeqCst),
            done: counters.done.load(std::sync::atomic::Ordering::SeqCst),
            errors: counters.errors.load(std::sync::atomic::Ordering::SeqCst),
          });
        }
      });
    }

    let search = Arc::new(SearchService::new(
      store.clone(),
      pool.clone(),
      settings.embedder.query_prefix.clone(),
    ));

    if !pool.wait_any_ready(MODEL_READY_TIMEOUT).await {
      return Err(InitError::ModelTimeout);
    }
    info!(dim = pool.dim().await, "Embedder pool ready");

    *self.runtime.write().await = Some(Arc::new(Runtime {
      store,
      writes,
      pool,
      embed_queue,
      pipeline,
      search,
      stats_cache,
      watcher_cancel: std::sync::Mutex::new(CancellationToken::new()),
      tasks_cancel,
      monitor_cancel,
    }));
    Ok(())
  }

  // ==========================================================================
  // Indexing controls
  // ==========================================================================

  fn scan_filter(&self, extra_excludes: &[String]) -> Result<ScanFilter, String> {
    let config = self.config.clone();
    let enabled = Arc::new(move |ext: &str| {
      let default = parser::lookup(ext).map(|def| def.enabled_by_default).unwrap_or(false);
      config.read().expect("config lock").extension_enabled(ext, default)
    });

    let (mut patterns, max_size) = {
      let config = self.config.read().expect("config lock");
      (
        config.settings.indexing.excluded_patterns.clone(),
        config.settings.indexing.max_file_size,
      )
    };
    patterns.extend_from_slice(extra_excludes);
    ScanFilter::new(&patterns, enabled, max_size).map_err(|e| e.to_string())
  }

  pub async fn watch_start(&self, roots: Vec<String>, options: WatchOptions) -> Result<(), String> {
    let runtime = self.runtime().await.ok_or("not initialized")?;
    let roots: Vec<PathBuf> = roots.into_iter().map(PathBuf::from).collect();
    for root in &roots {
      if !root.is_dir() {
        return Err(format!("not a directory: {}", root.display()));
      }
    }

    let filter = self.scan_filter(&options.exclude)?;

    // Remember the roots across restarts.
    {
      let mut config = self.config.write().expect("config lock");
      let now = Utc::now().timestamp_millis();
      for root in &roots {
        if !config.watched_folders.iter().any(|f| &f.path == root) {
          config.watched_folders.push(WatchedFolder {
            path: root.clone(),
            added_at: now,
          });
        }
      }
      if let Err(e) = config.save(&self.dirs.config_path()) {
        warn!(error = %e, "Failed to persist config");
      }
    }

    // Replace any previous watcher.
    let watcher_cancel = {
      let mut guard = runtime.watcher_cancel.lock().expect("watcher cancel");
      guard.cancel();
      let fresh = runtime.tasks_cancel.child_token();
      *guard = fresh.clone();
      fresh
    };

    let debounce = {
      let config = self.config.read().expect("config lock");
      Duration::from_millis(config.settings.indexing.debounce_ms)
    };
    WatcherTask::spawn(
      WatcherConfig {
        roots: roots.clone(),
        debounce,
      },
      filter.clone(),
      runtime.pipeline.handle(),
      watcher_cancel,
    )
    .map_err(|e| e.to_string())?;

    // Initial scan plus the parser-upgrade walk, in the background so the
    // host gets its ack immediately.
    let handle = runtime.pipeline.handle();
    let store = runtime.store.clone();
    let writes = runtime.writes.clone();
    tokio::spawn(async move {
      for root in roots {
        let scanner = Scanner::new(filter.clone());
        let scan_root = root.clone();
        let files = tokio::task::spawn_blocking(move || scanner.scan(&scan_root))
          .await
          .unwrap_or_default();
        info!(root = %root.display(), files = files.len(), "Initial scan complete");
        for file in files {
          let _ = handle.enqueue(FileJob::Index { path: file.path }).await;
        }
      }

      let reindex = ReindexService::new(store, writes);
      if let Err(e) = reindex.startup_walk(&handle).await {
        warn!(error = %e, "Re-index walk failed");
      }
    });

    Ok(())
  }

  pub async fn enqueue(&self, paths: Vec<String>) -> Result<usize, String> {
    let runtime = self.runtime().await.ok_or("not initialized")?;
    let handle = runtime.pipeline.handle();
    let count = paths.len();
    for path in paths {
      let _ = handle.enqueue(FileJob::Index { path: PathBuf::from(path) }).await;
    }
    Ok(count)
  }

  pub async fn set_paused(&self, paused: bool) -> Result<(), String> {
    let runtime = self.runtime().await.ok_or("not initialized")?;
    runtime.pipeline.set_paused(paused);
    info!(paused, "Pipeline pause state changed");
    Ok(())
  }

  pub async fn progress(&self) -> ProgressSnapshot {
    let Some(runtime) = self.runtime().await else {
      return ProgressSnapshot::default();
    };
    let counters = runtime.pipeline.counters();
    let queue = runtime.embed_queue.snapshot();
    ProgressSnapshot {
      queued: counters.queued.load(std::sync::atomic::Ordering::SeqCst) + queue.queued as u64,
      processing: counters.processing.load(std::sync::atomic::Ordering::SeqCst) + queue.processing_batches as u64,
      done: counters.done.load(std::sync::atomic::Ordering::SeqCst),
      errors: counters.errors.load(std::sync::atomic::Ordering::SeqCst) + queue.errors,
      paused: runtime.pipeline.is_paused(),
    }
  }

  /// Clear the index and re-scan every watched folder.
  pub async fn reindex_all(&self) -> Result<(), String> {
    let runtime = self.runtime().await.ok_or("not initialized")?;
    info!("Re-indexing everything");

    runtime.writes.drain(WRITE_DRAIN_TIMEOUT).await;
    runtime.store.clear().await.map_err(|e| e.to_string())?;
    runtime.stats_cache.invalidate();

    let folders = self.watched_folders();
    if folders.is_empty() {
      return Ok(());
    }
    self.watch_start(folders, WatchOptions::default()).await
  }

  // ==========================================================================
  // Query paths
  // ==========================================================================

  pub async fn search(&self, query: &str, k: usize) -> Result<Vec<ipc::SearchHit>, String> {
    let runtime = self.runtime().await.ok_or("not initialized")?;
    runtime.search.query(query, k).await.map_err(|e| e.to_string())
  }

  pub async fn stats(&self) -> Result<StatsResult, String> {
    let runtime = self.runtime().await.ok_or("not initialized")?;
    let store = runtime.store.clone();
    let folders = self.watched_folders();

    runtime
      .stats_cache
      .get_or_compute(|| async move {
        let total_chunks = store.total_chunks().await.map_err(|e| e.to_string())?;
        let indexed_files = store
          .count_status(lodestone_core::FileStatus::Indexed)
          .await
          .map_err(|e| e.to_string())?;

        let mut folder_stats = Vec::with_capacity(folders.len());
        for folder in folders {
          let prefix = if folder.ends_with('/') {
            folder.clone()
          } else {
            format!("{folder}/")
          };
          folder_stats.push(FolderStats {
            indexed_files: store.indexed_files_under(&prefix).await.map_err(|e| e.to_string())?,
            total_chunks: store.chunks_under(&prefix).await.map_err(|e| e.to_string())?,
            path: folder,
          });
        }

        Ok(StatsResult {
          total_chunks,
          indexed_files,
          folder_stats,
        })
      })
      .await
  }

  pub async fn schema_version(&self) -> i64 {
    match self.runtime().await {
      Some(runtime) => runtime.store.schema_version().await.unwrap_or(0),
      None => 0,
    }
  }

  pub async fn diagnostics(&self) -> Diagnostics {
    let (workers_alive, queue_depth) = match self.runtime().await {
      Some(runtime) => (
        runtime.pool.workers_alive().await,
        runtime.embed_queue.snapshot().queued,
      ),
      None => (0, 0),
    };
    Diagnostics {
      state: self.state.current().as_str().to_string(),
      workers_alive,
      queue_depth,
    }
  }

  // ==========================================================================
  // Settings
  // ==========================================================================

  pub fn update_settings(&self, settings: Settings) -> Result<(), String> {
    let mut config = self.config.write().expect("config lock");
    config.settings = settings;
    config.save(&self.dirs.config_path()).map_err(|e| e.to_string())
  }

  // ==========================================================================
  // Shutdown
  // ==========================================================================

  /// Ordered shutdown. Every step contributes to the report; a timeout in
  /// one never prevents the rest.
  pub async fn shutdown(&self) -> ShutdownReport {
    let mut report = ShutdownReport::default();
    if !self.state.transition(LifecycleState::ShuttingDown) {
      report.push("transition", false, false, Some("not running".into()));
      return report;
    }

    let Some(runtime) = self.runtime().await else {
      self.state.transition(LifecycleState::Terminated);
      report.push("runtime", true, false, Some("never initialized".into()));
      return report;
    };

    // 1. No new watcher events.
    runtime.watcher_cancel.lock().expect("watcher cancel").cancel();
    report.push("stop_watcher", true, false, None);

    // 2. Every in-flight file finishes, however long that takes.
    runtime.pipeline.drain().await;
    report.push("drain_file_queue", true, false, None);

    // 3. Embedding queue, bounded.
    let drained = runtime.embed_queue.drain(EMBED_DRAIN_TIMEOUT).await;
    report.push(
      "drain_embedding_queue",
      drained,
      !drained,
      (!drained).then(|| "timed out after 30s".to_string()),
    );

    // 4. Write queue, bounded.
    let drained = runtime.writes.drain(WRITE_DRAIN_TIMEOUT).await;
    report.push(
      "drain_write_queue",
      drained,
      !drained,
      (!drained).then(|| "timed out after 10s".to_string()),
    );

    // 5. Profiling.
    report.push("save_profiling", true, false, Some("disabled".into()));

    // 6. Periodic work.
    runtime.monitor_cancel.cancel();
    report.push("clear_monitors", true, false, None);

    // 7. Workers get a shutdown message, then the grace-period kill.
    runtime.pool.shutdown().await;
    report.push("shutdown_pool", true, false, None);

    // 8. Drop the store handle.
    runtime.tasks_cancel.cancel();
    drop(runtime);
    *self.runtime.write().await = None;
    report.push("close_database", true, false, None);

    self.state.transition(LifecycleState::Terminated);
    info!(clean = report.clean(), "Shutdown complete");
    report
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn core() -> (tempfile::TempDir, Arc<DaemonCore>) {
    let tmp = tempfile::TempDir::new().unwrap();
    let core = DaemonCore::new(UserDataDirs::new(tmp.path().join("ud")), None);
    (tmp, core)
  }

  #[tokio::test]
  async fn shutdown_before_init_reports_not_running() {
    let (_tmp, core) = core();
    let report = core.shutdown().await;
    assert!(!report.clean());
    assert_eq!(report.steps[0].name, "transition");
  }

  #[tokio::test]
  async fn operations_require_initialization() {
    let (_tmp, core) = core();
    assert!(core.watch_start(vec!["/tmp".into()], Default::default()).await.is_err());
    assert!(core.search("query", 5).await.is_err());
    assert!(core.stats().await.is_err());
    assert!(core.set_paused(true).await.is_err());
  }

  #[tokio::test]
  async fn progress_before_init_is_empty() {
    let (_tmp, core) = core();
    let snapshot = core.progress().await;
    assert_eq!(snapshot.queued, 0);
    assert!(!snapshot.paused);
  }

  #[tokio::test]
  async fn diagnostics_reflect_state() {
    let (_tmp, core) = core();
    let diagnostics = core.diagnostics().await;
    assert_eq!(diagnostics.state, "uninitialized");
    assert_eq!(diagnostics.workers_alive, 0);
  }

  #[tokio::test]
  async fn settings_update_persists() {
    let (_tmp, core) = core();
    let mut settings = core.settings();
    settings.embedder.pool_size = 3;
    core.update_settings(settings).unwrap();

    let reloaded = Config::load_or_default(&core.dirs.config_path());
    assert_eq!(reloaded.settings.embedder.pool_size, 3);
  }
}
