//! File watcher: notify events, per-path debouncing, event coalescing.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::pipeline::{FileJob, PipelineHandle};
use crate::scanner::ScanFilter;

#[derive(Debug, Error)]
pub enum WatcherError {
  #[error("Failed to initialize watcher: {0}")]
  Init(#[source] notify::Error),
  #[error("Failed to watch path: {0}")]
  Watch(#[source] notify::Error),
}

#[derive(Debug, Clone)]
pub struct WatcherConfig {
  pub roots: Vec<PathBuf>,
  pub debounce: Duration,
}

/// The kind of pending change being debounced.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ChangeKind {
  Upsert,
  Deleted,
}

#[derive(Debug)]
struct PendingChange {
  kind: ChangeKind,
  last_event: Instant,
}

impl PendingChange {
  fn new(kind: ChangeKind) -> Self {
    Self {
      kind,
      last_event: Instant::now(),
    }
  }

  /// Coalesce a new event into the pending one.
  fn update(&mut self, kind: ChangeKind) {
    self.last_event = Instant::now();
    match (&self.kind, &kind) {
      // Delete followed by create within the window is an editor-style save.
      (ChangeKind::Deleted, ChangeKind::Upsert) => {
        self.kind = ChangeKind::Upsert;
        trace!("Coalescing delete+create -> upsert");
      }
      _ => self.kind = kind,
    }
  }
}

/// Watches every configured root and forwards settled changes to the file
/// pipeline. Renames arrive from notify as per-path events and degrade to
/// delete-old + create-new.
pub struct WatcherTask {
  config: WatcherConfig,
  filter: ScanFilter,
  pipeline: PipelineHandle,
  cancel: CancellationToken,
  _watcher: RecommendedWatcher,
  event_rx: mpsc::Receiver<Result<Event, notify::Error>>,
}

impl WatcherTask {
  pub fn new(
    config: WatcherConfig,
    filter: ScanFilter,
    pipeline: PipelineHandle,
    cancel: CancellationToken,
  ) -> Result<Self, WatcherError> {
    let (event_tx, event_rx) = mpsc::channel::<Result<Event, notify::Error>>(256);

    let mut watcher = RecommendedWatcher::new(
      move |res| {
        // notify's thread; drop events if the channel is saturated.
        let _ = event_tx.blocking_send(res);
      },
      Config::default(),
    )
    .map_err(WatcherError::Init)?;

    for root in &config.roots {
      watcher
        .watch(root, RecursiveMode::Recursive)
        .map_err(WatcherError::Watch)?;
      info!(root = %root.display(), "Watching");
    }

    Ok(Self {
      config,
      filter,
      pipeline,
      cancel,
      _watcher: watcher,
      event_rx,
    })
  }

  pub fn spawn(
    config: WatcherConfig,
    filter: ScanFilter,
    pipeline: PipelineHandle,
    cancel: CancellationToken,
  ) -> Result<tokio::task::JoinHandle<()>, WatcherError> {
    let task = Self::new(config, filter, pipeline, cancel)?;
    Ok(tokio::spawn(task.run()))
  }

  pub async fn run(mut self) {
    let mut pending: HashMap<PathBuf, PendingChange> = HashMap::new();
    let mut debounce_interval = tokio::time::interval(self.config.debounce.max(Duration::from_millis(50)));

    loop {
      tokio::select! {
        biased;

        _ = self.cancel.cancelled() => {
          info!("Watcher shutting down");
          break;
        }

        event = self.event_rx.recv() => {
          match event {
            Some(Ok(event)) => self.process_event(&mut pending, event),
            Some(Err(e)) => warn!(error = %e, "Watcher error"),
            None => {
              info!("Watcher channel closed");
              break;
            }
          }
        }

        _ = debounce_interval.tick() => {
          self.flush_settled(&mut pending).await;
        }
      }
    }

    // Deliver whatever is still pending so shutdown loses nothing.
    for (path, change) in pending.drain() {
      self.send_change(path, change.kind).await;
    }
  }

  fn relevant(&self, path: &PathBuf) -> bool {
    if path.is_dir() {
      return false;
    }
    let hidden = self
      .config
      .roots
      .iter()
      .any(|root| self.filter.hidden_below(root, path));
    !hidden && self.filter.accepts(path)
  }

  fn process_event(&mut self, pending: &mut HashMap<PathBuf, PendingChange>, event: Event) {
    let kinds: Vec<(PathBuf, ChangeKind)> = match event.kind {
      EventKind::Create(_) | EventKind::Modify(_) => event
        .paths
        .iter()
        .filter_map(|path| {
          // A rename's old path no longer exists; emit a delete for it.
          if !path.exists() {
            return Some((path.clone(), ChangeKind::Deleted));
          }
          self.relevant(path).then(|| (path.clone(), ChangeKind::Upsert))
        })
        .collect(),
      EventKind::Remove(_) => event.paths.iter().map(|p| (p.clone(), ChangeKind::Deleted)).collect(),
      EventKind::Access(_) | EventKind::Any | EventKind::Other => {
        trace!(kind = ?event.kind, "Ignoring event");
        Vec::new()
      }
    };

    for (path, kind) in kinds {
      debug!(path = %path.display(), ?kind, "File event");
      if let Some(existing) = pending.get_mut(&path) {
        existing.update(kind);
      } else {
        pending.insert(path, PendingChange::new(kind));
      }
    }
  }

  /// Forward changes whose debounce window has passed.
  async fn flush_settled(&mut self, pending: &mut HashMap<PathBuf, PendingChange>) {
    let now = Instant::now();
    let settled: Vec<PathBuf> = pending
      .iter()
      .filter(|(_, change)| now.duration_since(change.last_event) >= self.config.debounce)
      .map(|(path, _)| path.clone())
      .collect();

    for path in settled {
      if let Some(change) = pending.remove(&path) {
        self.send_change(path, change.kind).await;
      }
    }
  }

  async fn send_change(&self, path: PathBuf, kind: ChangeKind) {
    let job = match kind {
      ChangeKind::Upsert => FileJob::Index { path },
      ChangeKind::Deleted => FileJob::Delete { path },
    };
    if let Err(e) = self.pipeline.enqueue(job).await {
      warn!(error = %e, "Failed to enqueue watcher job");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn delete_then_create_coalesces_to_upsert() {
    let mut pending = PendingChange::new(ChangeKind::Deleted);
    pending.update(ChangeKind::Upsert);
    assert_eq!(pending.kind, ChangeKind::Upsert);
  }

  #[test]
  fn create_then_delete_coalesces_to_delete() {
    let mut pending = PendingChange::new(ChangeKind::Upsert);
    pending.update(ChangeKind::Deleted);
    assert_eq!(pending.kind, ChangeKind::Deleted);
  }
}
