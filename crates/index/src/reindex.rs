//! Re-index policy: parser-upgrade and failure-retry detection.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use db::{WriteQueue, WriteTask};
use lodestone_core::{FileStatus, FileStatusRow};
use tracing::{debug, info};

use crate::pipeline::{FileJob, PipelineHandle};

/// Failed files wait this long between retry attempts.
const RETRY_INTERVAL_MS: i64 = 24 * 60 * 60 * 1000;

/// Whether a file must be (re-)indexed.
pub fn should_reindex(row: Option<&FileStatusRow>, current_hash: &str, current_version: u32, now_ms: i64) -> bool {
  let Some(row) = row else {
    return true;
  };

  if row.file_hash != current_hash {
    return true;
  }
  if row.parser_version < current_version {
    return true;
  }
  if matches!(row.status, FileStatus::Failed | FileStatus::Error)
    && now_ms - row.last_retry > RETRY_INTERVAL_MS
    && current_version > row.parser_version
  {
    return true;
  }
  false
}

/// Startup sweep over the ledger: mark rows indexed under an older parser as
/// `outdated` and prepend them to the file queue so upgrades flow through
/// ahead of new work. Rows whose file no longer exists are cleaned up.
pub struct ReindexService {
  store: Arc<db::VectorStore>,
  writes: WriteQueue,
}

impl ReindexService {
  pub fn new(store: Arc<db::VectorStore>, writes: WriteQueue) -> Self {
    Self { store, writes }
  }

  pub async fn startup_walk(&self, pipeline: &PipelineHandle) -> db::Result<usize> {
    let rows = self.store.all_statuses().await?;
    let now = Utc::now().timestamp_millis();
    let mut upgrades: Vec<FileJob> = Vec::new();

    for row in rows {
      let path = PathBuf::from(&row.path);
      if !path.exists() {
        debug!(path = %row.path, "Ledger row for missing file, removing");
        let _ = pipeline.enqueue(FileJob::Delete { path }).await;
        continue;
      }

      let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
      let current_version = parser::current_parser_version(&extension);
      if current_version == 0 {
        continue;
      }

      let outdated = row.parser_version < current_version;
      let retry_due = matches!(row.status, FileStatus::Failed | FileStatus::Error)
        && current_version > row.parser_version
        && now - row.last_retry > RETRY_INTERVAL_MS;

      if outdated || retry_due {
        let mut marked = row.clone();
        marked.status = FileStatus::Outdated;
        self
          .writes
          .submit(WriteTask::UpsertStatus { row: Box::new(marked) })
          .await;
        upgrades.push(FileJob::Index { path });
      }
    }

    let count = upgrades.len();
    if count > 0 {
      info!(count, "Queueing parser-upgrade re-indexing ahead of new work");
      pipeline.enqueue_front(upgrades);
    }
    Ok(count)
  }
}
