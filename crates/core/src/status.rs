//! The per-path ledger entry describing how a file is represented in the index.

use serde::{Deserialize, Serialize};

/// Indexing state of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
  /// Waiting in the file queue.
  Queued,
  /// Chunks are present and current.
  Indexed,
  /// The parser rejected the file (e.g. a scanned PDF). Not retried until
  /// the parser version for its extension increases.
  Failed,
  /// A downstream error (embedding or write) left the file unindexed.
  Error,
  /// Indexed under an older parser version; re-index pending.
  Outdated,
}

impl FileStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      FileStatus::Queued => "queued",
      FileStatus::Indexed => "indexed",
      FileStatus::Failed => "failed",
      FileStatus::Error => "error",
      FileStatus::Outdated => "outdated",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "queued" => Some(FileStatus::Queued),
      "indexed" => Some(FileStatus::Indexed),
      "failed" => Some(FileStatus::Failed),
      "error" => Some(FileStatus::Error),
      "outdated" => Some(FileStatus::Outdated),
      _ => None,
    }
  }
}

/// One row of the file-status ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStatusRow {
  pub path: String,
  pub status: FileStatus,
  /// Parser version recorded at index time.
  pub parser_version: u32,
  pub chunk_count: u32,
  pub error_message: Option<String>,
  /// File mtime in unix ms.
  pub last_modified: i64,
  /// When the file last completed indexing, unix ms (0 = never).
  pub indexed_at: i64,
  /// When a failed file was last retried, unix ms (0 = never).
  pub last_retry: i64,
  /// Digest of `(size, mtime, path)`.
  pub file_hash: String,
}
