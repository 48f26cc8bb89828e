//! Persisted configuration (`<user_data>/config.json`).
//!
//! Loaded once at startup; rewritten atomically (write-temp-rename) after any
//! user-initiated change. A malformed or unreadable file falls back to
//! defaults with a warning rather than refusing to start.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Config file format version.
pub const CONFIG_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("Malformed config: {0}")]
  Malformed(#[from] serde_json::Error),
}

/// One watched root folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedFolder {
  pub path: PathBuf,
  /// Unix ms when the folder was added.
  pub added_at: i64,
}

/// Embedder pool and batching settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedderConfig {
  /// Number of embedder worker processes (0 = derive from hardware).
  pub pool_size: usize,
  /// Model identifier passed to the worker.
  pub model: String,
  /// Embedding dimension the model produces.
  pub dimensions: usize,
  /// Worker restarts after this many files.
  pub files_per_worker: u64,
  /// Worker restarts when sampled RSS exceeds this many bytes.
  pub max_worker_rss_bytes: u64,
  /// Upper bound on texts per embedding batch.
  pub max_batch_len: usize,
  /// Estimated-token budget per embedding batch.
  pub max_tokens_per_batch: usize,
  /// Query prefix documented by the model, applied only in the search path.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub query_prefix: Option<String>,
}

impl Default for EmbedderConfig {
  fn default() -> Self {
    Self {
      pool_size: 0,
      model: "sentence-transformers/all-MiniLM-L6-v2".to_string(),
      dimensions: 384,
      files_per_worker: 200,
      max_worker_rss_bytes: 1024 * 1024 * 1024,
      max_batch_len: 32,
      max_tokens_per_batch: 8000,
      query_prefix: None,
    }
  }
}

/// Scan, watch and pipeline settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
  /// Glob patterns excluded from scanning and watching.
  pub excluded_patterns: Vec<String>,
  /// Per-extension enable flags; extensions absent here use the parser
  /// registry's default.
  pub file_types: HashMap<String, bool>,
  /// Files parsed in parallel (0 = derive from hardware).
  pub cpu_concurrency: usize,
  /// Watcher debounce per path in milliseconds.
  pub debounce_ms: u64,
  /// Embedding queue capacity in chunks.
  pub max_queue_size: usize,
  /// Concurrent embedding batches in flight.
  pub max_concurrent_batches: usize,
  /// Per-batch retry ceiling before the batch is dropped.
  pub max_retries: u32,
  /// Maximum file size considered for indexing, in bytes.
  pub max_file_size: u64,
}

impl Default for IndexingConfig {
  fn default() -> Self {
    Self {
      excluded_patterns: Vec::new(),
      file_types: HashMap::new(),
      cpu_concurrency: 0,
      debounce_ms: 500,
      max_queue_size: 2000,
      max_concurrent_batches: 2,
      max_retries: 3,
      max_file_size: 50 * 1024 * 1024,
    }
  }
}

/// User-tunable settings, nested under `settings` in the file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
  pub embedder: EmbedderConfig,
  pub indexing: IndexingConfig,
}

/// Top-level persisted document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  pub version: u32,
  pub watched_folders: Vec<WatchedFolder>,
  pub settings: Settings,
  /// Unix ms of the last save.
  pub last_updated: i64,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      version: CONFIG_VERSION,
      watched_folders: Vec::new(),
      settings: Settings::default(),
      last_updated: 0,
    }
  }
}

impl Config {
  /// Load from `path`, falling back to defaults on any error.
  pub fn load_or_default(path: &Path) -> Self {
    match Self::load(path) {
      Ok(config) => config,
      Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
      Err(e) => {
        warn!(path = %path.display(), error = %e, "Failed to load config, using defaults");
        Self::default()
      }
    }
  }

  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
  }

  /// Persist atomically: write to `<path>.tmp`, then rename over `path`.
  pub fn save(&mut self, path: &Path) -> Result<(), ConfigError> {
    self.last_updated = chrono::Utc::now().timestamp_millis();

    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_vec_pretty(self)?;
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
  }

  /// Whether `ext` (lowercase, no dot) is enabled, given the registry default.
  pub fn extension_enabled(&self, ext: &str, default: bool) -> bool {
    self
      .settings
      .indexing
      .file_types
      .get(ext)
      .copied()
      .unwrap_or(default)
  }
}
