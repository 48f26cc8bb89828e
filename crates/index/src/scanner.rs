//! Initial filesystem scan: parallel walk with excludes and extension
//! filtering.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::UNIX_EPOCH;

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use rayon::prelude::*;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ScanError {
  #[error("Bad exclude pattern: {0}")]
  Pattern(#[from] globset::Error),
}

/// A regular file that passed every filter.
#[derive(Debug, Clone)]
pub struct ScannedFile {
  pub path: PathBuf,
  pub extension: String,
  pub size: u64,
  /// Unix ms.
  pub mtime: i64,
}

/// Directory names excluded regardless of user patterns: system folders and
/// package bundles whose contents are not user documents.
pub fn default_excludes() -> Vec<String> {
  [
    "**/node_modules/**",
    "**/.git/**",
    "**/target/**",
    "**/__pycache__/**",
    "**/.venv/**",
    "**/Library/**",
    "**/AppData/**",
    "**/*.app/**",
    "**/*.bundle/**",
    "**/*.framework/**",
  ]
  .iter()
  .map(|s| s.to_string())
  .collect()
}

/// Filter shared by the scanner and the watcher.
#[derive(Clone)]
pub struct ScanFilter {
  excludes: GlobSet,
  enabled_extension: std::sync::Arc<dyn Fn(&str) -> bool + Send + Sync>,
  max_file_size: u64,
}

impl ScanFilter {
  pub fn new(
    user_patterns: &[String],
    enabled_extension: std::sync::Arc<dyn Fn(&str) -> bool + Send + Sync>,
    max_file_size: u64,
  ) -> Result<Self, ScanError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in default_excludes().iter().chain(user_patterns) {
      builder.add(Glob::new(pattern)?);
    }
    Ok(Self {
      excludes: builder.build()?,
      enabled_extension,
      max_file_size,
    })
  }

  /// Whether `path` is an indexable candidate (extension enabled, not
  /// excluded). Size is checked separately where metadata is available;
  /// hidden-directory filtering is relative to a root (see
  /// [`ScanFilter::hidden_below`]) because the walker already handles it
  /// during scans.
  pub fn accepts(&self, path: &Path) -> bool {
    if self.excludes.is_match(path) {
      return false;
    }
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
      return false;
    };
    let ext = ext.to_ascii_lowercase();
    parser::is_supported_extension(&ext) && (self.enabled_extension)(&ext)
  }

  /// True when any component of `path` below `root` is dot-prefixed.
  pub fn hidden_below(&self, root: &Path, path: &Path) -> bool {
    path
      .strip_prefix(root)
      .map(|rel| {
        rel
          .components()
          .any(|c| c.as_os_str().to_string_lossy().starts_with('.'))
      })
      .unwrap_or(false)
  }

  pub fn size_ok(&self, size: u64) -> bool {
    size > 0 && size <= self.max_file_size
  }
}

/// Parallel scanner over one root.
pub struct Scanner {
  filter: ScanFilter,
}

impl Scanner {
  pub fn new(filter: ScanFilter) -> Self {
    Self { filter }
  }

  /// Walk `root`, yielding every regular file that passes the filter.
  /// Hidden directories are skipped by the walker itself.
  pub fn scan(&self, root: &Path) -> Vec<ScannedFile> {
    let walker = WalkBuilder::new(root)
      .follow_links(false)
      .hidden(true)
      .git_ignore(false)
      .git_global(false)
      .git_exclude(false)
      .build();

    let results = Mutex::new(Vec::new());
    walker
      .filter_map(|entry| entry.ok())
      .par_bridge()
      .for_each(|entry| {
        if entry.file_type().is_none_or(|ft| !ft.is_file()) {
          return;
        }
        let path = entry.path();
        if !self.filter.accepts(path) {
          return;
        }
        let Ok(metadata) = entry.metadata() else {
          return;
        };
        if !self.filter.size_ok(metadata.len()) {
          return;
        }
        let mtime = metadata
          .modified()
          .ok()
          .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
          .map(|d| d.as_millis() as i64)
          .unwrap_or(0);
        let extension = path
          .extension()
          .and_then(|e| e.to_str())
          .map(|e| e.to_ascii_lowercase())
          .unwrap_or_default();

        results.lock().expect("scan results").push(ScannedFile {
          path: path.to_path_buf(),
          extension,
          size: metadata.len(),
          mtime,
        });
      });

    let mut files = results.into_inner().expect("scan results");
    // Deterministic order for tests and stable queueing.
    files.sort_by(|a, b| a.path.cmp(&b.path));
    debug!(root = %root.display(), files = files.len(), "Scan complete");
    files
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  fn filter(user: &[String]) -> ScanFilter {
    ScanFilter::new(user, Arc::new(|_| true), 10 * 1024 * 1024).unwrap()
  }

  fn touch(dir: &Path, rel: &str, content: &str) {
    let path = dir.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
  }

  #[test]
  fn finds_supported_files_only() {
    let tmp = tempfile::TempDir::new().unwrap();
    touch(tmp.path(), "a.txt", "hello");
    touch(tmp.path(), "b.md", "# hi");
    touch(tmp.path(), "c.exe", "binary");
    touch(tmp.path(), "sub/d.pdf", "%PDF");

    let files = Scanner::new(filter(&[])).scan(tmp.path());
    let names: Vec<String> = files
      .iter()
      .map(|f| f.path.file_name().unwrap().to_string_lossy().into_owned())
      .collect();
    assert_eq!(names, vec!["a.txt", "b.md", "d.pdf"]);
  }

  #[test]
  fn default_excludes_hide_system_dirs() {
    let tmp = tempfile::TempDir::new().unwrap();
    touch(tmp.path(), "keep.txt", "x");
    touch(tmp.path(), "node_modules/skip.txt", "x");
    touch(tmp.path(), "My.app/skip.txt", "x");

    let files = Scanner::new(filter(&[])).scan(tmp.path());
    assert_eq!(files.len(), 1);
    assert!(files[0].path.ends_with("keep.txt"));
  }

  #[test]
  fn user_patterns_apply() {
    let tmp = tempfile::TempDir::new().unwrap();
    touch(tmp.path(), "keep.txt", "x");
    touch(tmp.path(), "drafts/skip.txt", "x");

    let files = Scanner::new(filter(&["**/drafts/**".to_string()])).scan(tmp.path());
    assert_eq!(files.len(), 1);
  }

  #[test]
  fn hidden_directories_are_skipped() {
    let tmp = tempfile::TempDir::new().unwrap();
    touch(tmp.path(), ".hidden/skip.txt", "x");
    touch(tmp.path(), "visible.txt", "x");

    let files = Scanner::new(filter(&[])).scan(tmp.path());
    assert_eq!(files.len(), 1);
  }

  #[test]
  fn disabled_extensions_are_skipped() {
    let tmp = tempfile::TempDir::new().unwrap();
    touch(tmp.path(), "a.txt", "x");
    touch(tmp.path(), "b.pdf", "x");

    let filter = ScanFilter::new(&[], Arc::new(|ext: &str| ext != "pdf"), 1024).unwrap();
    let files = Scanner::new(filter).scan(tmp.path());
    assert_eq!(files.len(), 1);
    assert!(files[0].path.ends_with("a.txt"));
  }

  #[test]
  fn empty_files_are_skipped() {
    let tmp = tempfile::TempDir::new().unwrap();
    touch(tmp.path(), "empty.txt", "");
    touch(tmp.path(), "full.txt", "content");

    let files = Scanner::new(filter(&[])).scan(tmp.path());
    assert_eq!(files.len(), 1);
  }
}
