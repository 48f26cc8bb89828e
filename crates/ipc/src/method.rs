use serde::{Deserialize, Serialize};

/// Every request the daemon understands.
///
/// Lifecycle gating: outside the READY state only `Init`, `CheckModel` and
/// `GetDiagnostics` are handled; everything else is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
  // Lifecycle
  Init,
  CheckModel,
  GetDiagnostics,
  Shutdown,
  // Indexing
  WatchStart,
  Enqueue,
  Pause,
  Resume,
  Progress,
  ReindexAll,
  // Query
  Search,
  Stats,
  // Settings
  GetSettings,
  UpdateSettings,
  GetWatchedFolders,
}

impl Method {
  /// Methods accepted before initialization completes.
  pub fn allowed_uninitialized(&self) -> bool {
    matches!(self, Method::Init | Method::CheckModel | Method::GetDiagnostics)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn method_serializes_snake_case() {
    assert_eq!(serde_json::to_string(&Method::WatchStart).unwrap(), "\"watch_start\"");
    assert_eq!(
      serde_json::from_str::<Method>("\"reindex_all\"").unwrap(),
      Method::ReindexAll
    );
  }

  #[test]
  fn whitelist_covers_only_lifecycle_probes() {
    assert!(Method::Init.allowed_uninitialized());
    assert!(Method::CheckModel.allowed_uninitialized());
    assert!(Method::GetDiagnostics.allowed_uninitialized());
    assert!(!Method::Search.allowed_uninitialized());
    assert!(!Method::WatchStart.allowed_uninitialized());
  }
}
