use serde::{Deserialize, Serialize};

use lodestone_core::Settings;

/// One ranked search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
  pub id: String,
  pub path: String,
  pub page: u32,
  pub offset: u32,
  pub text: String,
  pub score: f32,
  pub title: String,
}

/// Snapshot returned by `progress`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressSnapshot {
  pub queued: u64,
  pub processing: u64,
  pub done: u64,
  pub errors: u64,
  pub paused: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderStats {
  pub path: String,
  pub indexed_files: u64,
  pub total_chunks: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsResult {
  pub total_chunks: u64,
  pub indexed_files: u64,
  pub folder_stats: Vec<FolderStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsResult {
  pub settings: Settings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchedFoldersResult {
  pub folders: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitResult {
  pub model_ready: bool,
  pub schema_version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostics {
  pub state: String,
  pub workers_alive: usize,
  pub queue_depth: usize,
}

/// Outcome of one shutdown step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownStep {
  pub name: String,
  pub ok: bool,
  pub timed_out: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub detail: Option<String>,
}

/// Final report of the ordered shutdown sequence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShutdownReport {
  pub steps: Vec<ShutdownStep>,
}

impl ShutdownReport {
  pub fn push(&mut self, name: &str, ok: bool, timed_out: bool, detail: Option<String>) {
    self.steps.push(ShutdownStep {
      name: name.to_string(),
      ok,
      timed_out,
      detail,
    });
  }

  pub fn clean(&self) -> bool {
    self.steps.iter().all(|s| s.ok && !s.timed_out)
  }
}
