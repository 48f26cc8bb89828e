use serde::{Deserialize, Serialize};

use lodestone_core::Settings;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitParams {
  pub db_dir: String,
  pub user_data_dir: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchOptions {
  #[serde(default)]
  pub include: Vec<String>,
  #[serde(default)]
  pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchStartParams {
  pub roots: Vec<String>,
  #[serde(default)]
  pub options: WatchOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueParams {
  pub paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchParams {
  pub q: String,
  #[serde(default = "default_k")]
  pub k: usize,
}

fn default_k() -> usize {
  10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateSettingsParams {
  pub settings: Settings,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn search_params_default_k() {
    let params: SearchParams = serde_json::from_str(r#"{"q":"hello"}"#).unwrap();
    assert_eq!(params.k, 10);
  }

  #[test]
  fn watch_options_default_empty() {
    let params: WatchStartParams = serde_json::from_str(r#"{"roots":["/docs"]}"#).unwrap();
    assert!(params.options.include.is_empty());
    assert!(params.options.exclude.is_empty());
  }
}
