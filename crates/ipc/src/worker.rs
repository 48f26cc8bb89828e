//! Wire messages between the daemon and an embedder worker process.
//!
//! Frames are length-prefixed JSON over the child's stdin/stdout. Every
//! request carries a monotonic id; every reply references it. Unsolicited
//! replies (`Ready`, `DownloadProgress`, `Fatal`) carry no id. Unknown
//! fields are ignored on both sides so either end can evolve first.

use serde::{Deserialize, Serialize};

/// Parent → worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerRequest {
  Init {
    model_name: String,
    cache_dir: String,
  },
  Embed {
    id: u64,
    texts: Vec<String>,
    #[serde(default)]
    is_query: bool,
  },
  Health {
    id: u64,
  },
  Shutdown,
}

/// Worker → parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerReply {
  /// Model loaded; the worker will answer `Embed` from here on.
  Ready { dim: usize },
  EmbedOk { id: u64, vectors: Vec<Vec<f32>> },
  EmbedErr { id: u64, message: String },
  HealthOk {
    id: u64,
    rss_bytes: u64,
    files_processed: u64,
  },
  DownloadProgress { loaded: u64, total: u64 },
  /// Unrecoverable worker error; the process exits after sending this.
  Fatal { message: String },
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn embed_request_round_trips() {
    let req = WorkerRequest::Embed {
      id: 3,
      texts: vec!["hello".to_string()],
      is_query: true,
    };
    let json = serde_json::to_string(&req).unwrap();
    assert!(json.contains("\"kind\":\"embed\""));
    assert_eq!(serde_json::from_str::<WorkerRequest>(&json).unwrap(), req);
  }

  #[test]
  fn replies_tolerate_unknown_fields() {
    let json = r#"{"kind":"embed_ok","id":1,"vectors":[[0.5,0.5]],"elapsed_ms":12}"#;
    let reply: WorkerReply = serde_json::from_str(json).unwrap();
    assert_eq!(
      reply,
      WorkerReply::EmbedOk {
        id: 1,
        vectors: vec![vec![0.5, 0.5]],
      }
    );
  }

  #[test]
  fn is_query_defaults_false() {
    let json = r#"{"kind":"embed","id":1,"texts":["x"]}"#;
    match serde_json::from_str::<WorkerRequest>(json).unwrap() {
      WorkerRequest::Embed { is_query, .. } => assert!(!is_query),
      other => panic!("unexpected request {other:?}"),
    }
  }
}
