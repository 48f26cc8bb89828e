use serde::{Deserialize, Serialize};

use crate::Method;

/// Request envelope: newline-delimited JSON over the daemon socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request<P = serde_json::Value> {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<u64>,
  pub method: Method,
  #[serde(default)]
  pub params: P,
}

/// Response envelope. `progress` carries unsolicited events pushed to
/// subscribed connections; such frames have no `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response<R = serde_json::Value> {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub id: Option<u64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub result: Option<R>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<RpcError>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub progress: Option<ProgressEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
  pub code: i32,
  pub message: String,
}

impl<R: Serialize> Response<R> {
  pub fn success(id: Option<u64>, result: R) -> Self {
    Self {
      id,
      result: Some(result),
      error: None,
      progress: None,
    }
  }
}

impl Response<()> {
  pub fn error(id: Option<u64>, code: i32, message: &str) -> Self {
    Self {
      id,
      result: None,
      error: Some(RpcError {
        code,
        message: message.to_string(),
      }),
      progress: None,
    }
  }

  pub fn event(progress: ProgressEvent) -> Self {
    Self {
      id: None,
      result: None,
      error: None,
      progress: Some(progress),
    }
  }
}

/// Unsolicited events pushed from the core to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressEvent {
  /// Periodic pipeline snapshot.
  Indexing {
    stage: String,
    queued: u64,
    processing: u64,
    done: u64,
    errors: u64,
  },
  /// Per-file chunk progress.
  File {
    path: String,
    chunks_done: u32,
    chunks_total: u32,
  },
  /// Model artifact download progress.
  ModelDownload { loaded: u64, total: u64 },
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn request_round_trips() {
    let req = Request {
      id: Some(7),
      method: Method::Search,
      params: serde_json::json!({"q": "hello", "k": 5}),
    };
    let json = serde_json::to_string(&req).unwrap();
    let back: Request = serde_json::from_str(&json).unwrap();
    assert_eq!(back.id, Some(7));
    assert_eq!(back.method, Method::Search);
  }

  #[test]
  fn progress_events_are_tagged() {
    let event = ProgressEvent::ModelDownload { loaded: 10, total: 100 };
    let json = serde_json::to_string(&Response::event(event)).unwrap();
    assert!(json.contains("\"kind\":\"model_download\""));
    assert!(!json.contains("\"id\""));
  }

  #[test]
  fn unknown_request_fields_are_ignored() {
    let json = r#"{"id":1,"method":"stats","params":{},"extra":true}"#;
    let req: Request = serde_json::from_str(json).unwrap();
    assert_eq!(req.method, Method::Stats);
  }
}
