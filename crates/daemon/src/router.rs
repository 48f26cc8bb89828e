//! Request dispatch: one exhaustive match over [`Method`], with the
//! lifecycle whitelist applied before anything runs.

use std::sync::Arc;

use ipc::{
  EnqueueParams, InitResult, Method, Request, Response, SearchParams, SettingsResult, UpdateSettingsParams,
  WatchStartParams, WatchedFoldersResult,
};
use serde_json::Value;
use tracing::debug;

use crate::DaemonCore;
use crate::state::LifecycleState;

/// Error codes on the wire.
const CODE_BAD_REQUEST: i32 = -32600;
const CODE_WRONG_STATE: i32 = -32001;
const CODE_INTERNAL: i32 = -32603;

pub struct Router {
  core: Arc<DaemonCore>,
}

impl Router {
  pub fn new(core: Arc<DaemonCore>) -> Self {
    Self { core }
  }

  pub fn core(&self) -> &Arc<DaemonCore> {
    &self.core
  }

  pub async fn dispatch(&self, request: Request) -> Response {
    let id = request.id;
    let method = request.method;
    debug!(?method, id, "Dispatching request");

    let state = self.core.state();
    if state != LifecycleState::Ready && !method.allowed_uninitialized() {
      return err(
        id,
        CODE_WRONG_STATE,
        &format!("daemon is {}, not ready", state.as_str()),
      );
    }

    match method {
      Method::Init => match self.core.state() {
        // A second init is answered with the live state.
        LifecycleState::Ready => ok(
          id,
          &InitResult {
            model_ready: true,
            schema_version: self.core.schema_version().await,
          },
        ),
        _ => match self.core.init().await {
          Ok(result) => ok(id, &result),
          Err(e) => err(id, CODE_INTERNAL, &e.to_string()),
        },
      },

      Method::CheckModel => {
        let diagnostics = self.core.diagnostics().await;
        ok(id, &serde_json::json!({ "workers_alive": diagnostics.workers_alive }))
      }

      Method::GetDiagnostics => ok(id, &self.core.diagnostics().await),

      Method::WatchStart => {
        let params: WatchStartParams = match parse(request.params) {
          Ok(p) => p,
          Err(e) => return err(id, CODE_BAD_REQUEST, &e),
        };
        match self.core.watch_start(params.roots, params.options).await {
          Ok(()) => ok(id, &serde_json::json!({ "ok": true })),
          Err(e) => err(id, CODE_INTERNAL, &e),
        }
      }

      Method::Enqueue => {
        let params: EnqueueParams = match parse(request.params) {
          Ok(p) => p,
          Err(e) => return err(id, CODE_BAD_REQUEST, &e),
        };
        match self.core.enqueue(params.paths).await {
          Ok(count) => ok(id, &serde_json::json!({ "queued": count })),
          Err(e) => err(id, CODE_INTERNAL, &e),
        }
      }

      Method::Pause => match self.core.set_paused(true).await {
        Ok(()) => ok(id, &serde_json::json!({ "ok": true })),
        Err(e) => err(id, CODE_INTERNAL, &e),
      },

      Method::Resume => match self.core.set_paused(false).await {
        Ok(()) => ok(id, &serde_json::json!({ "ok": true })),
        Err(e) => err(id, CODE_INTERNAL, &e),
      },

      Method::Progress => ok(id, &self.core.progress().await),

      Method::ReindexAll => match self.core.reindex_all().await {
        Ok(()) => ok(id, &serde_json::json!({ "ok": true })),
        Err(e) => err(id, CODE_INTERNAL, &e),
      },

      Method::Search => {
        let params: SearchParams = match parse(request.params) {
          Ok(p) => p,
          Err(e) => return err(id, CODE_BAD_REQUEST, &e),
        };
        match self.core.search(&params.q, params.k).await {
          Ok(hits) => ok(id, &hits),
          Err(e) => err(id, CODE_INTERNAL, &e),
        }
      }

      Method::Stats => match self.core.stats().await {
        Ok(stats) => ok(id, &stats),
        Err(e) => err(id, CODE_INTERNAL, &e),
      },

      Method::GetSettings => ok(
        id,
        &SettingsResult {
          settings: self.core.settings(),
        },
      ),

      Method::UpdateSettings => {
        let params: UpdateSettingsParams = match parse(request.params) {
          Ok(p) => p,
          Err(e) => return err(id, CODE_BAD_REQUEST, &e),
        };
        match self.core.update_settings(params.settings) {
          Ok(()) => ok(id, &serde_json::json!({ "ok": true })),
          Err(e) => err(id, CODE_INTERNAL, &e),
        }
      }

      Method::GetWatchedFolders => ok(
        id,
        &WatchedFoldersResult {
          folders: self.core.watched_folders(),
        },
      ),

      Method::Shutdown => {
        let report = self.core.shutdown().await;
        ok(id, &report)
      }
    }
  }
}

fn parse<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, String> {
  serde_json::from_value(params).map_err(|e| format!("bad params: {e}"))
}

fn ok<T: serde::Serialize>(id: Option<u64>, result: &T) -> Response {
  match serde_json::to_value(result) {
    Ok(value) => Response {
      id,
      result: Some(value),
      error: None,
      progress: None,
    },
    Err(e) => err(id, CODE_INTERNAL, &format!("serialize: {e}")),
  }
}

fn err(id: Option<u64>, code: i32, message: &str) -> Response {
  let response = Response::<()>::error(id, code, message);
  Response {
    id: response.id,
    result: None,
    error: response.error,
    progress: None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use lodestone_core::UserDataDirs;

  fn router() -> (tempfile::TempDir, Router) {
    let tmp = tempfile::TempDir::new().unwrap();
    let core = DaemonCore::new(UserDataDirs::new(tmp.path().join("ud")), None);
    (tmp, Router::new(core))
  }

  fn request(method: Method, params: Value) -> Request {
    Request {
      id: Some(1),
      method,
      params,
    }
  }

  #[tokio::test]
  async fn non_whitelisted_methods_rejected_before_init() {
    let (_tmp, router) = router();
    let response = router
      .dispatch(request(Method::Search, serde_json::json!({"q": "x"})))
      .await;
    let error = response.error.unwrap();
    assert_eq!(error.code, CODE_WRONG_STATE);
    assert!(error.message.contains("uninitialized"));
  }

  #[tokio::test]
  async fn whitelisted_probes_work_before_init() {
    let (_tmp, router) = router();
    let response = router.dispatch(request(Method::GetDiagnostics, Value::Null)).await;
    assert!(response.error.is_none());
    let result = response.result.unwrap();
    assert_eq!(result["state"], "uninitialized");
  }

  #[tokio::test]
  async fn bad_params_are_a_typed_error() {
    let (_tmp, router) = router();
    // GetDiagnostics is whitelisted so the router reaches param parsing for
    // watch_start only after init; probe the parse path via a ready check.
    let response = router
      .dispatch(request(Method::WatchStart, serde_json::json!({"bogus": 1})))
      .await;
    // Not ready yet: the state gate fires first.
    assert_eq!(response.error.unwrap().code, CODE_WRONG_STATE);
  }
}
