//! Embedder worker process.
//!
//! One worker hosts one embedding model instance. The parent speaks
//! length-prefixed JSON frames (4-byte big-endian length) over stdin/stdout;
//! logs go to stderr so the frame stream stays clean. The worker exits 0
//! voluntarily once its batch or memory limits are reached; the parent's
//! pool treats that as an ordinary restart.

mod frames;
mod model;

use std::io::Write;
use std::path::PathBuf;

use ipc::{WorkerReply, WorkerRequest};
use tracing::{error, info, warn};

use crate::frames::{read_frame, write_frame};
use crate::model::{OnnxEmbedder, ensure_model};

/// Voluntary exit after this many embed requests.
const MAX_BATCHES_PER_LIFE: u64 = 2000;
/// Voluntary exit once RSS exceeds this.
const MAX_RSS_BYTES: u64 = 1024 * 1024 * 1024;

fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_writer(std::io::stderr)
    .init();

  if let Err(message) = run() {
    error!(message, "Worker fatal error");
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let _ = write_frame(&mut out, &WorkerReply::Fatal { message });
    let _ = out.flush();
    std::process::exit(1);
  }
}

fn run() -> Result<(), String> {
  let stdin = std::io::stdin();
  let stdout = std::io::stdout();
  let mut input = stdin.lock();
  let mut output = stdout.lock();

  // First frame must be init; everything before a model exists is refused.
  let mut embedder: Option<OnnxEmbedder> = None;
  let mut files_processed: u64 = 0;

  loop {
    let request = match read_frame::<WorkerRequest>(&mut input) {
      Ok(Some(request)) => request,
      // Parent closed the pipe: normal teardown.
      Ok(None) => {
        info!("stdin closed, exiting");
        return Ok(());
      }
      Err(e) => return Err(format!("frame read failed: {e}")),
    };

    match request {
      WorkerRequest::Init { model_name, cache_dir } => {
        let cache_dir = PathBuf::from(cache_dir);
        let files = ensure_model(&model_name, &cache_dir, |loaded, total| {
          let _ = write_frame(&mut output, &WorkerReply::DownloadProgress { loaded, total });
          let _ = output.flush();
        })
        .map_err(|e| e.to_string())?;

        let loaded = OnnxEmbedder::load(&files).map_err(|e| e.to_string())?;
        info!(model = model_name, dim = loaded.dim(), "Model loaded");
        write_frame(&mut output, &WorkerReply::Ready { dim: loaded.dim() }).map_err(|e| e.to_string())?;
        output.flush().map_err(|e| e.to_string())?;
        embedder = Some(loaded);
      }

      WorkerRequest::Embed { id, texts, is_query } => {
        let Some(embedder) = embedder.as_mut() else {
          write_frame(
            &mut output,
            &WorkerReply::EmbedErr {
              id,
              message: "not initialized".to_string(),
            },
          )
          .map_err(|e| e.to_string())?;
          output.flush().map_err(|e| e.to_string())?;
          continue;
        };

        // Query texts are embedded as-is; any model-specific query prefix is
        // applied by the caller, which knows the model's documentation.
        let _ = is_query;
        let reply = match embedder.embed_batch(&texts) {
          Ok(vectors) => WorkerReply::EmbedOk { id, vectors },
          Err(e) => {
            warn!(id, error = %e, "Embed failed");
            WorkerReply::EmbedErr {
              id,
              message: e.to_string(),
            }
          }
        };
        write_frame(&mut output, &reply).map_err(|e| e.to_string())?;
        output.flush().map_err(|e| e.to_string())?;

        files_processed += 1;
        let rss = resident_bytes();
        if files_processed >= MAX_BATCHES_PER_LIFE || rss >= MAX_RSS_BYTES {
          info!(files_processed, rss, "Limits reached, exiting voluntarily");
          return Ok(());
        }
      }

      WorkerRequest::Health { id } => {
        write_frame(
          &mut output,
          &WorkerReply::HealthOk {
            id,
            rss_bytes: resident_bytes(),
            files_processed,
          },
        )
        .map_err(|e| e.to_string())?;
        output.flush().map_err(|e| e.to_string())?;
      }

      WorkerRequest::Shutdown => {
        info!("Shutdown requested");
        return Ok(());
      }
    }
  }
}

/// Resident set size in bytes; 0 where /proc is unavailable.
fn resident_bytes() -> u64 {
  #[cfg(target_os = "linux")]
  {
    if let Ok(statm) = std::fs::read_to_string("/proc/self/statm") {
      let fields: Vec<&str> = statm.split_whitespace().collect();
      if fields.len() >= 2
        && let Ok(pages) = fields[1].parse::<u64>()
      {
        return pages * 4096;
      }
    }
  }
  0
}
