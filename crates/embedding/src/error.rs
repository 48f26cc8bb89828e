use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum EmbedError {
  #[error("Embed request timed out")]
  Timeout,

  #[error("Worker crashed: {0}")]
  WorkerCrash(String),

  #[error("Protocol error: {0}")]
  Protocol(String),

  #[error("Failed to spawn worker: {0}")]
  Spawn(String),

  #[error("No ready worker available")]
  NoWorker,

  #[error("Pool is shutting down")]
  ShuttingDown,
}
