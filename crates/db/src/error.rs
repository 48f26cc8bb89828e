use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
  #[error("LanceDB error: {0}")]
  Lance(#[from] lancedb::Error),
  #[error("Arrow error: {0}")]
  Arrow(#[from] arrow::error::ArrowError),
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("Not found: {0}")]
  NotFound(String),
  #[error("Schema error: {0}")]
  Schema(String),
}

impl DbError {
  /// Whether the write queue should retry the operation.
  ///
  /// Schema and not-found problems are deterministic; IO and backend errors
  /// may be contention or a mid-compaction read and deserve another attempt.
  pub fn is_transient(&self) -> bool {
    matches!(self, DbError::Lance(_) | DbError::Io(_))
  }
}
