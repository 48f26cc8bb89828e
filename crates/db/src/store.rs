use std::path::{Path, PathBuf};

use lancedb::{Connection, connect};
use tracing::{debug, info};

use crate::schema::{chunks_schema, file_status_schema};
use crate::Result;

/// Handle to the on-disk vector store.
///
/// Reads may run concurrently; writes are expected to arrive through the
/// [`crate::WriteQueue`] so the backend sees one writer at a time.
pub struct VectorStore {
  pub path: PathBuf,
  pub connection: Connection,
  pub vector_dim: usize,
}

impl VectorStore {
  /// Open (or create) the store at `data_dir` and bring the schema current.
  pub async fn open(data_dir: &Path, vector_dim: usize) -> Result<Self> {
    if let Some(parent) = data_dir.parent() {
      std::fs::create_dir_all(parent)?;
    }

    info!(path = %data_dir.display(), vector_dim, "Opening vector store");
    let connection = connect(data_dir.to_string_lossy().as_ref()).execute().await?;

    let store = Self {
      path: data_dir.to_path_buf(),
      connection,
      vector_dim,
    };
    store.run_migrations().await?;
    Ok(store)
  }

  pub(crate) async fn ensure_tables(&self) -> Result<()> {
    let table_names = self.connection.table_names().execute().await?;

    if !table_names.contains(&"chunks".to_string()) {
      debug!("Creating chunks table");
      self
        .connection
        .create_empty_table("chunks", chunks_schema(self.vector_dim))
        .execute()
        .await?;
    }

    if !table_names.contains(&"file_status".to_string()) {
      debug!("Creating file_status table");
      self
        .connection
        .create_empty_table("file_status", file_status_schema())
        .execute()
        .await?;
    }

    Ok(())
  }

  pub async fn chunks_table(&self) -> Result<lancedb::Table> {
    Ok(self.connection.open_table("chunks").execute().await?)
  }

  pub async fn file_status_table(&self) -> Result<lancedb::Table> {
    Ok(self.connection.open_table("file_status").execute().await?)
  }

  /// Drop and recreate both tables (user-initiated "clear index").
  pub async fn clear(&self) -> Result<()> {
    let table_names = self.connection.table_names().execute().await?;
    for name in ["chunks", "file_status"] {
      if table_names.contains(&name.to_string()) {
        self.connection.drop_table(name).await?;
      }
    }
    self.ensure_tables().await
  }
}

/// Escape a string literal for a datafusion-style filter expression.
pub(crate) fn escape_literal(value: &str) -> String {
  value.replace('\'', "''")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn open_creates_tables_and_schema_version() {
    let tmp = tempfile::TempDir::new().unwrap();
    let store = VectorStore::open(&tmp.path().join("data"), 4).await.unwrap();

    let tables = store.connection.table_names().execute().await.unwrap();
    assert!(tables.contains(&"chunks".to_string()));
    assert!(tables.contains(&"file_status".to_string()));
    assert!(tables.contains(&"_migrations".to_string()));

    let version = store.schema_version().await.unwrap();
    assert_eq!(version, crate::CURRENT_SCHEMA_VERSION);
  }

  #[tokio::test]
  async fn clear_empties_both_tables() {
    let tmp = tempfile::TempDir::new().unwrap();
    let store = VectorStore::open(&tmp.path().join("data"), 4).await.unwrap();

    store
      .insert_chunks(vec![crate::ChunkRow {
        id: "x:0".into(),
        path: "/docs/x.txt".into(),
        title: "x".into(),
        page: 1,
        offset: 0,
        chunk_index: 0,
        text: "hello".into(),
        vector: vec![1.0, 0.0, 0.0, 0.0],
        mtime: 0,
        indexed_at: 0,
      }])
      .await
      .unwrap();
    assert_eq!(store.total_chunks().await.unwrap(), 1);

    store.clear().await.unwrap();
    assert_eq!(store.total_chunks().await.unwrap(), 0);
  }

  #[test]
  fn literals_are_escaped() {
    assert_eq!(escape_literal("it's"), "it''s");
  }
}
