//! The file-status ledger: the sole source of truth for "what do we know
//! about this path".

use arrow_array::{Array, Int64Array, RecordBatch, RecordBatchIterator, StringArray, UInt32Array};
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lodestone_core::{FileStatus, FileStatusRow};
use std::sync::Arc;

use crate::chunks::{get_i64, get_string, get_u32};
use crate::schema::file_status_schema;
use crate::store::escape_literal;
use crate::{Result, VectorStore};

impl VectorStore {
  /// Insert or replace the ledger row for a path.
  pub async fn upsert_status(&self, row: &FileStatusRow) -> Result<()> {
    let table = self.file_status_table().await?;
    table.delete(&format!("path = '{}'", escape_literal(&row.path))).await?;

    let batch = status_to_batch(row)?;
    let batches = RecordBatchIterator::new(vec![Ok(batch)], file_status_schema());
    table.add(Box::new(batches)).execute().await?;
    Ok(())
  }

  pub async fn get_status(&self, path: &str) -> Result<Option<FileStatusRow>> {
    let table = self.file_status_table().await?;
    let results: Vec<RecordBatch> = table
      .query()
      .only_if(format!("path = '{}'", escape_literal(path)))
      .execute()
      .await?
      .try_collect()
      .await?;

    for batch in &results {
      if batch.num_rows() > 0 {
        return Ok(Some(batch_to_status(batch, 0)?));
      }
    }
    Ok(None)
  }

  pub async fn delete_status(&self, path: &str) -> Result<()> {
    let table = self.file_status_table().await?;
    table.delete(&format!("path = '{}'", escape_literal(path))).await?;
    Ok(())
  }

  /// Every ledger row. Used by the reindex walk at startup.
  pub async fn all_statuses(&self) -> Result<Vec<FileStatusRow>> {
    let table = self.file_status_table().await?;
    let results: Vec<RecordBatch> = table.query().execute().await?.try_collect().await?;

    let mut rows = Vec::new();
    for batch in results {
      for row in 0..batch.num_rows() {
        rows.push(batch_to_status(&batch, row)?);
      }
    }
    Ok(rows)
  }

  pub async fn count_status(&self, status: FileStatus) -> Result<u64> {
    let table = self.file_status_table().await?;
    let filter = format!("status = '{}'", status.as_str());
    Ok(table.count_rows(Some(filter)).await? as u64)
  }

  /// Indexed-file count under a path prefix (per-folder stats).
  pub async fn indexed_files_under(&self, prefix: &str) -> Result<u64> {
    let table = self.file_status_table().await?;
    let filter = format!(
      "status = 'indexed' AND path LIKE '{}%'",
      escape_literal(prefix)
    );
    Ok(table.count_rows(Some(filter)).await? as u64)
  }
}

fn status_to_batch(row: &FileStatusRow) -> Result<RecordBatch> {
  Ok(RecordBatch::try_new(
    file_status_schema(),
    vec![
      Arc::new(StringArray::from(vec![row.path.clone()])),
      Arc::new(StringArray::from(vec![row.status.as_str().to_string()])),
      Arc::new(UInt32Array::from(vec![row.parser_version])),
      Arc::new(UInt32Array::from(vec![row.chunk_count])),
      Arc::new(StringArray::from(vec![row.error_message.clone()])),
      Arc::new(Int64Array::from(vec![row.last_modified])),
      Arc::new(Int64Array::from(vec![row.indexed_at])),
      Arc::new(Int64Array::from(vec![row.last_retry])),
      Arc::new(StringArray::from(vec![row.file_hash.clone()])),
    ],
  )?)
}

fn batch_to_status(batch: &RecordBatch, row: usize) -> Result<FileStatusRow> {
  let error_message = batch
    .column_by_name("error_message")
    .and_then(|col| col.as_any().downcast_ref::<StringArray>())
    .and_then(|arr| {
      if arr.is_null(row) {
        None
      } else {
        Some(arr.value(row).to_string())
      }
    });

  let status = get_string(batch, "status", row)?;
  Ok(FileStatusRow {
    path: get_string(batch, "path", row)?,
    status: FileStatus::parse(&status).unwrap_or(FileStatus::Error),
    parser_version: get_u32(batch, "parser_version", row)?,
    chunk_count: get_u32(batch, "chunk_count", row)?,
    error_message,
    last_modified: get_i64(batch, "last_modified", row)?,
    indexed_at: get_i64(batch, "indexed_at", row)?,
    last_retry: get_i64(batch, "last_retry", row)?,
    file_hash: get_string(batch, "file_hash", row)?,
  })
}
