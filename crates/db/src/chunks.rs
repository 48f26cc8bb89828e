//! Chunk rows: insert, delete-by-path, vector search, counts.

use arrow_array::{
  Array, FixedSizeListArray, Float32Array, Int64Array, RecordBatch, RecordBatchIterator, StringArray, UInt32Array,
};
use futures::TryStreamExt;
use lancedb::DistanceType;
use lancedb::query::{ExecutableQuery, QueryBase};
use std::sync::Arc;

use crate::schema::chunks_schema;
use crate::store::escape_literal;
use crate::{DbError, Result, VectorStore};

/// One row of the `chunks` table.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRow {
  /// `sha256(path)[..16]:chunk_index`.
  pub id: String,
  pub path: String,
  /// Filename without extension.
  pub title: String,
  pub page: u32,
  pub offset: u32,
  pub chunk_index: u32,
  pub text: String,
  pub vector: Vec<f32>,
  pub mtime: i64,
  pub indexed_at: i64,
}

/// A search hit: the row plus its similarity score.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
  pub id: String,
  pub path: String,
  pub title: String,
  pub page: u32,
  pub offset: u32,
  pub text: String,
  pub score: f32,
}

impl VectorStore {
  /// Insert chunk rows. Callers route through the write queue.
  pub async fn insert_chunks(&self, rows: Vec<ChunkRow>) -> Result<()> {
    if rows.is_empty() {
      return Ok(());
    }
    let table = self.chunks_table().await?;
    let batch = rows_to_batch(&rows, self.vector_dim)?;
    let batches = RecordBatchIterator::new(vec![Ok(batch)], chunks_schema(self.vector_dim));
    table.add(Box::new(batches)).execute().await?;
    Ok(())
  }

  /// Delete every chunk row for `path`.
  pub async fn delete_chunks_by_path(&self, path: &str) -> Result<()> {
    let table = self.chunks_table().await?;
    table.delete(&format!("path = '{}'", escape_literal(path))).await?;
    Ok(())
  }

  /// ANN search by cosine similarity. Results are sorted by descending
  /// score with `(path, offset)` breaking ties for determinism.
  pub async fn search_chunks(&self, query_vector: &[f32], k: usize) -> Result<Vec<ScoredChunk>> {
    if k == 0 {
      return Ok(Vec::new());
    }
    let table = self.chunks_table().await?;

    let results: Vec<RecordBatch> = table
      .vector_search(query_vector.to_vec())?
      .distance_type(DistanceType::Cosine)
      .limit(k)
      .execute()
      .await?
      .try_collect()
      .await?;

    let mut hits = Vec::new();
    for batch in results {
      for row in 0..batch.num_rows() {
        let distance = batch
          .column_by_name("_distance")
          .and_then(|col| col.as_any().downcast_ref::<Float32Array>())
          .map(|arr| arr.value(row))
          .unwrap_or(0.0);
        hits.push(ScoredChunk {
          id: get_string(&batch, "id", row)?,
          path: get_string(&batch, "path", row)?,
          title: get_string(&batch, "title", row)?,
          page: get_u32(&batch, "page", row)?,
          offset: get_u32(&batch, "offset", row)?,
          text: get_string(&batch, "text", row)?,
          score: 1.0 - distance,
        });
      }
    }

    hits.sort_by(|a, b| {
      b.score
        .partial_cmp(&a.score)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then_with(|| a.path.cmp(&b.path))
        .then_with(|| a.offset.cmp(&b.offset))
    });
    hits.truncate(k);
    Ok(hits)
  }

  pub async fn total_chunks(&self) -> Result<u64> {
    let table = self.chunks_table().await?;
    Ok(table.count_rows(None).await? as u64)
  }

  /// Chunk count under a path prefix (per-folder stats).
  pub async fn chunks_under(&self, prefix: &str) -> Result<u64> {
    let table = self.chunks_table().await?;
    let filter = format!("path LIKE '{}%'", escape_literal(prefix));
    Ok(table.count_rows(Some(filter)).await? as u64)
  }

  /// Chunk rows for one path, ordered by chunk index (test and diagnostics
  /// support; the search path never scans).
  pub async fn chunks_for_path(&self, path: &str) -> Result<Vec<ChunkRow>> {
    let table = self.chunks_table().await?;
    let results: Vec<RecordBatch> = table
      .query()
      .only_if(format!("path = '{}'", escape_literal(path)))
      .execute()
      .await?
      .try_collect()
      .await?;

    let mut rows = Vec::new();
    for batch in results {
      for row in 0..batch.num_rows() {
        rows.push(batch_to_row(&batch, row)?);
      }
    }
    rows.sort_by_key(|r| r.chunk_index);
    Ok(rows)
  }
}

fn rows_to_batch(rows: &[ChunkRow], vector_dim: usize) -> Result<RecordBatch> {
  let ids = StringArray::from(rows.iter().map(|r| r.id.clone()).collect::<Vec<_>>());
  let paths = StringArray::from(rows.iter().map(|r| r.path.clone()).collect::<Vec<_>>());
  let titles = StringArray::from(rows.iter().map(|r| r.title.clone()).collect::<Vec<_>>());
  let pages = UInt32Array::from(rows.iter().map(|r| r.page).collect::<Vec<_>>());
  let offsets = UInt32Array::from(rows.iter().map(|r| r.offset).collect::<Vec<_>>());
  let indices = UInt32Array::from(rows.iter().map(|r| r.chunk_index).collect::<Vec<_>>());
  let texts = StringArray::from(rows.iter().map(|r| r.text.clone()).collect::<Vec<_>>());
  let mtimes = Int64Array::from(rows.iter().map(|r| r.mtime).collect::<Vec<_>>());
  let indexed = Int64Array::from(rows.iter().map(|r| r.indexed_at).collect::<Vec<_>>());

  let mut flat = Vec::with_capacity(rows.len() * vector_dim);
  for row in rows {
    let mut vector = row.vector.clone();
    vector.resize(vector_dim, 0.0);
    flat.extend_from_slice(&vector);
  }
  let field = Arc::new(arrow_schema::Field::new("item", arrow_schema::DataType::Float32, true));
  let vectors = FixedSizeListArray::try_new(field, vector_dim as i32, Arc::new(Float32Array::from(flat)), None)?;

  Ok(RecordBatch::try_new(
    chunks_schema(vector_dim),
    vec![
      Arc::new(ids),
      Arc::new(paths),
      Arc::new(titles),
      Arc::new(pages),
      Arc::new(offsets),
      Arc::new(indices),
      Arc::new(texts),
      Arc::new(mtimes),
      Arc::new(indexed),
      Arc::new(vectors),
    ],
  )?)
}

fn batch_to_row(batch: &RecordBatch, row: usize) -> Result<ChunkRow> {
  let vector = batch
    .column_by_name("vector")
    .and_then(|col| col.as_any().downcast_ref::<FixedSizeListArray>())
    .map(|arr| {
      let values = arr.value(row);
      values
        .as_any()
        .downcast_ref::<Float32Array>()
        .map(|f| f.values().to_vec())
        .unwrap_or_default()
    })
    .unwrap_or_default();

  Ok(ChunkRow {
    id: get_string(batch, "id", row)?,
    path: get_string(batch, "path", row)?,
    title: get_string(batch, "title", row)?,
    page: get_u32(batch, "page", row)?,
    offset: get_u32(batch, "offset", row)?,
    chunk_index: get_u32(batch, "chunk_index", row)?,
    text: get_string(batch, "text", row)?,
    vector,
    mtime: get_i64(batch, "mtime", row)?,
    indexed_at: get_i64(batch, "indexed_at", row)?,
  })
}

pub(crate) fn get_string(batch: &RecordBatch, name: &str, row: usize) -> Result<String> {
  batch
    .column_by_name(name)
    .and_then(|col| col.as_any().downcast_ref::<StringArray>())
    .map(|arr| arr.value(row).to_string())
    .ok_or_else(|| DbError::NotFound(format!("{name} column")))
}

pub(crate) fn get_u32(batch: &RecordBatch, name: &str, row: usize) -> Result<u32> {
  batch
    .column_by_name(name)
    .and_then(|col| col.as_any().downcast_ref::<UInt32Array>())
    .map(|arr| arr.value(row))
    .ok_or_else(|| DbError::NotFound(format!("{name} column")))
}

pub(crate) fn get_i64(batch: &RecordBatch, name: &str, row: usize) -> Result<i64> {
  batch
    .column_by_name(name)
    .and_then(|col| col.as_any().downcast_ref::<Int64Array>())
    .map(|arr| arr.value(row))
    .ok_or_else(|| DbError::NotFound(format!("{name} column")))
}
