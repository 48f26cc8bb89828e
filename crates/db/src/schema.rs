use arrow_schema::{DataType, Field, Schema};
use std::sync::Arc;

/// Schema for the `chunks` table: one row per stored vector.
pub fn chunks_schema(vector_dim: usize) -> Arc<Schema> {
  Arc::new(Schema::new(vec![
    Field::new("id", DataType::Utf8, false),
    Field::new("path", DataType::Utf8, false),
    Field::new("title", DataType::Utf8, false),
    Field::new("page", DataType::UInt32, false),
    Field::new("offset", DataType::UInt32, false),
    Field::new("chunk_index", DataType::UInt32, false),
    Field::new("text", DataType::Utf8, false),
    Field::new("mtime", DataType::Int64, false),
    Field::new("indexed_at", DataType::Int64, false),
    Field::new(
      "vector",
      DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), vector_dim as i32),
      true,
    ),
  ]))
}

/// Schema for the `file_status` ledger: one row per file ever seen.
pub fn file_status_schema() -> Arc<Schema> {
  Arc::new(Schema::new(vec![
    Field::new("path", DataType::Utf8, false),
    Field::new("status", DataType::Utf8, false),
    Field::new("parser_version", DataType::UInt32, false),
    Field::new("chunk_count", DataType::UInt32, false),
    Field::new("error_message", DataType::Utf8, true),
    Field::new("last_modified", DataType::Int64, false),
    Field::new("indexed_at", DataType::Int64, false),
    Field::new("last_retry", DataType::Int64, false),
    Field::new("file_hash", DataType::Utf8, false),
  ]))
}

/// Schema for the `_migrations` meta table.
pub fn migrations_schema() -> Arc<Schema> {
  Arc::new(Schema::new(vec![
    Field::new("version", DataType::Int64, false),
    Field::new("name", DataType::Utf8, false),
    Field::new("applied_at", DataType::Int64, false),
  ]))
}
