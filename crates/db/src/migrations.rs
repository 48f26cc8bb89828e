//! Forward-only schema migrations tracked in a `_migrations` meta table.

use arrow_array::{Int64Array, RecordBatch, RecordBatchIterator, StringArray};
use chrono::Utc;
use futures::TryStreamExt;
use lancedb::query::ExecutableQuery;
use lodestone_core::{FileStatus, FileStatusRow};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::chunks::{get_i64, get_string, get_u32};
use crate::schema::{file_status_schema, migrations_schema};
use crate::{Result, VectorStore};

/// Bump when the on-disk schema changes; add a matching arm to
/// `apply_migration`.
pub const CURRENT_SCHEMA_VERSION: i64 = 2;

struct Migration {
  version: i64,
  name: &'static str,
}

const MIGRATIONS: &[Migration] = &[
  Migration {
    version: 1,
    name: "initial_schema",
  },
  Migration {
    version: 2,
    name: "parser_version_backfill",
  },
];

impl VectorStore {
  pub(crate) async fn run_migrations(&self) -> Result<()> {
    self.ensure_migrations_table().await?;
    let current = self.schema_version().await?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
      info!(version = migration.version, name = migration.name, "Applying migration");
      self.apply_migration(migration.version).await?;
      self.record_migration(migration).await?;
    }
    Ok(())
  }

  async fn ensure_migrations_table(&self) -> Result<()> {
    let table_names = self.connection.table_names().execute().await?;
    if !table_names.contains(&"_migrations".to_string()) {
      debug!("Creating _migrations table");
      self
        .connection
        .create_empty_table("_migrations", migrations_schema())
        .execute()
        .await?;
    }
    Ok(())
  }

  /// Highest applied migration version (0 on a fresh store).
  pub async fn schema_version(&self) -> Result<i64> {
    let table = match self.connection.open_table("_migrations").execute().await {
      Ok(t) => t,
      Err(_) => return Ok(0),
    };

    let results: Vec<RecordBatch> = table.query().execute().await?.try_collect().await?;
    let mut max_version = 0i64;
    for batch in results {
      if let Some(versions) = batch
        .column_by_name("version")
        .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
      {
        for i in 0..versions.len() {
          max_version = max_version.max(versions.value(i));
        }
      }
    }
    Ok(max_version)
  }

  async fn apply_migration(&self, version: i64) -> Result<()> {
    match version {
      1 => self.ensure_tables().await,
      2 => self.migrate_v2_parser_version_backfill().await,
      v => {
        warn!(version = v, "Unknown migration version");
        Ok(())
      }
    }
  }

  async fn record_migration(&self, migration: &Migration) -> Result<()> {
    let table = self.connection.open_table("_migrations").execute().await?;
    let batch = RecordBatch::try_new(
      migrations_schema(),
      vec![
        Arc::new(Int64Array::from(vec![migration.version])),
        Arc::new(StringArray::from(vec![migration.name])),
        Arc::new(Int64Array::from(vec![Utc::now().timestamp_millis()])),
      ],
    )?;
    let batches = RecordBatchIterator::new(vec![Ok(batch)], migrations_schema());
    table.add(Box::new(batches)).execute().await?;
    Ok(())
  }

  /// v2: ledgers written before the `parser_version` column existed get
  /// `parser_version = 1`, which flags every file as outdated relative to
  /// any later parser and forces a clean re-index.
  async fn migrate_v2_parser_version_backfill(&self) -> Result<()> {
    let table_names = self.connection.table_names().execute().await?;
    if !table_names.contains(&"file_status".to_string()) {
      return Ok(());
    }

    let table = self.connection.open_table("file_status").execute().await?;
    let schema = table.schema().await?;
    if schema.field_with_name("parser_version").is_ok() {
      debug!("file_status already carries parser_version");
      return Ok(());
    }

    info!("Backfilling parser_version = 1 into legacy file_status rows");
    let results: Vec<RecordBatch> = table.query().execute().await?.try_collect().await?;
    let mut legacy_rows = Vec::new();
    for batch in results {
      for row in 0..batch.num_rows() {
        let status = get_string(&batch, "status", row).unwrap_or_else(|_| "error".to_string());
        legacy_rows.push(FileStatusRow {
          path: get_string(&batch, "path", row)?,
          status: FileStatus::parse(&status).unwrap_or(FileStatus::Error),
          parser_version: 1,
          chunk_count: get_u32(&batch, "chunk_count", row).unwrap_or(0),
          error_message: None,
          last_modified: get_i64(&batch, "last_modified", row).unwrap_or(0),
          indexed_at: get_i64(&batch, "indexed_at", row).unwrap_or(0),
          last_retry: 0,
          file_hash: get_string(&batch, "file_hash", row).unwrap_or_default(),
        });
      }
    }

    self.connection.drop_table("file_status").await?;
    self
      .connection
      .create_empty_table("file_status", file_status_schema())
      .execute()
      .await?;
    for row in &legacy_rows {
      self.upsert_status(row).await?;
    }
    info!(rows = legacy_rows.len(), "Legacy ledger rebuilt");
    Ok(())
  }
}
