//! The query path: embed once, ANN search, shape results.
//!
//! This path never touches the file queue or parsers; an empty index or
//! empty query short-circuits before any embedding happens.

use std::sync::Arc;

use db::VectorStore;
use embedding::EmbedderPool;
use ipc::SearchHit;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SearchError {
  #[error("Embedding failed: {0}")]
  Embed(#[from] embedding::EmbedError),
  #[error("Store read failed: {0}")]
  Store(#[from] db::DbError),
}

pub struct SearchService {
  store: Arc<VectorStore>,
  pool: Arc<EmbedderPool>,
  /// Model-documented query prefix, applied only here.
  query_prefix: Option<String>,
}

impl SearchService {
  pub fn new(store: Arc<VectorStore>, pool: Arc<EmbedderPool>, query_prefix: Option<String>) -> Self {
    Self {
      store,
      pool,
      query_prefix,
    }
  }

  pub async fn query(&self, text: &str, k: usize) -> Result<Vec<SearchHit>, SearchError> {
    if text.trim().is_empty() || k == 0 {
      return Ok(Vec::new());
    }
    if self.store.total_chunks().await? == 0 {
      return Ok(Vec::new());
    }

    let query_text = match &self.query_prefix {
      Some(prefix) => format!("{prefix}{text}"),
      None => text.to_string(),
    };

    let vector = self.pool.embed_query(query_text).await?;
    let hits = self.store.search_chunks(&vector, k).await?;
    debug!(query = text, hits = hits.len(), "Search complete");

    Ok(
      hits
        .into_iter()
        .map(|hit| SearchHit {
          id: hit.id,
          path: hit.path,
          page: hit.page,
          offset: hit.offset,
          text: hit.text,
          score: hit.score,
          title: hit.title,
        })
        .collect(),
    )
  }
}
