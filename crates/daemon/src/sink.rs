//! Bridge from the embedding queue's write path to the vector store's
//! write queue.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use db::{ChunkRow, WriteQueue, WriteTask};
use embedding::{BatchSink, EmbeddedChunk};
use index::title_for_path;
use lodestone_core::chunk_id;

pub struct StoreSink {
  writes: WriteQueue,
}

impl StoreSink {
  pub fn new(writes: WriteQueue) -> Self {
    Self { writes }
  }
}

#[async_trait]
impl BatchSink for StoreSink {
  async fn store(&self, chunks: Vec<EmbeddedChunk>) -> Result<(), String> {
    if chunks.is_empty() {
      return Ok(());
    }
    let indexed_at = Utc::now().timestamp_millis();
    let rows: Vec<ChunkRow> = chunks
      .into_iter()
      .map(|chunk| ChunkRow {
        id: chunk_id(&chunk.meta.path, chunk.meta.chunk_index),
        title: title_for_path(Path::new(&chunk.meta.path)),
        path: chunk.meta.path,
        page: chunk.meta.page,
        offset: chunk.meta.offset,
        chunk_index: chunk.meta.chunk_index,
        text: bounded_text(chunk.text),
        vector: chunk.vector,
        mtime: chunk.meta.mtime,
        indexed_at,
      })
      .collect();

    self.writes.submit_wait(WriteTask::InsertChunks { rows }).await
  }
}

/// Stored chunk text is bounded; the vector already encodes the overflow.
const MAX_STORED_TEXT_BYTES: usize = 8 * 1024;

fn bounded_text(text: String) -> String {
  if text.len() <= MAX_STORED_TEXT_BYTES {
    return text;
  }
  let mut end = MAX_STORED_TEXT_BYTES;
  while !text.is_char_boundary(end) {
    end -= 1;
  }
  text[..end].to_string()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn short_text_is_untouched() {
    assert_eq!(bounded_text("hello".to_string()), "hello");
  }

  #[test]
  fn long_text_is_cut_at_char_boundary() {
    let text = "é".repeat(MAX_STORED_TEXT_BYTES);
    let bounded = bounded_text(text);
    assert!(bounded.len() <= MAX_STORED_TEXT_BYTES);
    assert!(bounded.chars().all(|c| c == 'é'));
  }
}
