//! Shared document-domain types and helpers.

use sha2::{Digest, Sha256};

/// Rough chars-per-token ratio used for all token estimates.
pub const CHARS_PER_TOKEN: usize = 4;

/// Estimate the token count of a text span as `ceil(chars / 4)`.
pub fn estimate_tokens(text: &str) -> usize {
  text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Stable chunk identifier: `sha256(path)[..16] ":" chunk_index`.
///
/// Deterministic so re-indexing the same file yields the same id set.
pub fn chunk_id(path: &str, chunk_index: u32) -> String {
  let mut hasher = Sha256::new();
  hasher.update(path.as_bytes());
  let digest = hasher.finalize();
  format!("{}:{}", hex::encode(&digest[..16]), chunk_index)
}

/// Stable file fingerprint over `(size, mtime, path)`.
///
/// Cheap to compute on every scan; content is never read. A touched-but-equal
/// file changes fingerprint and is re-indexed, which is the safe direction.
pub fn file_fingerprint(size: u64, mtime_ms: i64, path: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(size.to_le_bytes());
  hasher.update(mtime_ms.to_le_bytes());
  hasher.update(path.as_bytes());
  hex::encode(&hasher.finalize()[..16])
}

/// Location metadata carried alongside a chunk through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMeta {
  /// Absolute path of the source file.
  pub path: String,
  /// 1-based page number (1 for non-paginated formats).
  pub page: u32,
  /// Byte offset of the chunk start within the extracted page text.
  pub offset: u32,
  /// Position of this chunk within the file's chunk sequence.
  pub chunk_index: u32,
  /// Position of the file within the current indexing run.
  pub file_index: u64,
  /// Source file mtime in unix ms, carried into the stored row.
  pub mtime: i64,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn token_estimate_rounds_up() {
    assert_eq!(estimate_tokens(""), 0);
    assert_eq!(estimate_tokens("abc"), 1);
    assert_eq!(estimate_tokens("abcd"), 1);
    assert_eq!(estimate_tokens("abcde"), 2);
  }

  #[test]
  fn chunk_ids_are_stable_and_distinct() {
    let a = chunk_id("/docs/a.txt", 0);
    let b = chunk_id("/docs/a.txt", 0);
    assert_eq!(a, b);
    assert_ne!(chunk_id("/docs/a.txt", 1), a);
    assert_ne!(chunk_id("/docs/b.txt", 0), a);
  }

  #[test]
  fn fingerprint_tracks_size_and_mtime() {
    let base = file_fingerprint(100, 1_700_000_000_000, "/docs/a.txt");
    assert_eq!(base, file_fingerprint(100, 1_700_000_000_000, "/docs/a.txt"));
    assert_ne!(base, file_fingerprint(101, 1_700_000_000_000, "/docs/a.txt"));
    assert_ne!(base, file_fingerprint(100, 1_700_000_000_001, "/docs/a.txt"));
  }
}
