//! Sentence-aware chunking with token-estimate budgets and overlap.

use lodestone_core::{CHARS_PER_TOKEN, estimate_tokens};

/// Configuration for the chunker
#[derive(Debug, Clone)]
pub struct ChunkerConfig {
  /// Target estimated tokens per chunk.
  pub target_tokens: usize,
  /// Minimum estimated tokens of overlap carried into the next chunk.
  pub overlap_floor: usize,
}

impl Default for ChunkerConfig {
  fn default() -> Self {
    Self {
      target_tokens: 500,
      overlap_floor: 80,
    }
  }
}

/// One emitted chunk with its byte offset into the source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
  pub text: String,
  pub offset: u32,
}

#[derive(Debug, Clone, Copy)]
struct Sentence {
  start: usize,
  end: usize,
  tokens: usize,
}

/// Chunk `text` into ~`target_tokens` spans overlapping by at least
/// `overlap_floor` tokens.
///
/// Sentences never split across chunks, so an emitted chunk may exceed the
/// target by up to one sentence. Pathologically long "sentences" (no
/// terminal punctuation) are hard-split so a single chunk stays bounded.
pub fn chunk_text(text: &str, config: &ChunkerConfig) -> Vec<TextChunk> {
  let sentences = split_sentences(text, config.target_tokens);
  if sentences.is_empty() {
    return Vec::new();
  }

  let mut chunks = Vec::new();
  let mut buffer: Vec<Sentence> = Vec::new();
  let mut buffer_tokens = 0usize;

  for sentence in sentences {
    if buffer_tokens + sentence.tokens > config.target_tokens && !buffer.is_empty() {
      chunks.push(emit(text, &buffer));

      // Keep a tail of sentences as the start of the next buffer, without
      // dropping below the overlap floor.
      let mut dropped_any = false;
      while buffer.len() > 1 && buffer_tokens - buffer[0].tokens >= config.overlap_floor {
        let front = buffer.remove(0);
        buffer_tokens -= front.tokens;
        dropped_any = true;
      }
      // No trimmable front means the tail would replay the whole emitted
      // chunk; start fresh instead.
      if !dropped_any {
        buffer.clear();
        buffer_tokens = 0;
      }
    }
    buffer_tokens += sentence.tokens;
    buffer.push(sentence);
  }

  if !buffer.is_empty() {
    let tail = emit(text, &buffer);
    // The overlap tail alone can be a strict prefix of the previous chunk;
    // only emit it when it adds new text.
    let redundant = chunks
      .last()
      .is_some_and(|last: &TextChunk| last.offset <= tail.offset && last.end() >= tail.end());
    if !redundant {
      chunks.push(tail);
    }
  }

  chunks
}

impl TextChunk {
  fn end(&self) -> u32 {
    self.offset + self.text.len() as u32
  }
}

fn emit(text: &str, buffer: &[Sentence]) -> TextChunk {
  let start = buffer[0].start;
  let end = buffer[buffer.len() - 1].end;
  TextChunk {
    text: text[start..end].to_string(),
    offset: start as u32,
  }
}

/// Split on sentence boundaries: terminal `.`, `?`, `!` followed by
/// whitespace. Whitespace between sentences belongs to the preceding
/// sentence so concatenating spans reconstructs the source.
fn split_sentences(text: &str, target_tokens: usize) -> Vec<Sentence> {
  let bytes = text.as_bytes();
  let hard_limit_bytes = (target_tokens * CHARS_PER_TOKEN * 2).max(CHARS_PER_TOKEN);
  let mut sentences = Vec::new();
  let mut start = 0usize;
  let mut i = 0usize;

  while i < bytes.len() {
    let terminal = matches!(bytes[i], b'.' | b'?' | b'!');
    let at_boundary = terminal && bytes.get(i + 1).is_none_or(|b| b.is_ascii_whitespace());
    let oversized = i - start >= hard_limit_bytes && is_char_boundary_at(text, i);

    if at_boundary || oversized {
      // Consume trailing whitespace into this sentence.
      let mut end = if at_boundary { i + 1 } else { i };
      while end < bytes.len() && bytes[end].is_ascii_whitespace() {
        end += 1;
      }
      push_sentence(text, start, end, &mut sentences);
      start = end;
      i = end;
    } else {
      i += 1;
    }
  }

  if start < bytes.len() {
    push_sentence(text, start, bytes.len(), &mut sentences);
  }
  sentences
}

fn push_sentence(text: &str, start: usize, end: usize, sentences: &mut Vec<Sentence>) {
  let span = &text[start..end];
  if span.trim().is_empty() {
    // Fold leading whitespace into the previous sentence to keep coverage.
    if let Some(last) = sentences.last_mut() {
      last.end = end;
    }
    return;
  }
  sentences.push(Sentence {
    start,
    end,
    tokens: estimate_tokens(span),
  });
}

fn is_char_boundary_at(text: &str, i: usize) -> bool {
  text.is_char_boundary(i)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn config(target: usize, overlap: usize) -> ChunkerConfig {
    ChunkerConfig {
      target_tokens: target,
      overlap_floor: overlap,
    }
  }

  #[test]
  fn short_text_is_one_chunk() {
    let chunks = chunk_text("The quick brown fox jumps over the lazy dog. This is a test document.", &ChunkerConfig::default());
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].offset, 0);
    assert!(chunks[0].text.contains("quick brown fox"));
  }

  #[test]
  fn empty_text_yields_nothing() {
    assert!(chunk_text("", &ChunkerConfig::default()).is_empty());
    assert!(chunk_text("   \n  ", &ChunkerConfig::default()).is_empty());
  }

  #[test]
  fn offsets_index_into_source() {
    let text = "First sentence here. Second sentence there. Third one closes.";
    let chunks = chunk_text(text, &config(6, 2));
    assert!(chunks.len() > 1);
    for chunk in &chunks {
      let start = chunk.offset as usize;
      assert_eq!(&text[start..start + chunk.text.len()], chunk.text);
    }
  }

  #[test]
  fn chunks_stay_near_target() {
    let sentence = "This sentence is about ten tokens of text in length. ";
    let text = sentence.repeat(100);
    let cfg = config(50, 10);
    let chunks = chunk_text(&text, &cfg);
    assert!(chunks.len() > 5);

    let sentence_tokens = estimate_tokens(sentence);
    for chunk in &chunks {
      assert!(
        estimate_tokens(&chunk.text) <= cfg.target_tokens + sentence_tokens,
        "chunk exceeds target plus one sentence"
      );
    }
  }

  #[test]
  fn consecutive_chunks_overlap() {
    let sentence = "Ten tokens of sentence text flow along quite nicely here. ";
    let text = sentence.repeat(60);
    let cfg = config(60, 15);
    let chunks = chunk_text(&text, &cfg);
    assert!(chunks.len() >= 2);

    for pair in chunks.windows(2) {
      let previous_end = pair[0].offset as usize + pair[0].text.len();
      let next_start = pair[1].offset as usize;
      assert!(
        next_start < previous_end,
        "chunks {next_start}..{previous_end} do not overlap"
      );
      let overlap = &text[next_start..previous_end];
      assert!(estimate_tokens(overlap) >= cfg.overlap_floor);
    }
  }

  #[test]
  fn chunks_cover_all_source_text() {
    let sentence = "Coverage matters for every byte of the source text here. ";
    let text = sentence.repeat(40);
    let chunks = chunk_text(&text, &config(40, 10));

    // Union of [offset, offset+len) must cover [0, len).
    let mut covered_to = 0usize;
    for chunk in &chunks {
      let start = chunk.offset as usize;
      assert!(start <= covered_to, "gap before offset {start}");
      covered_to = covered_to.max(start + chunk.text.len());
    }
    assert_eq!(covered_to, text.len());
  }

  #[test]
  fn giant_unpunctuated_text_is_hard_split() {
    let text = "word ".repeat(2000);
    let cfg = config(50, 10);
    let chunks = chunk_text(&text, &cfg);
    assert!(chunks.len() > 1, "monolithic text must still split");
    for chunk in &chunks {
      assert!(estimate_tokens(&chunk.text) <= cfg.target_tokens * 3);
    }
  }

  #[test]
  fn question_and_exclamation_are_boundaries() {
    let text = "Is this a question? Yes! And a statement.";
    let chunks = chunk_text(text, &config(3, 1));
    assert!(chunks.len() >= 2);
  }
}
