//! PDF parser: per-page extraction via lopdf, synthetic pages as fallback.

use std::path::Path;

use crate::{ExtractedText, PageText, ParseError};

/// Character span labelled as one synthetic page when the extractor yields a
/// single monolithic string. Keeps offset math page-relative either way.
const SYNTHETIC_PAGE_CHARS: usize = 4000;

pub fn parse_pdf(path: &Path) -> Result<ExtractedText, ParseError> {
  let doc = lopdf::Document::load(path).map_err(|e| ParseError::corrupt("pdf", e.to_string()))?;

  let page_numbers: Vec<u32> = doc.get_pages().keys().copied().collect();
  if page_numbers.is_empty() {
    return Err(ParseError::Empty);
  }

  let mut pages = Vec::with_capacity(page_numbers.len());
  for &number in &page_numbers {
    match doc.extract_text(&[number]) {
      Ok(text) => pages.push(PageText { number, text }),
      Err(e) => {
        // One undecodable page should not sink the document.
        tracing::debug!(path = %path.display(), page = number, error = %e, "Page extraction failed");
        pages.push(PageText {
          number,
          text: String::new(),
        });
      }
    }
  }

  if pages.iter().all(|p| p.text.trim().is_empty()) {
    // Well-formed but textless: almost always a scanned PDF.
    return Err(ParseError::Empty);
  }

  // Some extractors concatenate everything onto the first page. Re-split so
  // downstream offsets stay bounded per page.
  if pages.len() == 1 && pages[0].text.chars().count() > SYNTHETIC_PAGE_CHARS * 2 {
    return Ok(ExtractedText {
      pages: synthesize_pages(&pages[0].text),
    });
  }

  Ok(ExtractedText { pages })
}

/// Split a monolithic string into successive synthetic pages of
/// `SYNTHETIC_PAGE_CHARS` characters, numbered from 1.
fn synthesize_pages(text: &str) -> Vec<PageText> {
  let chars: Vec<char> = text.chars().collect();
  chars
    .chunks(SYNTHETIC_PAGE_CHARS)
    .enumerate()
    .map(|(i, span)| PageText {
      number: (i + 1) as u32,
      text: span.iter().collect(),
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn synthetic_pages_cover_all_text() {
    let text = "x".repeat(SYNTHETIC_PAGE_CHARS * 2 + 100);
    let pages = synthesize_pages(&text);
    assert_eq!(pages.len(), 3);
    assert_eq!(pages[0].number, 1);
    assert_eq!(pages[2].number, 3);
    let total: usize = pages.iter().map(|p| p.text.chars().count()).sum();
    assert_eq!(total, text.chars().count());
  }

  #[test]
  fn synthetic_pages_preserve_order() {
    let mut text = "a".repeat(SYNTHETIC_PAGE_CHARS);
    text.push_str(&"b".repeat(SYNTHETIC_PAGE_CHARS));
    let pages = synthesize_pages(&text);
    assert!(pages[0].text.starts_with('a'));
    assert!(pages[1].text.starts_with('b'));
  }

  #[test]
  fn garbage_bytes_are_corrupt() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("bad.pdf");
    std::fs::write(&path, b"%PDF-but-not-really").unwrap();
    let err = parse_pdf(&path).unwrap_err();
    assert!(matches!(err, ParseError::Corrupt { format: "pdf", .. }));
  }
}
