//! Markdown parser: keep visible text, drop syntax.

use std::path::Path;

use pulldown_cmark::{Event, Options, Parser, Tag, TagEnd};

use crate::encoding::decode_bytes;
use crate::{ExtractedText, ParseError};

pub fn parse_markdown(path: &Path) -> Result<ExtractedText, ParseError> {
  let bytes = std::fs::read(path)?;
  let source = decode_bytes(&bytes)?;
  Ok(ExtractedText::flat(strip_markdown(&source)))
}

/// Walk the event stream and keep only rendered text. Headings, list markers,
/// emphasis and link syntax disappear; their inner text stays. Inline and
/// fenced code is kept verbatim.
fn strip_markdown(source: &str) -> String {
  let mut out = String::with_capacity(source.len());
  let parser = Parser::new_ext(source, Options::ENABLE_TABLES | Options::ENABLE_STRIKETHROUGH);

  for event in parser {
    match event {
      Event::Text(text) | Event::Code(text) => out.push_str(&text),
      Event::SoftBreak | Event::HardBreak => out.push('\n'),
      Event::End(TagEnd::Paragraph | TagEnd::Heading(_) | TagEnd::Item | TagEnd::CodeBlock) => {
        if !out.ends_with('\n') {
          out.push('\n');
        }
      }
      Event::End(TagEnd::TableCell) => out.push('\t'),
      Event::End(TagEnd::TableRow | TagEnd::TableHead) => {
        // Replace the trailing cell tab with a row break.
        if out.ends_with('\t') {
          out.pop();
        }
        out.push('\n');
      }
      Event::Start(Tag::Image { .. }) => {}
      _ => {}
    }
  }

  out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn headings_lose_markers() {
    let text = strip_markdown("# Title\n\nBody text here.");
    assert_eq!(text, "Title\nBody text here.");
  }

  #[test]
  fn emphasis_and_inline_code_keep_content() {
    let text = strip_markdown("Some *emphasized* and `coded` words.");
    assert_eq!(text, "Some emphasized and coded words.");
  }

  #[test]
  fn list_markers_are_dropped() {
    let text = strip_markdown("- first item\n- second item\n");
    assert_eq!(text, "first item\nsecond item");
  }

  #[test]
  fn links_keep_label_not_url() {
    let text = strip_markdown("See [the docs](https://example.com/hidden) now.");
    assert!(text.contains("the docs"));
    assert!(!text.contains("example.com"));
  }

  #[test]
  fn fenced_code_is_preserved() {
    let text = strip_markdown("```\nlet x = 1;\n```\n");
    assert!(text.contains("let x = 1;"));
  }
}
