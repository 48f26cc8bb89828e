//! Extension → parser dispatch and the central parser version table.
//!
//! Bumping a `version` here forces re-indexing of every file with that
//! extension whose ledger row records a lower version.

use std::path::Path;

use crate::{ExtractedText, ParseError};

/// How a format's extracted text is shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserKind {
  /// One page of plain text.
  Flat,
  /// Ordered `(page, text)` pairs.
  Paginated,
}

type ParserFn = fn(&Path) -> Result<ExtractedText, ParseError>;

/// One registry entry. Adding a format means adding one of these.
pub struct ParserDef {
  pub extensions: &'static [&'static str],
  pub label: &'static str,
  pub kind: ParserKind,
  pub version: u32,
  /// `(version, note)` pairs, oldest first.
  pub history: &'static [(u32, &'static str)],
  pub enabled_by_default: bool,
  parser: ParserFn,
}

static REGISTRY: &[ParserDef] = &[
  ParserDef {
    extensions: &["txt"],
    label: "Plain text",
    kind: ParserKind::Flat,
    version: 1,
    history: &[(1, "encoding detection via BOM + chardetng")],
    enabled_by_default: true,
    parser: crate::text::parse_txt,
  },
  ParserDef {
    extensions: &["md", "markdown"],
    label: "Markdown",
    kind: ParserKind::Flat,
    version: 1,
    history: &[(1, "pulldown-cmark event extraction")],
    enabled_by_default: true,
    parser: crate::markdown::parse_markdown,
  },
  ParserDef {
    extensions: &["csv"],
    label: "CSV",
    kind: ParserKind::Flat,
    version: 1,
    history: &[(1, "flexible reader, ragged rows tolerated")],
    enabled_by_default: true,
    parser: crate::tabular::parse_csv,
  },
  ParserDef {
    extensions: &["tsv"],
    label: "TSV",
    kind: ParserKind::Flat,
    version: 1,
    history: &[(1, "flexible reader, ragged rows tolerated")],
    enabled_by_default: true,
    parser: crate::tabular::parse_tsv,
  },
  ParserDef {
    extensions: &["xlsx", "xls"],
    label: "Excel",
    kind: ParserKind::Flat,
    version: 1,
    history: &[(1, "calamine, sheet headers + tab-joined rows")],
    enabled_by_default: true,
    parser: crate::excel::parse_excel,
  },
  ParserDef {
    extensions: &["docx"],
    label: "Word",
    kind: ParserKind::Flat,
    version: 1,
    history: &[(1, "word/document.xml stream extraction")],
    enabled_by_default: true,
    parser: crate::docx::parse_docx,
  },
  ParserDef {
    extensions: &["doc"],
    label: "Word 97-2003",
    kind: ParserKind::Flat,
    version: 2,
    history: &[
      (1, "WordDocument stream scan, single-piece files only"),
      (2, "piece table traversal, 8/16-bit pieces"),
    ],
    enabled_by_default: true,
    parser: crate::doc::parse_doc,
  },
  ParserDef {
    extensions: &["rtf"],
    label: "Rich text",
    kind: ParserKind::Flat,
    version: 1,
    history: &[(1, "group-aware extractor with stripper fallback")],
    enabled_by_default: true,
    parser: crate::rtf::parse_rtf,
  },
  ParserDef {
    extensions: &["pdf"],
    label: "PDF",
    kind: ParserKind::Paginated,
    version: 1,
    history: &[(1, "lopdf per-page extraction, synthetic page split")],
    enabled_by_default: true,
    parser: crate::pdf::parse_pdf,
  },
];

/// The full registry, for settings UIs and diagnostics.
pub fn registry() -> &'static [ParserDef] {
  REGISTRY
}

/// Look up the parser for an extension (case-insensitive, no dot).
pub fn lookup(ext: &str) -> Option<&'static ParserDef> {
  let ext = ext.to_ascii_lowercase();
  REGISTRY.iter().find(|def| def.extensions.contains(&ext.as_str()))
}

/// Current parser version for an extension; 0 when unsupported.
pub fn current_parser_version(ext: &str) -> u32 {
  lookup(ext).map(|def| def.version).unwrap_or(0)
}

pub fn is_supported_extension(ext: &str) -> bool {
  lookup(ext).is_some()
}

/// Every extension with a registered parser.
pub fn supported_extensions() -> impl Iterator<Item = &'static str> {
  REGISTRY.iter().flat_map(|def| def.extensions.iter().copied())
}

/// Dispatch `path` to its parser by extension.
pub fn parse_file(path: &Path) -> Result<ExtractedText, ParseError> {
  let ext = path
    .extension()
    .and_then(|e| e.to_str())
    .map(|e| e.to_ascii_lowercase())
    .unwrap_or_default();

  let def = lookup(&ext).ok_or_else(|| ParseError::UnsupportedExtension(ext.clone()))?;
  let extracted = (def.parser)(path)?;

  if extracted.is_empty() {
    return Err(ParseError::Empty);
  }
  Ok(extracted)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn lookup_is_case_insensitive() {
    assert!(lookup("PDF").is_some());
    assert!(lookup("Txt").is_some());
    assert!(lookup("exe").is_none());
  }

  #[test]
  fn versions_are_monotonic_in_history() {
    for def in registry() {
      let mut last = 0;
      for (v, note) in def.history {
        assert!(*v > last, "{} history out of order", def.label);
        assert!(!note.is_empty());
        last = *v;
      }
      assert_eq!(last, def.version, "{} history must end at current version", def.label);
    }
  }

  #[test]
  fn every_extension_resolves_to_one_parser() {
    for ext in supported_extensions() {
      assert!(lookup(ext).is_some(), "no parser for {ext}");
    }
    assert_eq!(current_parser_version("doc"), 2);
    assert_eq!(current_parser_version("nope"), 0);
  }

  #[test]
  fn parse_file_dispatches_by_extension() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("note.txt");
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(b"hello dispatch").unwrap();

    let extracted = parse_file(&path).unwrap();
    assert_eq!(extracted.pages.len(), 1);
    assert_eq!(extracted.pages[0].text, "hello dispatch");
  }

  #[test]
  fn unsupported_extension_is_typed() {
    let err = parse_file(Path::new("/tmp/a.zip")).unwrap_err();
    assert!(matches!(err, ParseError::UnsupportedExtension(_)));
  }
}
