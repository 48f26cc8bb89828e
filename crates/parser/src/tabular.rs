//! CSV / TSV parsers: ragged rows and mixed encodings tolerated.

use std::path::Path;

use crate::encoding::decode_bytes;
use crate::{ExtractedText, ParseError};

pub fn parse_csv(path: &Path) -> Result<ExtractedText, ParseError> {
  parse_delimited(path, b',')
}

pub fn parse_tsv(path: &Path) -> Result<ExtractedText, ParseError> {
  parse_delimited(path, b'\t')
}

fn parse_delimited(path: &Path, delimiter: u8) -> Result<ExtractedText, ParseError> {
  let bytes = std::fs::read(path)?;
  // Decode first so legacy encodings inside quoted fields survive.
  let decoded = decode_bytes(&bytes)?;

  let mut reader = csv::ReaderBuilder::new()
    .delimiter(delimiter)
    .has_headers(false)
    .flexible(true)
    .quoting(true)
    .from_reader(decoded.as_bytes());

  let mut out = String::with_capacity(decoded.len());
  for record in reader.records() {
    let record = match record {
      Ok(r) => r,
      // A malformed row should not sink the whole file.
      Err(e) => {
        tracing::debug!(path = %path.display(), error = %e, "Skipping malformed row");
        continue;
      }
    };

    let mut cells: Vec<&str> = record.iter().collect();
    while cells.last().is_some_and(|c| c.trim().is_empty()) {
      cells.pop();
    }
    if cells.iter().all(|c| c.trim().is_empty()) {
      continue;
    }
    out.push_str(&cells.join("\t"));
    out.push('\n');
  }

  Ok(ExtractedText::flat(out))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  fn write_file(dir: &tempfile::TempDir, name: &str, bytes: &[u8]) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::File::create(&path).unwrap().write_all(bytes).unwrap();
    path
  }

  #[test]
  fn rows_become_tab_joined_lines() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = write_file(&tmp, "t.csv", b"name,age\nalice,30\nbob,41\n");
    let out = parse_csv(&path).unwrap();
    assert_eq!(out.pages[0].text, "name\tage\nalice\t30\nbob\t41\n");
  }

  #[test]
  fn ragged_rows_are_tolerated() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = write_file(&tmp, "t.csv", b"a,b,c\nd,e\nf\n");
    let out = parse_csv(&path).unwrap();
    assert_eq!(out.pages[0].text.lines().count(), 3);
  }

  #[test]
  fn quoted_fields_with_commas_stay_single_cells() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = write_file(&tmp, "t.csv", b"\"last, first\",dept\n");
    let out = parse_csv(&path).unwrap();
    assert_eq!(out.pages[0].text, "last, first\tdept\n");
  }

  #[test]
  fn tsv_uses_tab_delimiter() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = write_file(&tmp, "t.tsv", b"x\ty\n1\t2\n");
    let out = parse_tsv(&path).unwrap();
    assert_eq!(out.pages[0].text, "x\ty\n1\t2\n");
  }

  #[test]
  fn blank_rows_are_skipped() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = write_file(&tmp, "t.csv", b"a,b\n,,\nc,d\n");
    let out = parse_csv(&path).unwrap();
    assert_eq!(out.pages[0].text, "a\tb\nc\td\n");
  }
}
