//! Byte → UTF-8 decoding: BOM sniff first, then statistical detection.

use chardetng::EncodingDetector;
use encoding_rs::{Encoding, UTF_8, UTF_16BE, UTF_16LE};

use crate::ParseError;

/// Fraction of replacement characters above which a decode is rejected.
const MAX_REPLACEMENT_RATIO: f64 = 0.05;

/// Decode arbitrary bytes to a UTF-8 string.
///
/// BOMs win outright; otherwise chardetng guesses from the head of the file.
/// A decode that produces too many replacement characters is treated as an
/// unsupported encoding rather than silently indexing mojibake.
pub fn decode_bytes(bytes: &[u8]) -> Result<String, ParseError> {
  if bytes.is_empty() {
    return Ok(String::new());
  }

  let encoding = sniff_bom(bytes).unwrap_or_else(|| detect(bytes));
  let (text, _, had_errors) = encoding.decode(bytes);

  if had_errors {
    let replacements = text.chars().filter(|&c| c == '\u{FFFD}').count();
    let total = text.chars().count().max(1);
    if replacements as f64 / total as f64 > MAX_REPLACEMENT_RATIO {
      return Err(ParseError::UnsupportedEncoding(format!(
        "{} ({} replacement chars)",
        encoding.name(),
        replacements
      )));
    }
  }

  Ok(text.into_owned())
}

fn sniff_bom(bytes: &[u8]) -> Option<&'static Encoding> {
  if bytes.starts_with(&[0xEF, 0xBB, 0xBF]) {
    Some(UTF_8)
  } else if bytes.starts_with(&[0xFF, 0xFE]) {
    Some(UTF_16LE)
  } else if bytes.starts_with(&[0xFE, 0xFF]) {
    Some(UTF_16BE)
  } else {
    None
  }
}

fn detect(bytes: &[u8]) -> &'static Encoding {
  let mut detector = EncodingDetector::new();
  // The first 64 KiB is plenty for a confident guess.
  let head = &bytes[..bytes.len().min(64 * 1024)];
  detector.feed(head, bytes.len() <= 64 * 1024);
  detector.guess(None, true)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn plain_ascii_decodes() {
    assert_eq!(decode_bytes(b"hello world").unwrap(), "hello world");
  }

  #[test]
  fn utf8_bom_is_honored_and_stripped_content_preserved() {
    let mut bytes = vec![0xEF, 0xBB, 0xBF];
    bytes.extend_from_slice("café".as_bytes());
    let text = decode_bytes(&bytes).unwrap();
    assert!(text.ends_with("café"));
  }

  #[test]
  fn windows_1252_is_detected() {
    // "café décembre" in Windows-1252: é = 0xE9.
    let bytes = b"caf\xe9 d\xe9cembre and some more latin text to help the detector settle";
    let text = decode_bytes(bytes).unwrap();
    assert!(text.contains("café"), "got: {text}");
    assert!(text.contains("décembre"), "got: {text}");
  }

  #[test]
  fn utf16le_bom_decodes() {
    let mut bytes = vec![0xFF, 0xFE];
    for unit in "hello".encode_utf16() {
      bytes.extend_from_slice(&unit.to_le_bytes());
    }
    assert_eq!(decode_bytes(&bytes).unwrap(), "hello");
  }

  #[test]
  fn empty_input_is_empty_string() {
    assert_eq!(decode_bytes(b"").unwrap(), "");
  }
}
