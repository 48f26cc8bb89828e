//! Plain-text parser.

use std::path::Path;

use crate::encoding::decode_bytes;
use crate::{ExtractedText, ParseError};

pub fn parse_txt(path: &Path) -> Result<ExtractedText, ParseError> {
  let bytes = std::fs::read(path)?;
  let mut text = decode_bytes(&bytes)?;
  // Normalize CRLF so offsets are stable across platforms.
  if text.contains('\r') {
    text = text.replace("\r\n", "\n").replace('\r', "\n");
  }
  Ok(ExtractedText::flat(text))
}
