use thiserror::Error;

/// Typed parser failures.
///
/// `Empty` and `Failed`-adjacent outcomes are policy decisions made by the
/// caller; the parser only reports what it saw.
#[derive(Error, Debug)]
pub enum ParseError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  /// The file is structurally invalid for its claimed format.
  #[error("Corrupt {format} file: {detail}")]
  Corrupt { format: &'static str, detail: String },

  /// Well-formed file with no extractable text (e.g. a scanned PDF).
  #[error("No extractable text")]
  Empty,

  /// Byte content could not be decoded to text with any confidence.
  #[error("Unsupported encoding: {0}")]
  UnsupportedEncoding(String),

  /// Extension has no registered parser.
  #[error("Unsupported extension: {0}")]
  UnsupportedExtension(String),
}

impl ParseError {
  pub fn corrupt(format: &'static str, detail: impl Into<String>) -> Self {
    ParseError::Corrupt {
      format,
      detail: detail.into(),
    }
  }
}
