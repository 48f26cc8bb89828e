//! DOCX parser: unzip, stream `word/document.xml`.

use std::io::Read;
use std::path::Path;

use quick_xml::Reader;
use quick_xml::events::Event;

use crate::{ExtractedText, ParseError};

pub fn parse_docx(path: &Path) -> Result<ExtractedText, ParseError> {
  let file = std::fs::File::open(path)?;
  let mut archive = zip::ZipArchive::new(file).map_err(|e| ParseError::corrupt("docx", e.to_string()))?;

  let mut xml = String::new();
  archive
    .by_name("word/document.xml")
    .map_err(|_| ParseError::corrupt("docx", "missing word/document.xml"))?
    .read_to_string(&mut xml)
    .map_err(|e| ParseError::corrupt("docx", e.to_string()))?;

  Ok(ExtractedText::flat(extract_document_xml(&xml)?))
}

fn local_name(qname: &[u8]) -> &[u8] {
  match qname.iter().position(|&b| b == b':') {
    Some(i) => &qname[i + 1..],
    None => qname,
  }
}

fn extract_document_xml(xml: &str) -> Result<String, ParseError> {
  let mut reader = Reader::from_str(xml);
  reader.trim_text(false);

  let mut out = String::new();
  let mut in_text = false;
  let mut buf = Vec::new();

  loop {
    buf.clear();
    match reader.read_event_into(&mut buf) {
      Ok(Event::Start(e)) => {
        if local_name(e.name().as_ref()) == b"t" {
          in_text = true;
        }
      }
      Ok(Event::Empty(e)) => match local_name(e.name().as_ref()) {
        b"tab" => out.push('\t'),
        b"br" | b"cr" => out.push('\n'),
        _ => {}
      },
      Ok(Event::Text(t)) if in_text => {
        let text = t.unescape().map_err(|e| ParseError::corrupt("docx", e.to_string()))?;
        out.push_str(&text);
      }
      Ok(Event::End(e)) => match local_name(e.name().as_ref()) {
        b"t" => in_text = false,
        b"p" => out.push('\n'),
        _ => {}
      },
      Ok(Event::Eof) => break,
      Err(e) => return Err(ParseError::corrupt("docx", e.to_string())),
      _ => {}
    }
  }

  Ok(out)
}
