//! XLSX/XLS parser: sheet-name headers plus tab-joined rows.

use std::path::Path;

use calamine::{Data, Reader};

use crate::{ExtractedText, ParseError};

pub fn parse_excel(path: &Path) -> Result<ExtractedText, ParseError> {
  let mut workbook =
    calamine::open_workbook_auto(path).map_err(|e| ParseError::corrupt("excel", e.to_string()))?;

  let names: Vec<String> = workbook.sheet_names();
  if names.is_empty() {
    return Err(ParseError::Empty);
  }

  let mut out = String::new();
  for name in &names {
    let range = match workbook.worksheet_range(name) {
      Ok(r) => r,
      Err(e) => {
        tracing::warn!(sheet = %name, error = %e, "Skipping unreadable sheet");
        continue;
      }
    };

    out.push_str("Sheet: ");
    out.push_str(name);
    out.push('\n');

    for row in range.rows() {
      let mut cells: Vec<String> = row.iter().map(cell_to_string).collect();
      while cells.last().is_some_and(|c| c.trim().is_empty()) {
        cells.pop();
      }
      if cells.iter().all(|c| c.trim().is_empty()) {
        continue;
      }
      out.push_str(&cells.join("\t"));
      out.push('\n');
    }
  }

  Ok(ExtractedText::flat(out))
}

fn cell_to_string(cell: &Data) -> String {
  match cell {
    Data::Empty => String::new(),
    Data::String(s) => s.replace("\r\n", "\n").replace('\r', "\n").replace('\n', " "),
    Data::Float(f) => {
      if f.fract() == 0.0 {
        format!("{}", *f as i64)
      } else {
        f.to_string()
      }
    }
    Data::Int(i) => i.to_string(),
    Data::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
    Data::Error(e) => format!("#ERR:{e:?}"),
    other => format!("{other}"),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn floats_render_without_trailing_zeroes() {
    assert_eq!(cell_to_string(&Data::Float(3.0)), "3");
    assert_eq!(cell_to_string(&Data::Float(3.5)), "3.5");
  }

  #[test]
  fn strings_flatten_cell_newlines() {
    assert_eq!(cell_to_string(&Data::String("a\r\nb".to_string())), "a b");
  }

  #[test]
  fn bools_are_spreadsheet_style() {
    assert_eq!(cell_to_string(&Data::Bool(true)), "TRUE");
    assert_eq!(cell_to_string(&Data::Bool(false)), "FALSE");
  }

  #[test]
  fn nonexistent_workbook_is_corrupt() {
    let err = parse_excel(Path::new("/missing/book.xlsx")).unwrap_err();
    assert!(matches!(err, ParseError::Corrupt { format: "excel", .. }));
  }
}
