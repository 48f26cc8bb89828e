//! Word 97-2003 (.doc) parser.
//!
//! A .doc file is a CFB (compound file) container. Text lives in the
//! `WordDocument` stream; the piece table in `0Table`/`1Table` maps character
//! positions to file offsets and records whether each piece is stored as
//! 8-bit CP-1252 or UTF-16LE.

use std::path::Path;

use crate::{ExtractedText, ParseError};

const CFB_MAGIC: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];
const ENDOFCHAIN: u32 = 0xFFFF_FFFE;
const FREESECT: u32 = 0xFFFF_FFFF;
const FIB_MAGIC: u16 = 0xA5EC;
// fcClx/lcbClx offsets within the FIB, fixed since Word 97.
const FIB_FC_CLX: usize = 0x01A2;
const FIB_LCB_CLX: usize = 0x01A6;

pub fn parse_doc(path: &Path) -> Result<ExtractedText, ParseError> {
  let bytes = std::fs::read(path)?;
  let cfb = Cfb::parse(&bytes)?;

  let word_stream = cfb
    .stream("WordDocument")
    .ok_or_else(|| ParseError::corrupt("doc", "missing WordDocument stream"))?;
  if word_stream.len() < FIB_LCB_CLX + 4 {
    return Err(ParseError::corrupt("doc", "truncated FIB"));
  }
  if read_u16(&word_stream, 0) != FIB_MAGIC {
    return Err(ParseError::corrupt("doc", "bad FIB magic"));
  }

  let flags = read_u16(&word_stream, 0x000A);
  let table_name = if flags & 0x0200 != 0 { "1Table" } else { "0Table" };
  let fc_clx = read_u32(&word_stream, FIB_FC_CLX) as usize;
  let lcb_clx = read_u32(&word_stream, FIB_LCB_CLX) as usize;

  let text = if lcb_clx > 0
    && let Some(table_stream) = cfb.stream(table_name)
    && let Some(pieces) = parse_piece_table(&table_stream, fc_clx, lcb_clx)
  {
    extract_pieces(&word_stream, &pieces)
  } else {
    // No piece table: single contiguous run between fcMin and fcMac.
    let fc_min = read_u32(&word_stream, 0x0018) as usize;
    let fc_mac = read_u32(&word_stream, 0x001C) as usize;
    extract_flat_run(&word_stream, fc_min, fc_mac)
  };

  Ok(ExtractedText::flat(normalize_word_text(&text)))
}

// ============================================================================
// CFB container
// ============================================================================

struct Cfb<'a> {
  bytes: &'a [u8],
  sector_size: usize,
  mini_sector_size: usize,
  mini_cutoff: u64,
  fat: Vec<u32>,
  minifat: Vec<u32>,
  directory: Vec<DirEntry>,
  mini_stream: Vec<u8>,
}

struct DirEntry {
  name: String,
  object_type: u8,
  start_sector: u32,
  size: u64,
}

impl<'a> Cfb<'a> {
  fn parse(bytes: &'a [u8]) -> Result<Self, ParseError> {
    if bytes.len() < 512 || bytes[..8] != CFB_MAGIC {
      return Err(ParseError::corrupt("doc", "not a compound file"));
    }

    let sector_shift = read_u16(bytes, 30);
    let mini_shift = read_u16(bytes, 32);
    if !(7u16..=20).contains(&sector_shift) || mini_shift as usize >= sector_shift as usize {
      return Err(ParseError::corrupt("doc", "implausible sector shift"));
    }
    let sector_size = 1usize << sector_shift;
    let mini_sector_size = 1usize << mini_shift;

    let num_fat_sectors = read_u32(bytes, 44) as usize;
    let first_dir_sector = read_u32(bytes, 48);
    let mini_cutoff = read_u32(bytes, 56) as u64;
    let first_minifat_sector = read_u32(bytes, 60);
    let num_minifat_sectors = read_u32(bytes, 64) as usize;
    let first_difat_sector = read_u32(bytes, 68);
    let num_difat_sectors = read_u32(bytes, 72) as usize;

    // DIFAT: 109 header entries, then chained DIFAT sectors.
    let mut fat_sector_ids = Vec::with_capacity(num_fat_sectors);
    for i in 0..109 {
      let id = read_u32(bytes, 76 + i * 4);
      if id != FREESECT {
        fat_sector_ids.push(id);
      }
    }
    let mut difat_sector = first_difat_sector;
    for _ in 0..num_difat_sectors {
      if difat_sector >= ENDOFCHAIN {
        break;
      }
      let data = sector(bytes, sector_size, difat_sector)
        .ok_or_else(|| ParseError::corrupt("doc", "DIFAT sector out of range"))?;
      let entries = sector_size / 4 - 1;
      for i in 0..entries {
        let id = read_u32(data, i * 4);
        if id != FREESECT {
          fat_sector_ids.push(id);
        }
      }
      difat_sector = read_u32(data, sector_size - 4);
    }

    let mut fat = Vec::with_capacity(fat_sector_ids.len() * (sector_size / 4));
    for id in fat_sector_ids {
      let data =
        sector(bytes, sector_size, id).ok_or_else(|| ParseError::corrupt("doc", "FAT sector out of range"))?;
      for i in 0..sector_size / 4 {
        fat.push(read_u32(data, i * 4));
      }
    }

    let mut cfb = Cfb {
      bytes,
      sector_size,
      mini_sector_size,
      mini_cutoff,
      fat,
      minifat: Vec::new(),
      directory: Vec::new(),
      mini_stream: Vec::new(),
    };

    // Directory chain.
    let dir_bytes = cfb.read_chain(first_dir_sector, usize::MAX)?;
    for entry in dir_bytes.chunks_exact(128) {
      let name_len = read_u16(entry, 64) as usize;
      if name_len < 2 || name_len > 64 {
        continue;
      }
      let units: Vec<u16> = (0..(name_len - 2) / 2).map(|i| read_u16(entry, i * 2)).collect();
      cfb.directory.push(DirEntry {
        name: String::from_utf16_lossy(&units),
        object_type: entry[66],
        start_sector: read_u32(entry, 116),
        size: read_u64(entry, 120) & 0xFFFF_FFFF,
      });
    }

    // MiniFAT plus the root entry's mini stream container.
    let minifat_bytes = if num_minifat_sectors > 0 {
      cfb.read_chain(first_minifat_sector, usize::MAX)?
    } else {
      Vec::new()
    };
    cfb.minifat = minifat_bytes.chunks_exact(4).map(|c| u32::from_le_bytes(c.try_into().unwrap())).collect();

    let root = cfb
      .directory
      .iter()
      .find(|e| e.object_type == 5)
      .map(|e| (e.start_sector, e.size as usize));
    if let Some((start, size)) = root {
      cfb.mini_stream = cfb.read_chain(start, size)?;
    }

    Ok(cfb)
  }

  /// Follow a FAT chain from `start`, truncating to `size`.
  fn read_chain(&self, start: u32, size: usize) -> Result<Vec<u8>, ParseError> {
    let mut out = Vec::new();
    let mut current = start;
    let mut hops = 0usize;
    while current < ENDOFCHAIN {
      let data = sector(self.bytes, self.sector_size, current)
        .ok_or_else(|| ParseError::corrupt("doc", "sector chain out of range"))?;
      out.extend_from_slice(data);
      current = self.fat.get(current as usize).copied().unwrap_or(ENDOFCHAIN);
      hops += 1;
      if hops > self.fat.len().max(1) {
        return Err(ParseError::corrupt("doc", "FAT chain cycle"));
      }
    }
    if size != usize::MAX {
      out.truncate(size);
    }
    Ok(out)
  }

  /// Follow a miniFAT chain inside the mini stream.
  fn read_mini_chain(&self, start: u32, size: usize) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    let mut current = start;
    let mut hops = 0usize;
    while current < ENDOFCHAIN {
      let begin = current as usize * self.mini_sector_size;
      let end = (begin + self.mini_sector_size).min(self.mini_stream.len());
      if begin >= self.mini_stream.len() {
        return None;
      }
      out.extend_from_slice(&self.mini_stream[begin..end]);
      current = self.minifat.get(current as usize).copied()?;
      hops += 1;
      if hops > self.minifat.len().max(1) {
        return None;
      }
    }
    out.truncate(size);
    Some(out)
  }

  /// Read a named stream, choosing FAT or miniFAT by the size cutoff.
  fn stream(&self, name: &str) -> Option<Vec<u8>> {
    let entry = self.directory.iter().find(|e| e.object_type == 2 && e.name == name)?;
    let size = entry.size as usize;
    if entry.size < self.mini_cutoff {
      self.read_mini_chain(entry.start_sector, size)
    } else {
      self.read_chain(entry.start_sector, size).ok()
    }
  }
}

fn sector(bytes: &[u8], sector_size: usize, id: u32) -> Option<&[u8]> {
  let begin = (id as usize + 1) * sector_size;
  let end = begin + sector_size;
  bytes.get(begin..end)
}

// ============================================================================
// Piece table
// ============================================================================

struct Piece {
  /// Character count of the piece.
  chars: usize,
  /// Byte offset in the WordDocument stream.
  offset: usize,
  /// 8-bit CP-1252 when true, UTF-16LE otherwise.
  compressed: bool,
}

/// Walk the Clx at `table[fc..fc+lcb]` to its Pcdt and decode the PlcPcd.
fn parse_piece_table(table: &[u8], fc: usize, lcb: usize) -> Option<Vec<Piece>> {
  let clx = table.get(fc..fc + lcb)?;
  let mut i = 0;

  // Skip Prc entries (clxt = 1) preceding the Pcdt (clxt = 2).
  while i < clx.len() && clx[i] == 1 {
    let cb = read_u16(clx, i + 1) as usize;
    i += 3 + cb;
  }
  if i >= clx.len() || clx[i] != 2 {
    return None;
  }
  let lcb_plc = read_u32(clx, i + 1) as usize;
  let plc = clx.get(i + 5..i + 5 + lcb_plc)?;

  // PlcPcd layout: (n+1) CPs of 4 bytes, then n PCDs of 8 bytes.
  if plc.len() < 4 || (plc.len() - 4) % 12 != 0 {
    return None;
  }
  let n = (plc.len() - 4) / 12;
  let mut pieces = Vec::with_capacity(n);
  for k in 0..n {
    let cp_start = read_u32(plc, k * 4) as usize;
    let cp_end = read_u32(plc, (k + 1) * 4) as usize;
    let pcd = &plc[(n + 1) * 4 + k * 8..(n + 1) * 4 + k * 8 + 8];
    let fc_raw = read_u32(pcd, 2);
    let compressed = fc_raw & 0x4000_0000 != 0;
    let offset = if compressed {
      ((fc_raw & 0x3FFF_FFFF) / 2) as usize
    } else {
      (fc_raw & 0x3FFF_FFFF) as usize
    };
    pieces.push(Piece {
      chars: cp_end.saturating_sub(cp_start),
      offset,
      compressed,
    });
  }
  Some(pieces)
}

fn extract_pieces(word_stream: &[u8], pieces: &[Piece]) -> String {
  let mut out = String::new();
  for piece in pieces {
    if piece.compressed {
      if let Some(run) = word_stream.get(piece.offset..piece.offset + piece.chars) {
        let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(run);
        out.push_str(&decoded);
      }
    } else if let Some(run) = word_stream.get(piece.offset..piece.offset + piece.chars * 2) {
      let units: Vec<u16> = run.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
      out.push_str(&String::from_utf16_lossy(&units));
    }
  }
  out
}

fn extract_flat_run(word_stream: &[u8], fc_min: usize, fc_mac: usize) -> String {
  let Some(run) = word_stream.get(fc_min..fc_mac) else {
    return String::new();
  };
  // Heuristic: UTF-16 runs have a high density of zero bytes.
  let zeros = run.iter().filter(|&&b| b == 0).count();
  if run.len() >= 4 && zeros * 3 > run.len() {
    let units: Vec<u16> = run.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
    String::from_utf16_lossy(&units)
  } else {
    let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(run);
    decoded.into_owned()
  }
}

/// Map Word's in-text control characters to plain text.
fn normalize_word_text(text: &str) -> String {
  let mut out = String::with_capacity(text.len());
  for c in text.chars() {
    match c {
      '\r' | '\u{000B}' => out.push('\n'),
      // Cell and row marks.
      '\u{0007}' => out.push('\t'),
      // Field begin/separator/end and object anchors.
      '\u{0013}' | '\u{0014}' | '\u{0015}' | '\u{0001}' | '\u{0008}' => {}
      c if c.is_control() && c != '\n' && c != '\t' => {}
      c => out.push(c),
    }
  }
  out
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
  bytes
    .get(offset..offset + 2)
    .map(|b| u16::from_le_bytes([b[0], b[1]]))
    .unwrap_or(0)
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
  bytes
    .get(offset..offset + 4)
    .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    .unwrap_or(0)
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
  bytes
    .get(offset..offset + 8)
    .map(|b| u64::from_le_bytes(b.try_into().unwrap()))
    .unwrap_or(0)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn non_cfb_bytes_are_corrupt() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("fake.doc");
    std::fs::write(&path, b"this is not a compound file").unwrap();
    assert!(matches!(
      parse_doc(&path).unwrap_err(),
      ParseError::Corrupt { format: "doc", .. }
    ));
  }

  #[test]
  fn truncated_cfb_is_corrupt() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("short.doc");
    std::fs::write(&path, CFB_MAGIC).unwrap();
    assert!(matches!(parse_doc(&path).unwrap_err(), ParseError::Corrupt { .. }));
  }

  #[test]
  fn word_control_chars_normalize() {
    let text = "line one\rcell\u{0007}mark\u{0013}FIELD\u{0015}";
    assert_eq!(normalize_word_text(text), "line one\ncell\tmarkFIELD");
  }

  #[test]
  fn flat_run_detects_utf16() {
    let mut run = Vec::new();
    for unit in "wide text".encode_utf16() {
      run.extend_from_slice(&unit.to_le_bytes());
    }
    assert_eq!(extract_flat_run(&run, 0, run.len()), "wide text");
    assert_eq!(extract_flat_run(b"narrow text", 0, 11), "narrow text");
  }

  #[test]
  fn piece_table_decodes_mixed_pieces() {
    // One compressed piece ("abc") and one unicode piece ("dé").
    // WordDocument layout: bytes 0..3 = "abc", bytes 4..8 = UTF-16 "dé".
    let mut word = b"abc\0".to_vec();
    for unit in "dé".encode_utf16() {
      word.extend_from_slice(&unit.to_le_bytes());
    }

    // PlcPcd: CPs [0, 3, 5]; PCD0 fc = (0*2) | compressed bit; PCD1 fc = 4.
    let mut plc = Vec::new();
    for cp in [0u32, 3, 5] {
      plc.extend_from_slice(&cp.to_le_bytes());
    }
    let mut pcd0 = vec![0u8; 8];
    pcd0[2..6].copy_from_slice(&(0x4000_0000u32).to_le_bytes());
    let mut pcd1 = vec![0u8; 8];
    pcd1[2..6].copy_from_slice(&4u32.to_le_bytes());
    plc.extend_from_slice(&pcd0);
    plc.extend_from_slice(&pcd1);

    // Clx = Pcdt only.
    let mut table = vec![2u8];
    table.extend_from_slice(&(plc.len() as u32).to_le_bytes());
    table.extend_from_slice(&plc);

    let pieces = parse_piece_table(&table, 0, table.len()).unwrap();
    assert_eq!(pieces.len(), 2);
    assert!(pieces[0].compressed);
    assert!(!pieces[1].compressed);
    assert_eq!(extract_pieces(&word, &pieces), "abcdé");
  }
}
