//! Blocking length-prefixed JSON framing over std IO.
//!
//! Layout matches the parent's tokio `LengthDelimitedCodec` defaults:
//! a 4-byte big-endian length followed by the JSON payload.

use std::io::{Read, Write};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Frames above this are rejected as protocol corruption.
const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// Read one frame; `Ok(None)` on clean EOF at a frame boundary.
pub fn read_frame<T: DeserializeOwned>(input: &mut impl Read) -> std::io::Result<Option<T>> {
  let mut len_bytes = [0u8; 4];
  match input.read_exact(&mut len_bytes) {
    Ok(()) => {}
    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
    Err(e) => return Err(e),
  }

  let len = u32::from_be_bytes(len_bytes);
  if len > MAX_FRAME_BYTES {
    return Err(std::io::Error::new(
      std::io::ErrorKind::InvalidData,
      format!("frame length {len} exceeds limit"),
    ));
  }

  let mut payload = vec![0u8; len as usize];
  input.read_exact(&mut payload)?;
  let value = serde_json::from_slice(&payload)
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
  Ok(Some(value))
}

pub fn write_frame<T: Serialize>(output: &mut impl Write, value: &T) -> std::io::Result<()> {
  let payload = serde_json::to_vec(value).map_err(std::io::Error::other)?;
  output.write_all(&(payload.len() as u32).to_be_bytes())?;
  output.write_all(&payload)?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use ipc::WorkerReply;

  #[test]
  fn frames_round_trip() {
    let reply = WorkerReply::Ready { dim: 384 };
    let mut buffer = Vec::new();
    write_frame(&mut buffer, &reply).unwrap();

    let mut cursor = std::io::Cursor::new(buffer);
    let back: WorkerReply = read_frame(&mut cursor).unwrap().unwrap();
    assert_eq!(back, reply);
    // Next read is clean EOF.
    assert!(read_frame::<WorkerReply>(&mut cursor).unwrap().is_none());
  }

  #[test]
  fn oversized_frames_are_rejected() {
    let mut buffer = Vec::new();
    buffer.extend_from_slice(&u32::MAX.to_be_bytes());
    let mut cursor = std::io::Cursor::new(buffer);
    assert!(read_frame::<WorkerReply>(&mut cursor).is_err());
  }

  #[test]
  fn truncated_payload_is_an_error() {
    let mut buffer = Vec::new();
    buffer.extend_from_slice(&100u32.to_be_bytes());
    buffer.extend_from_slice(b"short");
    let mut cursor = std::io::Cursor::new(buffer);
    assert!(read_frame::<WorkerReply>(&mut cursor).is_err());
  }
}
