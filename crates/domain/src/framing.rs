//! Length-prefixed JSON framing for the session pipes.
//!
//! Each frame is a 4-byte native-endian unsigned length followed by exactly
//! that many bytes of UTF-8 JSON. Frames above [`MAX_FRAME_BYTES`] are a
//! protocol violation and terminate the session.

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Maximum frame payload: 10 MiB.
pub const MAX_FRAME_BYTES: u32 = 10 * 1024 * 1024;

/// Read exactly `buf.len()` bytes, retrying on interruption.
///
/// Returns the number of bytes actually read: `buf.len()` on success, less
/// on end-of-stream (0 for a clean EOF before any data).
fn read_exactly(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match reader.read(&mut buf[total..]) {
            Ok(0) => return Ok(total),
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(total)
}

/// Read one raw frame. `Ok(None)` means the peer closed the stream cleanly
/// between frames; a close mid-frame is an error.
pub fn read_frame(reader: &mut impl Read) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    let n = read_exactly(reader, &mut len_buf)?;
    if n == 0 {
        return Ok(None);
    }
    if n < len_buf.len() {
        return Err(Error::Pipe(format!(
            "truncated frame header ({n} of 4 bytes)"
        )));
    }

    let len = u32::from_ne_bytes(len_buf);
    if len == 0 || len > MAX_FRAME_BYTES {
        return Err(Error::Pipe(format!("invalid frame length: {len}")));
    }

    let mut body = vec![0u8; len as usize];
    let n = read_exactly(reader, &mut body)?;
    if n < body.len() {
        return Err(Error::Pipe(format!(
            "incomplete frame body (expected {len} bytes, got {n})"
        )));
    }
    Ok(Some(body))
}

/// Write one raw frame.
pub fn write_frame(writer: &mut impl Write, payload: &[u8]) -> Result<()> {
    if payload.is_empty() || payload.len() > MAX_FRAME_BYTES as usize {
        return Err(Error::Pipe(format!(
            "refusing to write frame of {} bytes",
            payload.len()
        )));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_ne_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Read and deserialize one JSON frame. `Ok(None)` on clean EOF.
pub fn read_message<T: DeserializeOwned>(reader: &mut impl Read) -> Result<Option<T>> {
    match read_frame(reader)? {
        Some(body) => Ok(Some(serde_json::from_slice(&body)?)),
        None => Ok(None),
    }
}

/// Serialize and write one JSON frame.
pub fn write_message<T: Serialize>(writer: &mut impl Write, message: &T) -> Result<()> {
    let body = serde_json::to_vec(message)?;
    write_frame(writer, &body)
}
