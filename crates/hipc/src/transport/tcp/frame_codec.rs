// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hipc contributors

//! Length-prefix framing for streaming transports.
//!
//! TCP is a stream protocol without message boundaries; a 4-byte
//! big-endian length prefix delimits each frame:
//!
//! ```text
//! +----------------+-------------------+
//! | Length (4B BE) | Frame bytes       |
//! +----------------+-------------------+
//! ```
//!
//! The length field counts the frame bytes only (not itself). Frames
//! larger than the caller's limit are rejected before allocation to keep
//! a malicious or corrupt peer from triggering huge buffers.

use std::io::{self, Read, Write};

/// Size of the length prefix.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Prepend the length prefix to a frame body.
pub fn encode_frame(body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);
    frame
}

/// Write one frame (length prefix + body).
pub fn write_frame<W: Write>(writer: &mut W, body: &[u8]) -> io::Result<()> {
    writer.write_all(&(body.len() as u32).to_be_bytes())?;
    writer.write_all(body)?;
    Ok(())
}

/// Read one complete frame.
///
/// Returns `Ok(None)` on clean EOF at a frame boundary. Oversized length
/// prefixes yield `InvalidData`.
pub fn read_frame<R: Read>(reader: &mut R, max_size: usize) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; FRAME_HEADER_SIZE];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit {}", len, max_size),
        ));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(Some(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn encode_prefixes_big_endian_length() {
        let frame = encode_frame(b"abc");
        assert_eq!(&frame[..4], &3u32.to_be_bytes());
        assert_eq!(&frame[4..], b"abc");
    }

    #[test]
    fn read_back_to_back_frames() {
        let mut stream = Vec::new();
        write_frame(&mut stream, b"first").expect("write");
        write_frame(&mut stream, b"second").expect("write");

        let mut cursor = Cursor::new(stream);
        assert_eq!(
            read_frame(&mut cursor, 1024).expect("read"),
            Some(b"first".to_vec())
        );
        assert_eq!(
            read_frame(&mut cursor, 1024).expect("read"),
            Some(b"second".to_vec())
        );
        assert_eq!(read_frame(&mut cursor, 1024).expect("read"), None);
    }

    #[test]
    fn empty_frame_roundtrip() {
        let mut cursor = Cursor::new(encode_frame(b""));
        assert_eq!(read_frame(&mut cursor, 16).expect("read"), Some(Vec::new()));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&1_000_000u32.to_be_bytes());
        let mut cursor = Cursor::new(stream);
        let err = read_frame(&mut cursor, 1024).expect_err("must reject");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_body_is_an_error() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&10u32.to_be_bytes());
        stream.extend_from_slice(b"short");
        let mut cursor = Cursor::new(stream);
        assert!(read_frame(&mut cursor, 1024).is_err());
    }
}
