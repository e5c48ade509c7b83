// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hipc contributors

//! In-place payload production for zero-copy sends.
//!
//! A [`PayloadWriter`] produces the payload directly inside the transport
//! buffer (for SHM: directly inside the memfile). `write_full` must be
//! able to run more than once per send: the payload may have to be
//! materialized again for additional transport layers.

/// Producer of a payload of known size.
pub trait PayloadWriter: Send {
    /// Fill the whole target buffer. Returns false on failure, in which
    /// case nothing is sent on this layer.
    fn write_full(&mut self, buf: &mut [u8]) -> bool;

    /// Update an already initialized buffer (acknowledged SHM reuses the
    /// same memfile between sends). Defaults to a full rewrite.
    fn write_modified(&mut self, buf: &mut [u8]) -> bool {
        self.write_full(buf)
    }

    /// Exact payload size in bytes.
    fn size(&self) -> usize;
}

/// Adapter sending a plain byte slice through the writer path.
pub struct BufferPayloadWriter<'a> {
    bytes: &'a [u8],
}

impl<'a> BufferPayloadWriter<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }
}

impl PayloadWriter for BufferPayloadWriter<'_> {
    fn write_full(&mut self, buf: &mut [u8]) -> bool {
        if buf.len() < self.bytes.len() {
            return false;
        }
        buf[..self.bytes.len()].copy_from_slice(self.bytes);
        true
    }

    fn size(&self) -> usize {
        self.bytes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_writer_fills_target() {
        let mut writer = BufferPayloadWriter::new(b"abc");
        assert_eq!(writer.size(), 3);

        let mut buf = [0u8; 3];
        assert!(writer.write_full(&mut buf));
        assert_eq!(&buf, b"abc");

        // Repeatable (multi-layer sends).
        let mut buf2 = [0u8; 3];
        assert!(writer.write_full(&mut buf2));
        assert_eq!(&buf2, b"abc");
    }

    #[test]
    fn buffer_writer_rejects_short_target() {
        let mut writer = BufferPayloadWriter::new(b"abcd");
        let mut buf = [0u8; 2];
        assert!(!writer.write_full(&mut buf));
    }
}
