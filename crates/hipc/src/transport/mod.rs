// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hipc contributors

//! Payload transport layers: shared memory, UDP multicast, TCP.
//!
//! All three layers move the same unit: a payload frame, i.e. the frame
//! header defined here followed by opaque payload bytes. The header is
//! stored at the start of a memfile, at the front of a reassembled UDP
//! message, and inside every TCP length-prefixed frame, so a subscriber
//! can deduplicate frames that arrive on several layers at once.

pub mod shm;
pub mod tcp;
pub mod udp;

pub use crate::core::types::TransportLayer;

use std::sync::Arc;

/// Frame header magic ("HIPC").
pub const PAYLOAD_MAGIC: u32 = 0x4850_4943;

/// Size of the frame header as currently written.
pub const PAYLOAD_HEADER_SIZE: usize = 40;

/// The publisher requests an acknowledge signal for this frame (SHM only).
pub const FLAG_ACK_REQUESTED: u16 = 0x0001;

/// Readers hand the callback a pointer into the memfile instead of a copy
/// (SHM only; set by publishers in zero-copy mode).
pub const FLAG_ZERO_COPY: u16 = 0x0002;

/// Per-frame metadata preceding the payload bytes.
///
/// Readers MUST check `magic` and accept any `header_size >= 40`, skipping
/// unknown trailing header fields, to stay forward-compatible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadHeader {
    pub flags: u16,
    pub payload_size: u64,
    /// Monotonically increasing per-publisher sequence number.
    pub data_clock: u64,
    /// Send timestamp in microseconds since the Unix epoch.
    pub send_timestamp_us: i64,
    pub sender_entity_id: u64,
}

impl PayloadHeader {
    /// Serialize into a 40-byte buffer.
    pub fn encode(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= PAYLOAD_HEADER_SIZE);
        buf[0..4].copy_from_slice(&PAYLOAD_MAGIC.to_le_bytes());
        buf[4..6].copy_from_slice(&(PAYLOAD_HEADER_SIZE as u16).to_le_bytes());
        buf[6..8].copy_from_slice(&self.flags.to_le_bytes());
        buf[8..16].copy_from_slice(&self.payload_size.to_le_bytes());
        buf[16..24].copy_from_slice(&self.data_clock.to_le_bytes());
        buf[24..32].copy_from_slice(&self.send_timestamp_us.to_le_bytes());
        buf[32..40].copy_from_slice(&self.sender_entity_id.to_le_bytes());
    }

    /// Deserialize, returning the header and its size on the wire.
    ///
    /// Returns `None` on bad magic or a header claiming to be smaller than
    /// the fields we need.
    pub fn decode(buf: &[u8]) -> Option<(Self, usize)> {
        if buf.len() < PAYLOAD_HEADER_SIZE {
            return None;
        }
        let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != PAYLOAD_MAGIC {
            return None;
        }
        let header_size = u16::from_le_bytes([buf[4], buf[5]]) as usize;
        if header_size < PAYLOAD_HEADER_SIZE || header_size > buf.len() {
            return None;
        }
        let header = Self {
            flags: u16::from_le_bytes([buf[6], buf[7]]),
            payload_size: u64::from_le_bytes([
                buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
            ]),
            data_clock: u64::from_le_bytes([
                buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
            ]),
            send_timestamp_us: i64::from_le_bytes([
                buf[24], buf[25], buf[26], buf[27], buf[28], buf[29], buf[30], buf[31],
            ]),
            sender_entity_id: u64::from_le_bytes([
                buf[32], buf[33], buf[34], buf[35], buf[36], buf[37], buf[38], buf[39],
            ]),
        };
        Some((header, header_size))
    }
}

/// Frame metadata handed to the receive sink together with the payload.
#[derive(Debug, Clone, Copy)]
pub struct FrameMeta {
    pub sender_entity_id: u64,
    pub data_clock: u64,
    pub send_timestamp_us: i64,
    pub layer: TransportLayer,
}

/// Receive sink shared by all layer readers of one subscriber.
///
/// The payload slice is only valid for the duration of the call (the SHM
/// zero-copy path hands out a pointer into the memfile).
pub type FrameSink = Arc<dyn Fn(FrameMeta, &[u8]) + Send + Sync>;
