// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hipc contributors

//! Application-layer fragmentation and drop-tolerant reassembly.
//!
//! Every datagram carries one fragment:
//!
//! ```text
//! +----------------------------------------------------------------+
//! | magic u32 | sender u64 | topic_hash u64 | message_id u64       |
//! | total_size u32 | fragment_index u16 | fragment_count u16       |
//! +----------------------------------------------------------------+
//! | fragment bytes                                                 |
//! +----------------------------------------------------------------+
//! ```
//!
//! Reassembly state is bounded twice: an LRU caps the number of partial
//! messages, and each partial carries a deadline. Timed-out or evicted
//! partials are dropped and counted.

use crate::config::{FRAGMENT_CACHE_SIZE, FRAGMENT_TIMEOUT_MS};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

/// Fragment header magic ("HFRG").
pub const FRAGMENT_MAGIC: u32 = 0x4846_5247;

/// Serialized fragment header size.
pub const FRAGMENT_HEADER_SIZE: usize = 36;

/// Per-datagram fragment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub sender_entity_id: u64,
    pub topic_hash: u64,
    /// Message identity within the sender (the publisher's data clock).
    pub message_id: u64,
    pub total_size: u32,
    pub fragment_index: u16,
    pub fragment_count: u16,
}

impl FragmentHeader {
    pub fn encode(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= FRAGMENT_HEADER_SIZE);
        buf[0..4].copy_from_slice(&FRAGMENT_MAGIC.to_le_bytes());
        buf[4..12].copy_from_slice(&self.sender_entity_id.to_le_bytes());
        buf[12..20].copy_from_slice(&self.topic_hash.to_le_bytes());
        buf[20..28].copy_from_slice(&self.message_id.to_le_bytes());
        buf[28..32].copy_from_slice(&self.total_size.to_le_bytes());
        buf[32..34].copy_from_slice(&self.fragment_index.to_le_bytes());
        buf[34..36].copy_from_slice(&self.fragment_count.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAGMENT_HEADER_SIZE {
            return None;
        }
        let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != FRAGMENT_MAGIC {
            return None;
        }
        Some(Self {
            sender_entity_id: u64::from_le_bytes([
                buf[4], buf[5], buf[6], buf[7], buf[8], buf[9], buf[10], buf[11],
            ]),
            topic_hash: u64::from_le_bytes([
                buf[12], buf[13], buf[14], buf[15], buf[16], buf[17], buf[18], buf[19],
            ]),
            message_id: u64::from_le_bytes([
                buf[20], buf[21], buf[22], buf[23], buf[24], buf[25], buf[26], buf[27],
            ]),
            total_size: u32::from_le_bytes([buf[28], buf[29], buf[30], buf[31]]),
            fragment_index: u16::from_le_bytes([buf[32], buf[33]]),
            fragment_count: u16::from_le_bytes([buf[34], buf[35]]),
        })
    }
}

/// Split a message into ready-to-send datagrams.
pub fn fragment_message(
    sender_entity_id: u64,
    topic_hash: u64,
    message_id: u64,
    message: &[u8],
    mtu: usize,
) -> Vec<Vec<u8>> {
    let chunk_size = mtu.saturating_sub(FRAGMENT_HEADER_SIZE).max(1);
    let count = message.len().div_ceil(chunk_size).max(1);
    let mut datagrams = Vec::with_capacity(count);

    for (index, chunk) in message
        .chunks(chunk_size)
        .chain(std::iter::once(&[][..]).take(usize::from(message.is_empty())))
        .enumerate()
    {
        let header = FragmentHeader {
            sender_entity_id,
            topic_hash,
            message_id,
            total_size: message.len() as u32,
            fragment_index: index as u16,
            fragment_count: count as u16,
        };
        let mut datagram = vec![0u8; FRAGMENT_HEADER_SIZE + chunk.len()];
        header.encode(&mut datagram);
        datagram[FRAGMENT_HEADER_SIZE..].copy_from_slice(chunk);
        datagrams.push(datagram);
    }
    datagrams
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PartialKey {
    sender_entity_id: u64,
    topic_hash: u64,
    message_id: u64,
}

struct Partial {
    bytes: Vec<u8>,
    received: Vec<bool>,
    received_count: u16,
    deadline: Instant,
}

/// Drop-tolerant reassembly table.
pub struct Reassembly {
    partials: LruCache<PartialKey, Partial>,
    timeout: Duration,
    /// Messages abandoned by timeout or LRU eviction.
    dropped: u64,
}

impl Default for Reassembly {
    fn default() -> Self {
        Self::new(FRAGMENT_CACHE_SIZE, Duration::from_millis(FRAGMENT_TIMEOUT_MS))
    }
}

impl Reassembly {
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            partials: LruCache::new(capacity),
            timeout,
            dropped: 0,
        }
    }

    /// Messages dropped so far (timeouts and evictions).
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Feed one fragment; returns the complete message when this fragment
    /// was the last missing piece.
    pub fn push(&mut self, header: &FragmentHeader, payload: &[u8]) -> Option<Vec<u8>> {
        self.sweep_expired();

        if header.fragment_count == 0 || header.fragment_index >= header.fragment_count {
            log::debug!(
                "[UDP] malformed fragment {}/{} discarded",
                header.fragment_index,
                header.fragment_count
            );
            return None;
        }

        // Single-fragment fast path.
        if header.fragment_count == 1 {
            return (payload.len() == header.total_size as usize).then(|| payload.to_vec());
        }

        let key = PartialKey {
            sender_entity_id: header.sender_entity_id,
            topic_hash: header.topic_hash,
            message_id: header.message_id,
        };

        if !self.partials.contains(&key) {
            let partial = Partial {
                bytes: vec![0u8; header.total_size as usize],
                received: vec![false; header.fragment_count as usize],
                received_count: 0,
                deadline: Instant::now() + self.timeout,
            };
            if self.partials.len() == self.partials.cap().get() {
                // LRU full: the evicted partial counts as a drop.
                self.dropped += 1;
            }
            self.partials.put(key, partial);
        }

        let complete = {
            let partial = self.partials.get_mut(&key)?;
            let index = header.fragment_index as usize;
            if partial.received[index] {
                return None;
            }

            // All fragments but the last carry the sender's full chunk
            // size, so the offset follows from the fragment's own length.
            let offset = if index + 1 == header.fragment_count as usize {
                (header.total_size as usize).checked_sub(payload.len())
            } else {
                Some(index * payload.len())
            };
            let end = offset.map(|o| o + payload.len());
            let (offset, end) = match (offset, end) {
                (Some(o), Some(e)) if e <= partial.bytes.len() => (o, e),
                _ => {
                    log::debug!("[UDP] fragment bounds mismatch, discarding message");
                    self.partials.pop(&key);
                    self.dropped += 1;
                    return None;
                }
            };

            partial.bytes[offset..end].copy_from_slice(payload);
            partial.received[index] = true;
            partial.received_count += 1;
            partial.received_count == header.fragment_count
        };

        if complete {
            self.partials.pop(&key).map(|p| p.bytes)
        } else {
            None
        }
    }

    fn sweep_expired(&mut self) {
        let now = Instant::now();
        loop {
            let expired = self
                .partials
                .iter()
                .find(|(_, p)| p.deadline <= now)
                .map(|(k, _)| *k);
            match expired {
                Some(key) => {
                    self.partials.pop(&key);
                    self.dropped += 1;
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_first(datagram: &[u8]) -> (FragmentHeader, &[u8]) {
        let header = FragmentHeader::decode(datagram).expect("header");
        (header, &datagram[FRAGMENT_HEADER_SIZE..])
    }

    #[test]
    fn header_roundtrip() {
        let header = FragmentHeader {
            sender_entity_id: 1,
            topic_hash: 2,
            message_id: 3,
            total_size: 4,
            fragment_index: 0,
            fragment_count: 1,
        };
        let mut buf = [0u8; FRAGMENT_HEADER_SIZE];
        header.encode(&mut buf);
        assert_eq!(FragmentHeader::decode(&buf), Some(header));
    }

    #[test]
    fn small_message_is_one_fragment() {
        let datagrams = fragment_message(1, 2, 3, b"hello", 1400);
        assert_eq!(datagrams.len(), 1);
        let (header, payload) = decode_first(&datagrams[0]);
        assert_eq!(header.fragment_count, 1);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn large_message_fragments_and_reassembles() {
        let message: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        let datagrams = fragment_message(1, 2, 3, &message, 1400);
        assert!(datagrams.len() > 1);

        let mut reassembly = Reassembly::default();
        let mut result = None;
        for datagram in &datagrams {
            let (header, payload) = decode_first(datagram);
            if let Some(complete) = reassembly.push(&header, payload) {
                result = Some(complete);
            }
        }
        assert_eq!(result.expect("reassembled"), message);
        assert_eq!(reassembly.dropped(), 0);
    }

    #[test]
    fn out_of_order_fragments_reassemble() {
        let message: Vec<u8> = (0..4000u32).map(|i| (i * 7) as u8).collect();
        let mut datagrams = fragment_message(9, 9, 9, &message, 1000);
        datagrams.reverse();

        let mut reassembly = Reassembly::default();
        let mut result = None;
        for datagram in &datagrams {
            let (header, payload) = decode_first(datagram);
            if let Some(complete) = reassembly.push(&header, payload) {
                result = Some(complete);
            }
        }
        assert_eq!(result.expect("reassembled"), message);
    }

    #[test]
    fn expired_partials_are_dropped_and_counted() {
        let message = vec![0u8; 4000];
        let datagrams = fragment_message(1, 1, 1, &message, 1000);

        let mut reassembly = Reassembly::new(16, Duration::from_millis(10));
        let (header, payload) = decode_first(&datagrams[0]);
        assert!(reassembly.push(&header, payload).is_none());

        std::thread::sleep(Duration::from_millis(20));

        // Any later fragment sweeps the stale partial away first.
        let (header, payload) = decode_first(&datagrams[1]);
        assert!(reassembly.push(&header, payload).is_none());
        assert_eq!(reassembly.dropped(), 1);
    }

    #[test]
    fn duplicate_fragment_is_ignored() {
        let message = vec![3u8; 3000];
        let datagrams = fragment_message(1, 1, 5, &message, 1000);
        let mut reassembly = Reassembly::default();

        let (header, payload) = decode_first(&datagrams[0]);
        assert!(reassembly.push(&header, payload).is_none());
        assert!(reassembly.push(&header, payload).is_none());

        for datagram in &datagrams[1..] {
            let (header, payload) = decode_first(datagram);
            let _ = reassembly.push(&header, payload);
        }
    }

    #[test]
    fn empty_message_still_produces_a_datagram() {
        let datagrams = fragment_message(1, 2, 3, b"", 1400);
        assert_eq!(datagrams.len(), 1);
        let (header, payload) = decode_first(&datagrams[0]);
        assert_eq!(header.total_size, 0);
        assert!(payload.is_empty());

        let mut reassembly = Reassembly::default();
        assert_eq!(reassembly.push(&header, payload), Some(Vec::new()));
    }
}
