// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hipc contributors

//! A single memory-mapped payload file.
//!
//! # Memory Layout
//!
//! ```text
//! +--------------------------------------------------------------+
//! | MemfileControl (64 bytes, atomics)                           |
//! +--------------------------------------------------------------+
//! | Payload frame header region (64 bytes, rewritten per frame)  |
//! +--------------------------------------------------------------+
//! | Payload bytes (capacity bytes)                               |
//! +--------------------------------------------------------------+
//! ```
//!
//! # Write Protocol
//!
//! 1. `write_gen = even + 1` (odd: in progress)
//! 2. write payload, then the frame header (header last, so readers never
//!    see a valid header over half-written payload)
//! 3. `write_gen = even + 2` (Release: committed)
//!
//! Readers bracket access with `reader_count` and re-check `write_gen`
//! afterwards to detect a forced overwrite.

use super::futex;
use super::segment::ShmSegment;
use super::{Result, ShmError};
use crate::transport::{PayloadHeader, PAYLOAD_HEADER_SIZE};
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Control block magic ("HMF1").
pub const MEMFILE_MAGIC: u32 = 0x484D_4631;

/// Size of the control block at offset 0.
pub const CONTROL_SIZE: usize = 64;

/// Size of the frame header region (room for future header growth).
const HEADER_REGION_SIZE: usize = 64;

/// Offset of the payload bytes.
pub const PAYLOAD_OFFSET: usize = CONTROL_SIZE + HEADER_REGION_SIZE;

/// Cross-process control block at the start of every memfile.
#[repr(C)]
pub struct MemfileControl {
    pub magic: u32,
    pub control_size: u32,
    /// Payload capacity in bytes.
    pub capacity: u64,
    /// Odd while a write is in progress, even when committed.
    pub write_gen: AtomicU32,
    /// Ring-wide announcement counter; only used on the first file of a
    /// ring, woken after every committed frame (futex word).
    pub announce_seq: AtomicU32,
    /// Readers currently inside the file.
    pub reader_count: AtomicI32,
    /// Outstanding acknowledge signals (futex word, acknowledged mode).
    pub ack_pending: AtomicU32,
    _reserved: [u8; 32],
}

/// One memory-mapped payload file of a publisher's ring.
pub struct Memfile {
    segment: ShmSegment,
}

impl Memfile {
    /// Create a memfile whose payload region holds `capacity` bytes.
    ///
    /// The actual file size is `PAYLOAD_OFFSET + capacity` (the caller is
    /// responsible for page-rounding `capacity`).
    pub fn create(name: &str, capacity: usize) -> Result<Self> {
        let segment = ShmSegment::create(name, PAYLOAD_OFFSET + capacity)?;
        let file = Self { segment };
        {
            let control = file.control();
            // SAFETY-free init: the segment is freshly created and zeroed,
            // and not yet visible to readers (name published later via
            // registration), so plain stores through atomics suffice.
            control.write_gen.store(0, Ordering::Relaxed);
            control.announce_seq.store(0, Ordering::Relaxed);
            control.reader_count.store(0, Ordering::Relaxed);
            control.ack_pending.store(0, Ordering::Relaxed);
        }
        // Non-atomic fields are written through the raw pointer once.
        // SAFETY: the mapping is at least CONTROL_SIZE bytes and
        // exclusively owned until the name is advertised.
        unsafe {
            let ptr = file.segment.as_ptr();
            ptr.cast::<u32>().write(MEMFILE_MAGIC);
            ptr.add(4).cast::<u32>().write(CONTROL_SIZE as u32);
            ptr.add(8).cast::<u64>().write(capacity as u64);
        }
        Ok(file)
    }

    /// Attach to an existing memfile by name.
    pub fn open(name: &str) -> Result<Self> {
        let segment = ShmSegment::open(name)?;
        if segment.size() < PAYLOAD_OFFSET {
            return Err(ShmError::Corrupt(format!(
                "memfile {} smaller than control area",
                name
            )));
        }
        let file = Self { segment };
        let control = file.control();
        if control.magic != MEMFILE_MAGIC {
            return Err(ShmError::Corrupt(format!("bad magic in {}", name)));
        }
        if control.control_size as usize > CONTROL_SIZE {
            // Newer layout than we know; the atomics we use sit in the
            // first 64 bytes either way.
            log::debug!(
                "[SHM] memfile {} has extended control block ({} bytes)",
                name,
                control.control_size
            );
        }
        if PAYLOAD_OFFSET + control.capacity as usize > file.segment.size() {
            return Err(ShmError::Corrupt(format!(
                "capacity exceeds mapping in {}",
                name
            )));
        }
        Ok(file)
    }

    /// Segment name.
    pub fn name(&self) -> &str {
        self.segment.name()
    }

    /// Payload capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.control().capacity as usize
    }

    /// The cross-process control block.
    #[inline]
    pub fn control(&self) -> &MemfileControl {
        // SAFETY: the mapping is at least CONTROL_SIZE bytes (checked at
        // create/open), page-aligned by mmap, and MemfileControl's fields
        // are either written once before publication or atomics.
        unsafe { &*self.segment.as_ptr().cast::<MemfileControl>() }
    }

    #[inline]
    fn header_region(&self) -> *mut u8 {
        // SAFETY: CONTROL_SIZE is within the mapping (checked at open).
        unsafe { self.segment.as_ptr().add(CONTROL_SIZE) }
    }

    #[inline]
    fn payload_region(&self) -> *mut u8 {
        // SAFETY: PAYLOAD_OFFSET is within the mapping (checked at open).
        unsafe { self.segment.as_ptr().add(PAYLOAD_OFFSET) }
    }

    /// Wait until no reader is inside the file.
    ///
    /// Returns false if readers are still present when the timeout
    /// expires; the caller then forces the write (a crashed subscriber's
    /// leaked reader count must not wedge the publisher forever).
    pub fn wait_for_readers(&self, timeout: Duration) -> bool {
        let control = self.control();
        let deadline = Instant::now() + timeout;
        while control.reader_count.load(Ordering::Acquire) != 0 {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_micros(100));
        }
        true
    }

    /// Number of readers currently inside the file.
    pub fn reader_count(&self) -> i32 {
        self.control().reader_count.load(Ordering::Acquire)
    }

    /// Write one frame. `fill` produces the payload in place and returns
    /// false on failure, in which case the slot is committed as invalid
    /// (readers skip it).
    pub fn write_frame<F>(&self, header: &PayloadHeader, fill: F) -> Result<()>
    where
        F: FnOnce(&mut [u8]) -> bool,
    {
        let size = header.payload_size as usize;
        let capacity = self.capacity();
        if size > capacity {
            return Err(ShmError::PayloadTooLarge { size, capacity });
        }

        let control = self.control();
        let prev = control.write_gen.load(Ordering::Relaxed) & !1;
        control.write_gen.store(prev.wrapping_add(1), Ordering::Release);

        // Invalidate the header first so a torn frame never parses.
        // SAFETY: header region is HEADER_REGION_SIZE bytes inside the
        // mapping; we are the only writer (single owner per publisher).
        let header_slice = unsafe {
            std::slice::from_raw_parts_mut(self.header_region(), HEADER_REGION_SIZE)
        };
        header_slice[..4].fill(0);

        // SAFETY: size <= capacity was checked above; payload region is
        // capacity bytes starting at PAYLOAD_OFFSET.
        let payload = unsafe { std::slice::from_raw_parts_mut(self.payload_region(), size) };
        let filled = fill(payload);
        if filled {
            header.encode(&mut header_slice[..PAYLOAD_HEADER_SIZE]);
        }

        control.write_gen.store(prev.wrapping_add(2), Ordering::Release);
        if !filled {
            return Err(ShmError::Corrupt("payload writer failed".to_string()));
        }
        Ok(())
    }

    /// Try to read the current frame if its generation differs from
    /// `last_gen`.
    ///
    /// Returns `None` when there is nothing new (or a write is in flight),
    /// `Some((gen, None))` when a new generation was consumed but invalid
    /// or torn, and `Some((gen, Some(r)))` on success.
    pub fn try_read<R, F>(&self, last_gen: u32, f: F) -> Option<(u32, Option<R>)>
    where
        F: FnOnce(&PayloadHeader, &[u8]) -> R,
    {
        let control = self.control();
        let gen = control.write_gen.load(Ordering::Acquire);
        if gen == last_gen || gen & 1 == 1 {
            return None;
        }

        control.reader_count.fetch_add(1, Ordering::AcqRel);
        if control.write_gen.load(Ordering::Acquire) != gen {
            // Writer moved in; retry on the next announcement.
            control.reader_count.fetch_sub(1, Ordering::AcqRel);
            return None;
        }

        // SAFETY: header region is HEADER_REGION_SIZE bytes inside the
        // mapping; concurrent writes are detected via the generation
        // re-check below.
        let header_bytes =
            unsafe { std::slice::from_raw_parts(self.header_region(), HEADER_REGION_SIZE) };
        let parsed = PayloadHeader::decode(header_bytes);

        let result = match parsed {
            Some((header, _)) if header.payload_size as usize <= self.capacity() => {
                // SAFETY: payload_size <= capacity, payload region starts
                // at PAYLOAD_OFFSET and holds capacity bytes.
                let payload = unsafe {
                    std::slice::from_raw_parts(
                        self.payload_region().cast_const(),
                        header.payload_size as usize,
                    )
                };
                let r = f(&header, payload);
                let intact = control.write_gen.load(Ordering::Acquire) == gen;
                control.reader_count.fetch_sub(1, Ordering::AcqRel);
                self.signal_ack(&header);
                if intact {
                    Some(r)
                } else {
                    None
                }
            }
            _ => {
                control.reader_count.fetch_sub(1, Ordering::AcqRel);
                None
            }
        };

        Some((gen, result))
    }

    fn signal_ack(&self, header: &PayloadHeader) {
        if header.flags & crate::transport::FLAG_ACK_REQUESTED == 0 {
            return;
        }
        let control = self.control();
        let _ = control
            .ack_pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
        futex::futex_wake_all(&control.ack_pending);
    }

    /// Arm the acknowledge counter before a frame in acknowledged mode.
    pub fn arm_ack(&self, expected_readers: u32) {
        self.control()
            .ack_pending
            .store(expected_readers, Ordering::Release);
    }

    /// Block until all armed acknowledge signals arrived or the timeout
    /// expired. Leaked signals (crashed subscriber) are cleared on timeout.
    pub fn wait_ack(&self, timeout: Duration) -> bool {
        let control = self.control();
        let deadline = Instant::now() + timeout;
        loop {
            let pending = control.ack_pending.load(Ordering::Acquire);
            if pending == 0 {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                control.ack_pending.store(0, Ordering::Release);
                return false;
            }
            futex::futex_wait(&control.ack_pending, pending, Some(deadline - now));
        }
    }

    /// Bump the ring announcement counter and wake all waiting readers.
    pub fn announce(&self) {
        let control = self.control();
        control.announce_seq.fetch_add(1, Ordering::Release);
        futex::futex_wake_all(&control.announce_seq);
    }

    /// Current announcement counter value.
    pub fn announce_seq(&self) -> u32 {
        self.control().announce_seq.load(Ordering::Acquire)
    }

    /// Wait until the announcement counter moves past `seen`.
    pub fn wait_announce(&self, seen: u32, timeout: Duration) {
        let control = self.control();
        if control.announce_seq.load(Ordering::Acquire) != seen {
            return;
        }
        futex::futex_wait(&control.announce_seq, seen, Some(timeout));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::FLAG_ACK_REQUESTED;

    fn unique_name(tag: &str) -> String {
        format!(
            "/hipc_test_mf_{}_{}_{}",
            tag,
            std::process::id(),
            fastrand::u32(..)
        )
    }

    fn header(clock: u64, size: usize) -> PayloadHeader {
        PayloadHeader {
            flags: 0,
            payload_size: size as u64,
            data_clock: clock,
            send_timestamp_us: 1,
            sender_entity_id: 99,
        }
    }

    #[test]
    fn write_then_read() {
        let name = unique_name("rw");
        let file = Memfile::create(&name, 4096).expect("create");

        file.write_frame(&header(1, 5), |buf| {
            buf.copy_from_slice(b"hello");
            true
        })
        .expect("write");

        let read = file.try_read(0, |h, payload| {
            assert_eq!(h.data_clock, 1);
            payload.to_vec()
        });
        match read {
            Some((gen, Some(bytes))) => {
                assert_eq!(gen, 2);
                assert_eq!(bytes, b"hello");
            }
            other => panic!("unexpected read result: {other:?}"),
        }

        // Same generation again: nothing new.
        assert!(file.try_read(2, |_, p| p.to_vec()).is_none());

        ShmSegment::unlink(&name).expect("unlink");
    }

    #[test]
    fn reader_sees_each_generation_once() {
        let name = unique_name("gen");
        let file = Memfile::create(&name, 4096).expect("create");
        let mut last_gen = 0;
        for clock in 1..=3u64 {
            file.write_frame(&header(clock, 1), |buf| {
                buf[0] = clock as u8;
                true
            })
            .expect("write");
            let (gen, payload) = file
                .try_read(last_gen, |_, p| p[0])
                .expect("new generation");
            assert_eq!(payload, Some(clock as u8));
            last_gen = gen;
        }
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let name = unique_name("big");
        let file = Memfile::create(&name, 4096).expect("create");
        let result = file.write_frame(&header(1, 8192), |_| true);
        assert!(matches!(result, Err(ShmError::PayloadTooLarge { .. })));
    }

    #[test]
    fn failed_fill_leaves_invalid_frame() {
        let name = unique_name("fail");
        let file = Memfile::create(&name, 4096).expect("create");
        assert!(file.write_frame(&header(1, 4), |_| false).is_err());

        // Generation advanced but the frame must not parse.
        match file.try_read(0, |_, p| p.to_vec()) {
            Some((_, None)) => {}
            other => panic!("expected skipped frame, got {other:?}"),
        }
    }

    #[test]
    fn ack_signal_roundtrip() {
        let name = unique_name("ack");
        let file = Memfile::create(&name, 4096).expect("create");

        file.arm_ack(1);
        let mut h = header(1, 2);
        h.flags = FLAG_ACK_REQUESTED;
        file.write_frame(&h, |buf| {
            buf.copy_from_slice(b"ok");
            true
        })
        .expect("write");

        // Reading acknowledges.
        let _ = file.try_read(0, |_, _| ());
        assert!(file.wait_ack(Duration::from_millis(100)));
    }

    #[test]
    fn wait_ack_times_out_and_clears() {
        let name = unique_name("ackto");
        let file = Memfile::create(&name, 4096).expect("create");
        file.arm_ack(2);
        let start = Instant::now();
        assert!(!file.wait_ack(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(40));
        // Leaked signals cleared
        assert!(file.wait_ack(Duration::from_millis(10)));
    }

    #[test]
    fn reopen_validates_control_block() {
        let name = unique_name("open");
        let file = Memfile::create(&name, 4096).expect("create");
        let attached = Memfile::open(&name).expect("open");
        assert_eq!(attached.capacity(), 4096);
        drop(attached);
        drop(file);
        let _ = ShmSegment::unlink(&name);
    }
}
