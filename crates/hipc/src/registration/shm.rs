// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hipc contributors

//! Registration over a host-shared memory ring.
//!
//! One named ring per (host, registration domain). Every process appends
//! its serialized samples and tails the ring from its own cursor, so the
//! ring is multi-writer, multi-reader broadcast.
//!
//! # Ring Protocol
//!
//! Writers claim a slot with `head.fetch_add(1)`; the claimed sequence
//! number is globally unique, so two writers never share a slot (a writer
//! lapping the ring overwrites the oldest entry, which is the intended
//! bounded-queue behavior). Slot commit uses the odd/even sequence scheme:
//! `slot.seq = seq*2+1` while writing, `seq*2` when committed. Readers
//! verify the slot sequence before and after copying to detect overruns.

use super::sample::{decode_sample, SampleCodecError};
use super::udp::SampleHandler;
use crate::config::REGISTRATION_SLOT_SIZE;
use crate::transport::shm::{ShmError, ShmSegment};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const RING_MAGIC: u32 = 0x4852_4731; // "HRG1"
const CONTROL_SIZE: usize = 64;
const SLOT_HEADER_SIZE: usize = 16;

/// How long a tailing reader sleeps between announcement checks.
const POLL_INTERVAL_MS: u64 = 20;

#[repr(C)]
struct RingControl {
    magic: AtomicU32,
    slot_count: u32,
    slot_size: u32,
    _pad0: u32,
    /// Next sequence number to claim.
    head: AtomicU64,
    /// Bumped after every commit (futex word).
    announce: AtomicU32,
    _reserved: [u8; 36],
}

#[repr(C)]
struct SlotHeader {
    /// `seq*2+1` while writing, `seq*2` committed.
    seq: AtomicU64,
    len: AtomicU32,
    _pad: u32,
}

fn ring_name(domain: &str) -> String {
    if domain.is_empty() {
        "/hipc_reg".to_string()
    } else {
        format!("/hipc_reg_{}", domain)
    }
}

fn ring_size(slot_count: usize) -> usize {
    CONTROL_SIZE + slot_count * (SLOT_HEADER_SIZE + REGISTRATION_SLOT_SIZE)
}

/// Attachment to the host-shared registration ring.
///
/// The first process on the host creates the ring; later processes attach
/// to the existing one (its slot count wins over local configuration).
pub struct RegistrationRing {
    segment: ShmSegment,
    slot_count: usize,
}

impl RegistrationRing {
    pub fn create_or_open(domain: &str, queue_size: usize) -> Result<Self, ShmError> {
        let name = ring_name(domain);
        match ShmSegment::create_exclusive(&name, ring_size(queue_size)) {
            Ok(segment) => {
                let ring = Self {
                    segment,
                    slot_count: queue_size,
                };
                // Plain fields are written once through the raw pointer
                // before any reference to the control block exists; peers
                // cannot discover the ring until the magic is set below.
                // SAFETY: mapping is at least CONTROL_SIZE bytes.
                unsafe {
                    let ptr = ring.segment.as_ptr();
                    ptr.add(4).cast::<u32>().write(queue_size as u32);
                    ptr.add(8).cast::<u32>().write(REGISTRATION_SLOT_SIZE as u32);
                }
                let control = ring.control();
                control.head.store(0, Ordering::Relaxed);
                control.announce.store(0, Ordering::Relaxed);
                // Publish last: openers spin on the magic.
                control.magic.store(RING_MAGIC, Ordering::Release);
                log::debug!("[REG] created shm ring {} ({} slots)", name, queue_size);
                Ok(ring)
            }
            Err(ShmError::SegmentCreate(e))
                if e.kind() == std::io::ErrorKind::AlreadyExists =>
            {
                let segment = ShmSegment::open(&name)?;
                if segment.size() < CONTROL_SIZE {
                    return Err(ShmError::Corrupt(name));
                }
                let ring = Self {
                    segment,
                    slot_count: 0,
                };
                // Wait for the creator to finish initialization.
                let deadline = std::time::Instant::now() + Duration::from_secs(1);
                while ring.control().magic.load(Ordering::Acquire) != RING_MAGIC {
                    if std::time::Instant::now() > deadline {
                        return Err(ShmError::Corrupt(format!(
                            "registration ring {} never initialized",
                            name
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                let control = ring.control();
                if control.slot_size as usize != REGISTRATION_SLOT_SIZE {
                    return Err(ShmError::Corrupt(format!(
                        "registration ring {} has slot size {}, expected {}",
                        name, control.slot_size, REGISTRATION_SLOT_SIZE
                    )));
                }
                let slot_count = control.slot_count as usize;
                if ring_size(slot_count) > ring.segment.size() {
                    return Err(ShmError::Corrupt(name));
                }
                log::debug!("[REG] attached shm ring {} ({} slots)", name, slot_count);
                Ok(Self {
                    slot_count,
                    ..ring
                })
            }
            Err(e) => Err(e),
        }
    }

    #[inline]
    fn control(&self) -> &RingControl {
        // SAFETY: mapping is at least CONTROL_SIZE bytes; all mutable
        // fields are atomics.
        unsafe { &*self.segment.as_ptr().cast::<RingControl>() }
    }

    #[inline]
    fn slot(&self, index: usize) -> &SlotHeader {
        debug_assert!(index < self.slot_count);
        // SAFETY: index < slot_count and the segment was sized for
        // slot_count slots (checked at create/open).
        unsafe {
            &*self
                .segment
                .as_ptr()
                .add(CONTROL_SIZE + index * (SLOT_HEADER_SIZE + REGISTRATION_SLOT_SIZE))
                .cast::<SlotHeader>()
        }
    }

    #[inline]
    fn slot_payload(&self, index: usize) -> *mut u8 {
        // SAFETY: same bounds as slot().
        unsafe {
            self.segment
                .as_ptr()
                .add(CONTROL_SIZE + index * (SLOT_HEADER_SIZE + REGISTRATION_SLOT_SIZE))
                .add(SLOT_HEADER_SIZE)
        }
    }

    /// Current head; readers start tailing from here.
    pub fn head(&self) -> u64 {
        self.control().head.load(Ordering::Acquire)
    }

    /// Append one serialized sample. Oversized samples are dropped (the
    /// UDP path still carries them when enabled).
    pub fn push(&self, bytes: &[u8]) {
        if bytes.len() > REGISTRATION_SLOT_SIZE {
            log::warn!(
                "[REG] sample of {} bytes exceeds ring slot size {}, dropped from shm ring",
                bytes.len(),
                REGISTRATION_SLOT_SIZE
            );
            return;
        }

        let control = self.control();
        let seq = control.head.fetch_add(1, Ordering::AcqRel);
        let index = (seq % self.slot_count as u64) as usize;
        let slot = self.slot(index);

        slot.seq.store(seq * 2 + 1, Ordering::Release);
        slot.len.store(bytes.len() as u32, Ordering::Relaxed);
        // SAFETY: bytes.len() <= REGISTRATION_SLOT_SIZE; the slot payload
        // region holds REGISTRATION_SLOT_SIZE bytes; the odd sequence
        // keeps readers out while we copy.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.slot_payload(index), bytes.len());
        }
        slot.seq.store(seq * 2, Ordering::Release);

        control.announce.fetch_add(1, Ordering::Release);
        crate::transport::shm::futex_wake_all(&control.announce);
    }

    /// Read the committed sample at sequence `seq`, if still intact.
    fn read_at(&self, seq: u64) -> Option<Vec<u8>> {
        let index = (seq % self.slot_count as u64) as usize;
        let slot = self.slot(index);
        if slot.seq.load(Ordering::Acquire) != seq * 2 {
            return None;
        }
        let len = slot.len.load(Ordering::Relaxed) as usize;
        if len > REGISTRATION_SLOT_SIZE {
            return None;
        }
        // SAFETY: len <= REGISTRATION_SLOT_SIZE; torn copies are detected
        // by the sequence re-check below.
        let bytes =
            unsafe { std::slice::from_raw_parts(self.slot_payload(index).cast_const(), len) }
                .to_vec();
        if slot.seq.load(Ordering::Acquire) != seq * 2 {
            return None;
        }
        Some(bytes)
    }

    fn wait_announce(&self, seen: u32, timeout: Duration) {
        let control = self.control();
        if control.announce.load(Ordering::Acquire) != seen {
            return;
        }
        crate::transport::shm::futex_wait(&control.announce, seen, Some(timeout));
    }
}

/// Tail thread applying remote samples from the ring.
pub struct ShmRegistrationReceiver {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ShmRegistrationReceiver {
    pub fn spawn(ring: Arc<RegistrationRing>, handler: SampleHandler) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("hipc-reg-shm".to_string())
            .spawn(move || tail_loop(&ring, &stop_flag, &handler))?;
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }
}

impl Drop for ShmRegistrationReceiver {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn tail_loop(ring: &RegistrationRing, stop: &AtomicBool, handler: &SampleHandler) {
    // Only samples pushed after attach are delivered; the refresh loop
    // re-announces everything within one period anyway.
    let mut next_seq = ring.head();
    let slot_count = ring.slot_count as u64;

    while !stop.load(Ordering::Acquire) {
        let seen = ring.control().announce.load(Ordering::Acquire);
        let head = ring.head();

        if head.saturating_sub(next_seq) > slot_count {
            let skipped = head - slot_count - next_seq;
            log::debug!("[REG] shm ring overrun, skipping {} samples", skipped);
            next_seq = head - slot_count;
        }

        let mut progressed = false;
        while next_seq < head {
            if let Some(bytes) = ring.read_at(next_seq) {
                match decode_sample(&bytes) {
                    Ok((sample, _)) => handler(sample),
                    Err(SampleCodecError::BadVersion(v)) => {
                        log::debug!("[REG] shm sample with future wire version {}", v);
                    }
                    Err(e) => log::debug!("[REG] malformed shm sample: {}", e),
                }
            }
            next_seq += 1;
            progressed = true;
        }

        if !progressed {
            ring.wait_announce(seen, Duration::from_millis(POLL_INTERVAL_MS));
        }
    }
}
