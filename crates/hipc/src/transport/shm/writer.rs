// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hipc contributors

//! Publisher-side memfile ring.
//!
//! The writer rotates over `memfile_buffer_count` files, always picking a
//! file no reader is currently inside. When a payload outgrows the current
//! capacity the whole ring is reallocated under fresh names (generation
//! counter in the name) and the caller re-announces the name list through
//! the registration plane.

use super::memfile::{Memfile, PAYLOAD_OFFSET};
use super::segment::ShmSegment;
use super::{memfile_name, Result, WRITE_ACCESS_TIMEOUT_MS};
use crate::config::{PublisherShmConfiguration, MEMFILE_PAGE_SIZE};
use crate::transport::{PayloadHeader, FLAG_ACK_REQUESTED, FLAG_ZERO_COPY};
use std::time::{Duration, Instant};

/// Ring of memfiles owned by one publisher.
pub struct ShmWriter {
    domain: String,
    entity_id: u64,
    config: PublisherShmConfiguration,
    files: Vec<Memfile>,
    /// Bumped on every ring reallocation; part of the memfile names.
    generation: u32,
    next_index: usize,
}

impl ShmWriter {
    pub fn new(domain: &str, entity_id: u64, config: PublisherShmConfiguration) -> Result<Self> {
        let mut writer = Self {
            domain: domain.to_string(),
            entity_id,
            config,
            files: Vec::new(),
            generation: 0,
            next_index: 0,
        };
        let capacity = writer.payload_capacity_for(0);
        writer.allocate_ring(capacity)?;
        Ok(writer)
    }

    /// Names subscribers attach to; refreshed after every reallocation.
    pub fn memfile_names(&self) -> Vec<String> {
        self.files.iter().map(|f| f.name().to_string()).collect()
    }

    /// Payload capacity of each file in the current ring.
    pub fn capacity(&self) -> usize {
        self.files.first().map_or(0, Memfile::capacity)
    }

    fn payload_capacity_for(&self, payload_size: usize) -> usize {
        let reserved = payload_size + payload_size * self.config.memfile_reserve_percent / 100;
        let file_size = (PAYLOAD_OFFSET + reserved)
            .max(self.config.memfile_min_size_bytes)
            .div_ceil(MEMFILE_PAGE_SIZE)
            * MEMFILE_PAGE_SIZE;
        file_size - PAYLOAD_OFFSET
    }

    fn allocate_ring(&mut self, capacity: usize) -> Result<()> {
        let mut files = Vec::with_capacity(self.config.memfile_buffer_count);
        for index in 0..self.config.memfile_buffer_count {
            let name = memfile_name(&self.domain, self.entity_id, self.generation, index);
            files.push(Memfile::create(&name, capacity)?);
        }
        self.unlink_ring();
        self.files = files;
        self.next_index = 0;
        Ok(())
    }

    fn unlink_ring(&mut self) {
        for file in self.files.drain(..) {
            let name = file.name().to_string();
            drop(file);
            if let Err(e) = ShmSegment::unlink(&name) {
                log::debug!("[SHM] unlink {} failed: {}", name, e);
            }
        }
    }

    /// Grow the ring if `payload_size` does not fit. Returns true when the
    /// ring was reallocated (names changed; the caller must re-register).
    ///
    /// The ring never shrinks during the publisher's lifetime.
    pub fn ensure_capacity(&mut self, payload_size: usize) -> Result<bool> {
        if payload_size <= self.capacity() {
            return Ok(false);
        }
        let capacity = self.payload_capacity_for(payload_size);
        self.generation += 1;
        log::debug!(
            "[SHM] publisher {:016x} reallocating ring gen={} capacity={}",
            self.entity_id,
            self.generation,
            capacity
        );
        self.allocate_ring(capacity)?;
        Ok(true)
    }

    /// Pick the next writable file: first file in rotation order with no
    /// reader inside, or the next-in-line after the access timeout.
    fn select_file(&self) -> usize {
        let n = self.files.len();
        let deadline = Instant::now() + Duration::from_millis(WRITE_ACCESS_TIMEOUT_MS);
        loop {
            for k in 0..n {
                let idx = (self.next_index + k) % n;
                if self.files[idx].reader_count() == 0 {
                    return idx;
                }
            }
            if Instant::now() >= deadline {
                log::debug!(
                    "[SHM] publisher {:016x} forcing write into busy memfile",
                    self.entity_id
                );
                return self.next_index;
            }
            std::thread::sleep(Duration::from_micros(100));
        }
    }

    /// Write one frame into the ring and signal readers.
    ///
    /// In acknowledged mode (`acknowledge_timeout_ms > 0`) the call blocks
    /// until all `connected_readers` signalled completion or the timeout
    /// expired.
    pub fn write<F>(
        &mut self,
        header: &PayloadHeader,
        connected_readers: u32,
        fill: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut [u8]) -> bool,
    {
        let idx = self.select_file();
        let acknowledged = self.config.acknowledge_timeout_ms > 0 && connected_readers > 0;

        let mut header = *header;
        if acknowledged {
            header.flags |= FLAG_ACK_REQUESTED;
            self.files[idx].arm_ack(connected_readers);
        }
        if self.config.zero_copy_mode {
            header.flags |= FLAG_ZERO_COPY;
        }

        self.files[idx].write_frame(&header, fill)?;
        self.files[0].announce();
        self.next_index = (idx + 1) % self.files.len();

        if acknowledged {
            let timeout = Duration::from_millis(self.config.acknowledge_timeout_ms);
            if !self.files[idx].wait_ack(timeout) {
                log::debug!(
                    "[SHM] publisher {:016x} acknowledge timeout after {:?}",
                    self.entity_id,
                    timeout
                );
            }
        }
        Ok(())
    }
}

impl Drop for ShmWriter {
    fn drop(&mut self) {
        self.unlink_ring();
    }
}
