// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hipc contributors

//! Subscriber-side memfile ring attachment.
//!
//! One `ShmReader` per connected SHM publisher. A worker thread waits on
//! the ring announcement futex, scans the files for new write generations
//! and feeds committed frames into the subscriber's receive sink.

use super::memfile::Memfile;
use super::Result;
use crate::transport::{FrameMeta, FrameSink, PayloadHeader, TransportLayer, FLAG_ZERO_COPY};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// How long the worker sleeps on the announcement futex before re-checking
/// the stop flag.
const ANNOUNCE_WAIT_MS: u64 = 100;

/// Attachment to one publisher's memfile ring.
pub struct ShmReader {
    names: Vec<String>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ShmReader {
    /// Open every file of the ring and start the worker thread.
    ///
    /// Fails when a file is not (yet) present; the caller retries on the
    /// next registration refresh.
    pub fn attach(names: Vec<String>, sink: FrameSink) -> Result<Self> {
        let mut files = Vec::with_capacity(names.len());
        for name in &names {
            files.push(Memfile::open(name)?);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("hipc-shm-read".to_string())
            .spawn(move || read_loop(&files, &stop_flag, &sink))
            .map_err(super::ShmError::SegmentOpen)?;

        Ok(Self {
            names,
            stop,
            thread: Some(thread),
        })
    }

    /// True when this reader is attached to exactly the given name list.
    pub fn matches(&self, names: &[String]) -> bool {
        self.names == names
    }
}

impl Drop for ShmReader {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn frame_meta(header: &PayloadHeader) -> FrameMeta {
    FrameMeta {
        sender_entity_id: header.sender_entity_id,
        data_clock: header.data_clock,
        send_timestamp_us: header.send_timestamp_us,
        layer: TransportLayer::Shm,
    }
}

fn read_loop(files: &[Memfile], stop: &AtomicBool, sink: &FrameSink) {
    // Skip whatever was committed before we attached; only new frames
    // are delivered.
    let mut last_gens: Vec<u32> = files
        .iter()
        .map(|f| f.control().write_gen.load(Ordering::Acquire) & !1)
        .collect();

    while !stop.load(Ordering::Acquire) {
        let seen = files[0].announce_seq();
        let mut got_any = false;

        for (i, file) in files.iter().enumerate() {
            // Zero-copy frames run the sink inside the read bracket (the
            // slice points into the memfile and must not escape); copy
            // frames are copied out first and dispatched afterwards.
            let read = file.try_read(last_gens[i], |header, payload| {
                if header.flags & FLAG_ZERO_COPY != 0 {
                    sink(frame_meta(header), payload);
                    None
                } else {
                    Some((frame_meta(header), payload.to_vec()))
                }
            });

            if let Some((gen, result)) = read {
                last_gens[i] = gen;
                got_any = true;
                if let Some(Some((meta, bytes))) = result {
                    sink(meta, &bytes);
                }
            }
        }

        if !got_any {
            files[0].wait_announce(seen, Duration::from_millis(ANNOUNCE_WAIT_MS));
        }
    }
}
