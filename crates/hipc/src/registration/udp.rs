// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hipc contributors

//! Registration over UDP multicast.
//!
//! One sample per datagram where it fits; oversized samples ride the same
//! application-layer fragment codec as the payload transport (registration
//! uses the reserved topic hash 0).

use super::sample::{decode_sample, SampleCodecError};
use crate::config::{UdpConfiguration, UDP_MTU};
use crate::core::types::Sample;
use crate::transport::udp::{
    build_receive_socket, build_send_socket, registration_address, FragmentHeader, Reassembly,
    FRAGMENT_HEADER_SIZE,
};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Topic hash reserved for the registration plane.
const REGISTRATION_TOPIC_HASH: u64 = 0;

/// Callback invoked with every decoded remote sample.
pub type SampleHandler = Arc<dyn Fn(Sample) + Send + Sync>;

/// Sending half of UDP registration.
pub struct UdpRegistrationSender {
    socket: UdpSocket,
    destination: SocketAddr,
    sender_id: u64,
    message_seq: AtomicU64,
}

impl UdpRegistrationSender {
    pub fn new(cfg: &UdpConfiguration, sender_id: u64) -> io::Result<Self> {
        let (group, port) = registration_address(cfg);
        let socket = build_send_socket(cfg)?;
        Ok(Self {
            socket,
            destination: SocketAddr::from((group, port)),
            sender_id,
            message_seq: AtomicU64::new(0),
        })
    }
}

impl super::provider::SampleSender for UdpRegistrationSender {
    /// Send one serialized sample, fragmenting when it exceeds the MTU.
    fn send_serialized(&self, bytes: &[u8]) {
        let seq = self.message_seq.fetch_add(1, Ordering::Relaxed);
        for datagram in crate::transport::udp::fragment_message(
            self.sender_id,
            REGISTRATION_TOPIC_HASH,
            seq,
            bytes,
            UDP_MTU,
        ) {
            if let Err(e) = self.socket.send_to(&datagram, self.destination) {
                log::debug!("[REG] udp send failed: {}", e);
                return;
            }
        }
    }
}

/// Receiving half of UDP registration; one thread per process.
pub struct UdpRegistrationReceiver {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl UdpRegistrationReceiver {
    pub fn spawn(cfg: &UdpConfiguration, handler: SampleHandler) -> io::Result<Self> {
        let (group, port) = registration_address(cfg);
        let socket = build_receive_socket(group, port, cfg)?;
        socket.set_read_timeout(Some(Duration::from_millis(100)))?;

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("hipc-reg-udp".to_string())
            .spawn(move || receive_loop(&socket, &stop_flag, &handler))?;

        log::debug!("[REG] udp registration on {}:{}", group, port);
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }
}

impl Drop for UdpRegistrationReceiver {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn receive_loop(socket: &UdpSocket, stop: &AtomicBool, handler: &SampleHandler) {
    let mut reassembly = Reassembly::default();
    let mut buf = vec![0u8; 65536];

    while !stop.load(Ordering::Acquire) {
        let len = match socket.recv_from(&mut buf) {
            Ok((len, _)) => len,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                log::debug!("[REG] udp recv failed: {}", e);
                continue;
            }
        };

        let Some(header) = FragmentHeader::decode(&buf[..len]) else {
            continue;
        };
        if header.topic_hash != REGISTRATION_TOPIC_HASH {
            continue;
        }

        if let Some(record) = reassembly.push(&header, &buf[FRAGMENT_HEADER_SIZE..len]) {
            handle_record(&record, handler);
        }
    }
}

fn handle_record(record: &[u8], handler: &SampleHandler) {
    match decode_sample(record) {
        Ok((sample, consumed)) => {
            if consumed != record.len() {
                log::debug!(
                    "[REG] trailing {} bytes after sample, ignoring",
                    record.len() - consumed
                );
            }
            handler(sample);
        }
        Err(SampleCodecError::BadVersion(v)) => {
            log::debug!("[REG] sample with future wire version {} discarded", v);
        }
        Err(e) => {
            log::debug!("[REG] malformed sample discarded: {}", e);
        }
    }
}
