// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hipc contributors

//! Subscriber-side UDP multicast receiver with reassembly.

use super::fragment::{FragmentHeader, Reassembly, FRAGMENT_HEADER_SIZE};
use super::{build_receive_socket, topic_address, topic_hash};
use crate::config::UdpConfiguration;
use crate::transport::{FrameMeta, FrameSink, PayloadHeader, TransportLayer};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// One receive thread per subscribed topic.
///
/// The socket is joined to the topic's derived multicast address; every
/// publisher of the topic, regardless of host, lands here. Reassembled
/// messages are fed into the subscriber's receive sink.
pub struct UdpReceiver {
    stop: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl UdpReceiver {
    pub fn spawn(cfg: &UdpConfiguration, topic_name: &str, sink: FrameSink) -> io::Result<Self> {
        let hash = topic_hash(topic_name);
        let (group, port) = topic_address(cfg, hash);
        let socket = build_receive_socket(group, port, cfg)?;
        socket.set_read_timeout(Some(Duration::from_millis(100)))?;
        log::debug!(
            "[UDP] receiver for topic {:?} on {}:{}",
            topic_name,
            group,
            port
        );

        let stop = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicU64::new(0));
        let stop_flag = Arc::clone(&stop);
        let dropped_counter = Arc::clone(&dropped);

        let thread = std::thread::Builder::new()
            .name("hipc-udp-read".to_string())
            .spawn(move || {
                receive_loop(&socket, hash, &stop_flag, &dropped_counter, &sink);
            })?;

        Ok(Self {
            stop,
            dropped,
            thread: Some(thread),
        })
    }

    /// Messages lost in reassembly (timeouts, evictions, malformed).
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for UdpReceiver {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn receive_loop(
    socket: &std::net::UdpSocket,
    expected_topic_hash: u64,
    stop: &AtomicBool,
    dropped: &AtomicU64,
    sink: &FrameSink,
) {
    let mut reassembly = Reassembly::default();
    let mut buf = vec![0u8; 65536];

    while !stop.load(Ordering::Acquire) {
        let len = match socket.recv_from(&mut buf) {
            Ok((len, _from)) => len,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                log::debug!("[UDP] recv failed: {}", e);
                continue;
            }
        };

        let Some(header) = FragmentHeader::decode(&buf[..len]) else {
            // Not one of ours (port sharing across topics in V1 mode).
            continue;
        };
        if header.topic_hash != expected_topic_hash {
            continue;
        }

        if let Some(message) = reassembly.push(&header, &buf[FRAGMENT_HEADER_SIZE..len]) {
            dispatch(&message, sink);
        }
        dropped.store(reassembly.dropped(), Ordering::Relaxed);
    }
}

fn dispatch(message: &[u8], sink: &FrameSink) {
    let Some((header, header_size)) = PayloadHeader::decode(message) else {
        log::debug!("[UDP] reassembled message without payload header, discarding");
        return;
    };
    let payload = &message[header_size..];
    if payload.len() != header.payload_size as usize {
        log::debug!(
            "[UDP] payload size mismatch ({} != {}), discarding",
            payload.len(),
            header.payload_size
        );
        return;
    }
    sink(
        FrameMeta {
            sender_entity_id: header.sender_entity_id,
            data_clock: header.data_clock,
            send_timestamp_us: header.send_timestamp_us,
            layer: TransportLayer::Udp,
        },
        payload,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::udp::UdpSender;
    use parking_lot::Mutex;
    use std::time::Instant;

    #[test]
    fn roundtrip_over_loopback_multicast() {
        let mut cfg = UdpConfiguration::default();
        // Private port range to avoid clashing with concurrently running tests.
        cfg.port = 24000 + (fastrand::u16(..) % 500) * 2;
        let topic = format!("udp_rt_{}", fastrand::u32(..));

        let received: Arc<Mutex<Vec<(u64, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
        let store = Arc::clone(&received);
        let sink: FrameSink = Arc::new(move |meta, payload| {
            store.lock().push((meta.data_clock, payload.to_vec()));
        });

        let receiver = UdpReceiver::spawn(&cfg, &topic, sink).expect("receiver");
        let sender = UdpSender::new(&cfg, &topic, 42).expect("sender");

        // Payload larger than one MTU to exercise reassembly.
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let header = PayloadHeader {
            flags: 0,
            payload_size: payload.len() as u64,
            data_clock: 1,
            send_timestamp_us: 7,
            sender_entity_id: 42,
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            sender.send(&header, &payload).expect("send");
            std::thread::sleep(Duration::from_millis(50));
            if !received.lock().is_empty() || Instant::now() > deadline {
                break;
            }
        }

        let frames = received.lock();
        assert!(!frames.is_empty(), "no frame received over loopback multicast");
        assert_eq!(frames[0].0, 1);
        assert_eq!(frames[0].1, payload);
        drop(frames);
        drop(receiver);
    }
}
