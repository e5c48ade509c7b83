// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hipc contributors

//! Subscriber-side TCP session with automatic reconnection.
//!
//! One session per connected publisher endpoint. The worker thread
//! connects and reads length-prefixed frames; deframed payloads are
//! dispatched to the subscriber's receive sink on the reader executor
//! pool (a per-session queue keeps frame order). On a broken connection
//! the worker retries up to `max_reconnections` times (negative =
//! infinite).

use crate::config::TCP_MAX_FRAME_SIZE;
use crate::core::threadpool::DynamicThreadPool;
use crate::transport::{FrameMeta, FrameSink, PayloadHeader, TransportLayer};
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::io;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const RECONNECT_DELAY_MS: u64 = 500;
const READ_TIMEOUT_MS: u64 = 200;

/// Ordered hand-off of deframed payloads to the reader pool.
struct Dispatcher {
    queue_tx: Sender<Vec<u8>>,
    queue_rx: Receiver<Vec<u8>>,
    scheduled: AtomicBool,
    pool: Arc<DynamicThreadPool>,
    sink: FrameSink,
}

impl Dispatcher {
    fn enqueue(self: &Arc<Self>, body: Vec<u8>) {
        if self.queue_tx.send(body).is_err() {
            return;
        }
        if self.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let this = Arc::clone(self);
        let posted = self.pool.post(move || loop {
            while let Ok(body) = this.queue_rx.try_recv() {
                dispatch(&body, &this.sink);
            }
            this.scheduled.store(false, Ordering::Release);
            // Close the enqueue-after-drain race.
            if this.queue_rx.is_empty() || this.scheduled.swap(true, Ordering::AcqRel) {
                return;
            }
        });
        if !posted {
            // Pool shut down (runtime finalizing): drop the frames.
            self.scheduled.store(false, Ordering::Release);
        }
    }
}

/// Session to one publisher's payload listener.
pub struct TcpPayloadSession {
    endpoint: (String, u16),
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl TcpPayloadSession {
    pub fn spawn(
        host: &str,
        port: u16,
        max_reconnections: i32,
        reader_pool: Arc<DynamicThreadPool>,
        sink: FrameSink,
    ) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let endpoint = (host.to_string(), port);
        let connect_to = endpoint.clone();

        let (queue_tx, queue_rx) = unbounded();
        let dispatcher = Arc::new(Dispatcher {
            queue_tx,
            queue_rx,
            scheduled: AtomicBool::new(false),
            pool: reader_pool,
            sink,
        });

        let thread = std::thread::Builder::new()
            .name("hipc-tcp-session".to_string())
            .spawn(move || {
                session_loop(&connect_to, max_reconnections, &stop_flag, &dispatcher);
            })?;

        Ok(Self {
            endpoint,
            stop,
            thread: Some(thread),
        })
    }

    /// Publisher endpoint this session is attached to.
    pub fn endpoint(&self) -> (&str, u16) {
        (&self.endpoint.0, self.endpoint.1)
    }
}

impl Drop for TcpPayloadSession {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn session_loop(
    endpoint: &(String, u16),
    max_reconnections: i32,
    stop: &AtomicBool,
    dispatcher: &Arc<Dispatcher>,
) {
    let mut attempts: i32 = 0;
    while !stop.load(Ordering::Acquire) {
        let stream = match TcpStream::connect((endpoint.0.as_str(), endpoint.1)) {
            Ok(stream) => {
                attempts = 0;
                stream
            }
            Err(e) => {
                attempts += 1;
                if max_reconnections >= 0 && attempts > max_reconnections {
                    log::debug!(
                        "[TCP] giving up on {}:{} after {} attempts: {}",
                        endpoint.0,
                        endpoint.1,
                        attempts,
                        e
                    );
                    return;
                }
                std::thread::sleep(Duration::from_millis(RECONNECT_DELAY_MS));
                continue;
            }
        };

        if let Err(e) = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS))) {
            log::debug!("[TCP] set_read_timeout failed: {}", e);
        }
        read_frames(stream, stop, dispatcher);
        // Connection ended; loop around and reconnect unless stopping.
    }
}

fn read_frames(mut stream: TcpStream, stop: &AtomicBool, dispatcher: &Arc<Dispatcher>) {
    let mut len_buf = [0u8; 4];
    loop {
        // Partial progress survives read timeouts, so a frame split across
        // timeout windows never desynchronizes the stream.
        match read_exact_interruptible(&mut stream, &mut len_buf, stop) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                log::debug!("[TCP] session read failed: {}", e);
                return;
            }
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > TCP_MAX_FRAME_SIZE {
            log::debug!("[TCP] frame of {} bytes exceeds limit, dropping session", len);
            return;
        }

        let mut body = vec![0u8; len];
        match read_exact_interruptible(&mut stream, &mut body, stop) {
            Ok(true) => dispatcher.enqueue(body),
            Ok(false) => return,
            Err(e) => {
                log::debug!("[TCP] session read failed: {}", e);
                return;
            }
        }
    }
}

/// Fill `buf` completely, retrying across read timeouts.
///
/// Returns `Ok(false)` on stop request or clean EOF before the first byte.
fn read_exact_interruptible(
    stream: &mut TcpStream,
    buf: &mut [u8],
    stop: &AtomicBool,
) -> io::Result<bool> {
    use std::io::Read;

    let mut filled = 0;
    while filled < buf.len() {
        if stop.load(Ordering::Acquire) {
            return Ok(false);
        }
        match stream.read(&mut buf[filled..]) {
            Ok(0) => {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-frame",
                ));
            }
            Ok(n) => filled += n,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                continue;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

fn dispatch(body: &[u8], sink: &FrameSink) {
    let Some((header, header_size)) = PayloadHeader::decode(body) else {
        log::debug!("[TCP] frame without payload header, discarding");
        return;
    };
    let payload = &body[header_size..];
    if payload.len() != header.payload_size as usize {
        log::debug!(
            "[TCP] payload size mismatch ({} != {}), discarding",
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
            layer: TransportLayer::Tcp,
        },
        payload,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tcp::TcpPayloadServer;
    use parking_lot::Mutex;
    use std::time::Instant;

    fn wait_until(pred: impl Fn() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if pred() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        pred()
    }

    #[test]
    fn receives_fanned_out_frames() {
        let pool = DynamicThreadPool::new();
        let server = TcpPayloadServer::new(Arc::clone(&pool)).expect("server");

        let received: Arc<Mutex<Vec<(u64, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
        let store = Arc::clone(&received);
        let sink: FrameSink = Arc::new(move |meta, payload| {
            store.lock().push((meta.data_clock, payload.to_vec()));
        });

        let _session =
            TcpPayloadSession::spawn("127.0.0.1", server.port(), 5, Arc::clone(&pool), sink)
                .expect("session");
        assert!(wait_until(|| server.session_count() == 1, Duration::from_secs(2)));

        for clock in 1..=3u64 {
            let header = PayloadHeader {
                flags: 0,
                payload_size: 4,
                data_clock: clock,
                send_timestamp_us: 0,
                sender_entity_id: 8,
            };
            server.send(&header, b"data");
        }

        assert!(wait_until(|| received.lock().len() == 3, Duration::from_secs(5)));
        let frames = received.lock();
        assert_eq!(
            frames.iter().map(|(c, _)| *c).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        drop(frames);

        pool.shutdown();
        pool.join();
    }

    #[test]
    fn reconnects_after_server_restart() {
        let pool = DynamicThreadPool::new();

        let received = Arc::new(Mutex::new(Vec::<u64>::new()));
        let store = Arc::clone(&received);
        let sink: FrameSink = Arc::new(move |meta, _| {
            store.lock().push(meta.data_clock);
        });

        let server = TcpPayloadServer::new(Arc::clone(&pool)).expect("server");
        let port = server.port();
        let _session =
            TcpPayloadSession::spawn("127.0.0.1", port, -1, Arc::clone(&pool), sink)
                .expect("session");
        assert!(wait_until(|| server.session_count() == 1, Duration::from_secs(2)));
        drop(server);

        // Session must retry forever with max_reconnections = -1. A new
        // listener on the same port picks it back up. Port reuse is racy
        // in principle, so give it a generous window.
        let listener = std::net::TcpListener::bind(("127.0.0.1", port));
        if let Ok(listener) = listener {
            let accepted = wait_until(
                || {
                    listener.set_nonblocking(true).ok();
                    listener.accept().is_ok()
                },
                Duration::from_secs(5),
            );
            assert!(accepted, "session did not reconnect");
        }

        pool.shutdown();
        pool.join();
    }
}
