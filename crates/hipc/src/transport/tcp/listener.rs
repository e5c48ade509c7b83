// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hipc contributors

//! Publisher-side TCP payload listener.
//!
//! Accepts subscriber sessions on a per-publisher ephemeral port and fans
//! every frame out to all open sessions. Writes run on the shared writer
//! pool; each session keeps its own frame queue so a slow session never
//! reorders frames or blocks the others.

use super::frame_codec::encode_frame;
use crate::core::threadpool::DynamicThreadPool;
use crate::transport::{PayloadHeader, PAYLOAD_HEADER_SIZE};
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::io::{self, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

struct Session {
    stream: Mutex<TcpStream>,
    queue_tx: Sender<Arc<Vec<u8>>>,
    queue_rx: Receiver<Arc<Vec<u8>>>,
    /// A drain task for this session is scheduled or running.
    scheduled: AtomicBool,
    dead: AtomicBool,
    peer: SocketAddr,
}

/// Per-publisher payload listener.
pub struct TcpPayloadServer {
    port: u16,
    sessions: Arc<Mutex<Vec<Arc<Session>>>>,
    writer_pool: Arc<DynamicThreadPool>,
    running: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl TcpPayloadServer {
    pub fn new(writer_pool: Arc<DynamicThreadPool>) -> io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        let port = listener.local_addr()?.port();
        listener.set_nonblocking(true)?;

        let sessions: Arc<Mutex<Vec<Arc<Session>>>> = Arc::new(Mutex::new(Vec::new()));
        let running = Arc::new(AtomicBool::new(true));

        let accept_sessions = Arc::clone(&sessions);
        let accept_running = Arc::clone(&running);
        let accept_thread = std::thread::Builder::new()
            .name("hipc-tcp-accept".to_string())
            .spawn(move || {
                accept_loop(&listener, &accept_sessions, &accept_running);
            })?;

        log::debug!("[TCP] payload listener on port {}", port);
        Ok(Self {
            port,
            sessions,
            writer_pool,
            running,
            accept_thread: Some(accept_thread),
        })
    }

    /// Advertised listener port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Currently open subscriber sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Fan one frame out to every open session.
    pub fn send(&self, header: &PayloadHeader, payload: &[u8]) {
        let mut body = vec![0u8; PAYLOAD_HEADER_SIZE + payload.len()];
        header.encode(&mut body);
        body[PAYLOAD_HEADER_SIZE..].copy_from_slice(payload);
        let frame = Arc::new(encode_frame(&body));

        let mut sessions = self.sessions.lock();
        sessions.retain(|s| !s.dead.load(Ordering::Acquire));
        for session in sessions.iter() {
            if session.queue_tx.send(Arc::clone(&frame)).is_err() {
                session.dead.store(true, Ordering::Release);
                continue;
            }
            self.schedule_drain(session);
        }
    }

    /// Post a drain task unless one is already queued for the session.
    fn schedule_drain(&self, session: &Arc<Session>) {
        if session.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let session = Arc::clone(session);
        self.writer_pool.post(move || loop {
            while let Ok(frame) = session.queue_rx.try_recv() {
                let mut stream = session.stream.lock();
                if let Err(e) = stream.write_all(&frame) {
                    log::debug!("[TCP] session {} write failed: {}", session.peer, e);
                    session.dead.store(true, Ordering::Release);
                    break;
                }
            }
            session.scheduled.store(false, Ordering::Release);
            // A frame enqueued between the final try_recv and the flag
            // reset would otherwise sit until the next send.
            if session.queue_rx.is_empty() || session.scheduled.swap(true, Ordering::AcqRel) {
                return;
            }
        });
    }
}

impl Drop for TcpPayloadServer {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.accept_thread.take() {
            let _ = thread.join();
        }
        for session in self.sessions.lock().drain(..) {
            let _ = session.stream.lock().shutdown(std::net::Shutdown::Both);
        }
    }
}

fn accept_loop(
    listener: &TcpListener,
    sessions: &Mutex<Vec<Arc<Session>>>,
    running: &AtomicBool,
) {
    while running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    log::debug!("[TCP] set_nodelay failed: {}", e);
                }
                let (queue_tx, queue_rx) = unbounded();
                log::debug!("[TCP] subscriber session from {}", peer);
                sessions.lock().push(Arc::new(Session {
                    stream: Mutex::new(stream),
                    queue_tx,
                    queue_rx,
                    scheduled: AtomicBool::new(false),
                    dead: AtomicBool::new(false),
                    peer,
                }));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(e) => {
                log::debug!("[TCP] accept failed: {}", e);
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TCP_MAX_FRAME_SIZE;
    use crate::transport::tcp::read_frame;
    use std::net::TcpStream;
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
    fn fans_out_to_all_sessions() {
        let pool = DynamicThreadPool::new();
        let server = TcpPayloadServer::new(Arc::clone(&pool)).expect("server");

        let mut a = TcpStream::connect(("127.0.0.1", server.port())).expect("connect a");
        let mut b = TcpStream::connect(("127.0.0.1", server.port())).expect("connect b");
        assert!(wait_until(|| server.session_count() == 2, Duration::from_secs(2)));

        let header = PayloadHeader {
            flags: 0,
            payload_size: 5,
            data_clock: 3,
            send_timestamp_us: 0,
            sender_entity_id: 11,
        };
        server.send(&header, b"hello");

        for stream in [&mut a, &mut b] {
            let body = read_frame(stream, TCP_MAX_FRAME_SIZE)
                .expect("read")
                .expect("frame");
            let (decoded, header_size) = PayloadHeader::decode(&body).expect("header");
            assert_eq!(decoded.data_clock, 3);
            assert_eq!(&body[header_size..], b"hello");
        }

        pool.shutdown();
        pool.join();
    }

    #[test]
    fn dead_sessions_are_pruned() {
        let pool = DynamicThreadPool::new();
        let server = TcpPayloadServer::new(Arc::clone(&pool)).expect("server");

        let stream = TcpStream::connect(("127.0.0.1", server.port())).expect("connect");
        assert!(wait_until(|| server.session_count() == 1, Duration::from_secs(2)));
        drop(stream);

        let header = PayloadHeader {
            flags: 0,
            payload_size: 1,
            data_clock: 1,
            send_timestamp_us: 0,
            sender_entity_id: 1,
        };
        // First send discovers the broken pipe, a later one prunes it.
        assert!(wait_until(
            || {
                server.send(&header, b"x");
                server.session_count() == 0
            },
            Duration::from_secs(5)
        ));

        pool.shutdown();
        pool.join();
    }
}
