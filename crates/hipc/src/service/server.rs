// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hipc contributors

//! Service server.
//!
//! Listens on two ephemeral ports (protocol v0 and v1, both advertised
//! via registration) and accepts arbitrary concurrent clients. Each
//! connection gets a reader thread; method callbacks and response writes
//! run on the shared dynamic thread pool. There is no per-method
//! queueing; the pool bounds parallelism.

use crate::core::runtime::{current_runtime, Runtime};
use crate::core::types::{
    EntityId, EntityKey, EntityState, MethodInformation, RegistrationCmd, Sample, ServiceEntry,
    ServiceId,
};
use crate::error::{Error, Result};
use crate::registration::LocalEntity;
use crate::service::protocol::{
    decode_request, encode_response, read_frame, write_frame, ResponseFrame, PROTOCOL_V1,
};
use crate::service::{CallState, MethodCallback};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

struct MethodSlot {
    info: MethodInformation,
    calls: Arc<AtomicU64>,
    callback: MethodCallback,
}

struct ServerInner {
    runtime: Arc<Runtime>,
    id: ServiceId,
    methods: RwLock<HashMap<String, MethodSlot>>,
    host: String,
    port_v0: u16,
    port_v1: u16,
    running: Arc<AtomicBool>,
    accept_threads: Mutex<Vec<JoinHandle<()>>>,
    connection_threads: Mutex<Vec<JoinHandle<()>>>,
    /// Read ends of open connections, shut down on drop to release the
    /// reader threads.
    connections: Mutex<Vec<TcpStream>>,
}

/// Handle to one service server.
pub struct ServiceServer {
    inner: Arc<ServerInner>,
}

impl ServiceServer {
    pub fn new(service_name: &str) -> Result<Self> {
        let runtime = current_runtime()?;
        if service_name.is_empty() {
            return Err(Error::InvalidServiceName(service_name.to_string()));
        }

        let listener_v0 = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))
            .map_err(|e| Error::BindFailed(e.to_string()))?;
        let listener_v1 = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))
            .map_err(|e| Error::BindFailed(e.to_string()))?;
        let port_v0 = listener_v0.local_addr()?.port();
        let port_v1 = listener_v1.local_addr()?.port();

        let entity_id = EntityId::generate();
        let id = ServiceId {
            entity: EntityKey {
                entity_id,
                process_id: runtime.process_id(),
                host_name: runtime.host_name().to_string(),
            },
            service_name: service_name.to_string(),
        };
        let host = if runtime.config().registration.network_enabled {
            crate::transport::udp::primary_interface_ip().to_string()
        } else {
            "127.0.0.1".to_string()
        };

        let inner = Arc::new(ServerInner {
            runtime,
            id,
            methods: RwLock::new(HashMap::new()),
            host,
            port_v0,
            port_v1,
            running: Arc::new(AtomicBool::new(true)),
            accept_threads: Mutex::new(Vec::new()),
            connection_threads: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
        });

        for listener in [listener_v0, listener_v1] {
            listener.set_nonblocking(true)?;
            let weak = Arc::downgrade(&inner);
            let running = Arc::clone(&inner.running);
            let thread = std::thread::Builder::new()
                .name("hipc-svc-accept".to_string())
                .spawn(move || accept_loop(&listener, &weak, &running))?;
            inner.accept_threads.lock().push(thread);
        }

        log::debug!(
            "[SVC] server {:?} listening on v0:{} v1:{}",
            service_name,
            port_v0,
            port_v1
        );

        inner
            .runtime
            .provider()
            .register_entity(entity_id, Arc::clone(&inner) as Arc<dyn LocalEntity>);

        Ok(Self { inner })
    }

    pub fn id(&self) -> &ServiceId {
        &self.inner.id
    }

    pub fn service_name(&self) -> &str {
        &self.inner.id.service_name
    }

    /// Register (or replace) a method.
    pub fn set_method_callback(&self, info: MethodInformation, callback: MethodCallback) {
        self.inner.methods.write().insert(
            info.name.clone(),
            MethodSlot {
                info,
                calls: Arc::new(AtomicU64::new(0)),
                callback,
            },
        );
    }

    pub fn remove_method_callback(&self, name: &str) {
        self.inner.methods.write().remove(name);
    }

    /// Advertised (v0, v1) listener ports.
    pub fn ports(&self) -> (u16, u16) {
        (self.inner.port_v0, self.inner.port_v1)
    }
}

impl Drop for ServiceServer {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::Release);
        // Accept threads first, so every accepted connection is already
        // in the list when the shutdown sweep runs.
        for thread in self.inner.accept_threads.lock().drain(..) {
            let _ = thread.join();
        }
        for stream in self.inner.connections.lock().drain(..) {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        for thread in self.inner.connection_threads.lock().drain(..) {
            let _ = thread.join();
        }
        let sample = Sample {
            cmd: RegistrationCmd::Unregister,
            state: EntityState::Server(self.inner.entry_snapshot()),
        };
        self.inner
            .runtime
            .provider()
            .unregister_entity(self.inner.id.entity.entity_id, &sample);
    }
}

impl ServerInner {
    fn entry_snapshot(&self) -> ServiceEntry {
        let methods = self
            .methods
            .read()
            .values()
            .map(|slot| MethodInformation {
                call_count: slot.calls.load(Ordering::Relaxed),
                ..slot.info.clone()
            })
            .collect();
        ServiceEntry {
            id: self.id.clone(),
            methods,
            host: self.host.clone(),
            port_v0: self.port_v0,
            port_v1: self.port_v1,
        }
    }

    fn execute(&self, method: &str, body: &[u8], request_id: u32, version: u8) -> ResponseFrame {
        let slot = {
            let methods = self.methods.read();
            methods
                .get(method)
                .map(|s| (Arc::clone(&s.callback), Arc::clone(&s.calls)))
        };

        match slot {
            None => ResponseFrame {
                version,
                request_id,
                call_state: CallState::Failed,
                error_msg: format!("method {:?} not found", method),
                body: Vec::new(),
            },
            Some((callback, calls)) => {
                calls.fetch_add(1, Ordering::Relaxed);
                // User callback runs outside the method table lock.
                match callback(body) {
                    Ok(response) => ResponseFrame {
                        version,
                        request_id,
                        call_state: CallState::Executed,
                        error_msg: String::new(),
                        body: response,
                    },
                    Err(error_msg) => ResponseFrame {
                        version,
                        request_id,
                        call_state: CallState::Failed,
                        error_msg,
                        body: Vec::new(),
                    },
                }
            }
        }
    }
}

impl LocalEntity for ServerInner {
    fn registration_sample(&self) -> Sample {
        Sample {
            cmd: RegistrationCmd::Register,
            state: EntityState::Server(self.entry_snapshot()),
        }
    }
}

fn accept_loop(listener: &TcpListener, inner: &Weak<ServerInner>, running: &AtomicBool) {
    while running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let Some(server) = inner.upgrade() else {
                    return;
                };
                log::debug!("[SVC] client connection from {}", peer);
                if let Ok(clone) = stream.try_clone() {
                    server.connections.lock().push(clone);
                }
                let weak = Weak::clone(inner);
                let thread = std::thread::Builder::new()
                    .name("hipc-svc-conn".to_string())
                    .spawn(move || connection_loop(stream, &weak));
                match thread {
                    Ok(handle) => server.connection_threads.lock().push(handle),
                    Err(e) => log::debug!("[SVC] connection thread spawn failed: {}", e),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(e) => {
                log::debug!("[SVC] accept failed: {}", e);
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

/// Read requests from one client connection; every request is dispatched
/// to a pool worker which runs the method callback and writes the
/// response (request ids keep responses correlated even when the pool
/// reorders them).
fn connection_loop(mut stream: TcpStream, inner: &Weak<ServerInner>) {
    let writer = match stream.try_clone() {
        Ok(clone) => Arc::new(Mutex::new(clone)),
        Err(e) => {
            log::debug!("[SVC] connection clone failed: {}", e);
            return;
        }
    };

    loop {
        let frame = match read_frame(&mut stream) {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                log::debug!("[SVC] connection read failed: {}", e);
                return;
            }
        };

        let Some(server) = inner.upgrade() else {
            return;
        };
        if !server.running.load(Ordering::Acquire) {
            return;
        }

        let request = match decode_request(&frame) {
            Ok(request) => request,
            Err(e) => {
                log::debug!("[SVC] malformed request: {}", e);
                return;
            }
        };

        let weak = Weak::clone(inner);
        let writer = Arc::clone(&writer);
        server.runtime.service_pool().post(move || {
            let Some(server) = weak.upgrade() else {
                return;
            };
            // The response speaks whatever version the request came in
            // with, capped at what we support.
            let version = request.version.min(PROTOCOL_V1);
            let response =
                server.execute(&request.method, &request.body, request.request_id, version);
            let mut stream = writer.lock();
            if let Err(e) = write_frame(&mut *stream, &encode_response(&response)) {
                log::debug!("[SVC] response write failed: {}", e);
            }
        });
    }
}
