// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hipc contributors

//! Service client.
//!
//! Server instances are discovered through the registration plane; one
//! TCP session per instance, created lazily at the first call. Blocking
//! calls wait on a per-request channel; a deadline leaves the request in
//! flight and discards any late response.

use crate::core::runtime::{current_runtime, Runtime};
use crate::core::types::{
    ClientEntry, EntityId, EntityKey, EntityState, MethodInformation, RegistrationCmd, Sample,
    ServiceEntry, ServiceId,
};
use crate::error::{Error, Result};
use crate::pubsub::events::{EventCallbacks, EventToken};
use crate::registration::LocalEntity;
use crate::service::protocol::{
    decode_response, encode_request, read_frame, write_frame, RequestFrame, ResponseFrame,
    PROTOCOL_V0, PROTOCOL_V1,
};
use crate::service::{CallState, ServiceEvent};
use crossbeam::channel::{bounded, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::BufReader;
use std::net::TcpStream;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

/// Result of one service call against one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceResponse {
    pub server_id: Option<ServiceId>,
    pub call_state: CallState,
    pub error_msg: String,
    pub response: Vec<u8>,
}

impl ServiceResponse {
    fn failed(server_id: Option<ServiceId>, error_msg: String) -> Self {
        Self {
            server_id,
            call_state: CallState::Failed,
            error_msg,
            response: Vec::new(),
        }
    }
}

struct InstanceConn {
    server_id: ServiceId,
    endpoint: (String, u16),
    version: u8,
    stream: Mutex<Option<TcpStream>>,
    pending: Mutex<HashMap<u32, Sender<ResponseFrame>>>,
    next_request_id: AtomicU32,
    reader: Mutex<Option<JoinHandle<()>>>,
    client: Weak<ClientInner>,
}

impl InstanceConn {
    /// Connect if not yet connected and start the response reader.
    fn ensure_connected(self: &Arc<Self>) -> std::result::Result<(), String> {
        let mut stream_slot = self.stream.lock();
        if stream_slot.is_some() {
            return Ok(());
        }

        let stream = TcpStream::connect((self.endpoint.0.as_str(), self.endpoint.1))
            .map_err(|e| format!("connect to {}:{}: {}", self.endpoint.0, self.endpoint.1, e))?;
        let read_half = stream.try_clone().map_err(|e| e.to_string())?;
        *stream_slot = Some(stream);
        drop(stream_slot);

        let conn = Arc::downgrade(self);
        let reader = std::thread::Builder::new()
            .name("hipc-svc-client".to_string())
            .spawn(move || response_loop(read_half, &conn))
            .map_err(|e| e.to_string())?;
        *self.reader.lock() = Some(reader);

        if let Some(client) = self.client.upgrade() {
            client
                .events
                .notify(&ServiceEvent::Connected(self.server_id.clone()));
        }
        Ok(())
    }

    fn on_disconnect(&self) {
        let had_stream = self.stream.lock().take().is_some();
        // Fail everything still in flight.
        let pending: Vec<Sender<ResponseFrame>> =
            self.pending.lock().drain().map(|(_, tx)| tx).collect();
        for tx in pending {
            let _ = tx.send(ResponseFrame {
                version: self.version,
                request_id: 0,
                call_state: CallState::Failed,
                error_msg: "connection lost".to_string(),
                body: Vec::new(),
            });
        }
        if had_stream {
            if let Some(client) = self.client.upgrade() {
                client
                    .events
                    .notify(&ServiceEvent::Disconnected(self.server_id.clone()));
            }
        }
    }

    fn close(&self) {
        if let Some(stream) = self.stream.lock().take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        if let Some(reader) = self.reader.lock().take() {
            let _ = reader.join();
        }
    }

    fn call(self: &Arc<Self>, method: &str, request: &[u8], timeout: Option<Duration>) -> ServiceResponse {
        if let Err(e) = self.ensure_connected() {
            return ServiceResponse::failed(Some(self.server_id.clone()), e);
        }

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded(1);
        self.pending.lock().insert(request_id, tx);

        let frame = RequestFrame {
            version: self.version,
            request_id,
            method: method.to_string(),
            body: request.to_vec(),
        };

        {
            let mut stream_slot = self.stream.lock();
            let Some(stream) = stream_slot.as_mut() else {
                self.pending.lock().remove(&request_id);
                return ServiceResponse::failed(
                    Some(self.server_id.clone()),
                    "not connected".to_string(),
                );
            };
            if let Err(e) = write_frame(stream, &encode_request(&frame)) {
                drop(stream_slot);
                self.pending.lock().remove(&request_id);
                self.on_disconnect();
                return ServiceResponse::failed(Some(self.server_id.clone()), e.to_string());
            }
        }

        let received = match timeout {
            Some(timeout) => rx.recv_timeout(timeout).map_err(|_| ()),
            None => rx.recv().map_err(|_| ()),
        };

        match received {
            Ok(frame) => ServiceResponse {
                server_id: Some(self.server_id.clone()),
                call_state: frame.call_state,
                error_msg: frame.error_msg,
                response: frame.body,
            },
            Err(()) => {
                // Deadline elapsed: the request stays in flight on the
                // server, but its pending slot is gone, so a late
                // response is discarded by the reader.
                self.pending.lock().remove(&request_id);
                if let Some(client) = self.client.upgrade() {
                    client
                        .events
                        .notify(&ServiceEvent::Timeout(self.server_id.clone()));
                }
                ServiceResponse {
                    server_id: Some(self.server_id.clone()),
                    call_state: CallState::Timeouted,
                    error_msg: "call timeout".to_string(),
                    response: Vec::new(),
                }
            }
        }
    }
}

fn response_loop(stream: TcpStream, conn: &Weak<InstanceConn>) {
    let mut reader = BufReader::new(stream);
    loop {
        match read_frame(&mut reader) {
            Ok(Some(frame_bytes)) => {
                let Some(conn) = conn.upgrade() else {
                    return;
                };
                match decode_response(&frame_bytes) {
                    Ok(frame) => {
                        let tx = conn.pending.lock().remove(&frame.request_id);
                        match tx {
                            Some(tx) => {
                                let _ = tx.send(frame);
                            }
                            None => {
                                // Timed-out call; response dropped.
                                log::debug!(
                                    "[SVC] late response for request {} discarded",
                                    frame.request_id
                                );
                            }
                        }
                    }
                    Err(e) => {
                        log::debug!("[SVC] malformed response: {}", e);
                        conn.on_disconnect();
                        return;
                    }
                }
            }
            Ok(None) | Err(_) => {
                if let Some(conn) = conn.upgrade() {
                    conn.on_disconnect();
                }
                return;
            }
        }
    }
}

struct ClientInner {
    runtime: Arc<Runtime>,
    id: ServiceId,
    methods: Vec<MethodInformation>,
    events: EventCallbacks<ServiceEvent>,
    conns: Mutex<HashMap<ServiceId, Arc<InstanceConn>>>,
}

impl LocalEntity for ClientInner {
    fn registration_sample(&self) -> Sample {
        Sample {
            cmd: RegistrationCmd::Register,
            state: EntityState::Client(ClientEntry {
                id: self.id.clone(),
                methods: self.methods.clone(),
                protocol_version_max: PROTOCOL_V1,
            }),
        }
    }
}

/// Handle to one server instance.
#[derive(Clone)]
pub struct ClientInstance {
    server: ServiceEntry,
    conn: Arc<InstanceConn>,
    runtime: Arc<Runtime>,
}

impl ClientInstance {
    pub fn server_id(&self) -> &ServiceId {
        &self.server.id
    }

    /// Blocking call. On timeout the in-flight request is not cancelled;
    /// any late response is discarded and the returned response carries
    /// `CallState::Timeouted`.
    pub fn call_with_response(
        &self,
        method: &str,
        request: &[u8],
        timeout: Option<Duration>,
    ) -> ServiceResponse {
        self.conn.call(method, request, timeout)
    }

    /// Blocking call variant invoking `callback` with the outcome; a
    /// timed-out call still invokes the callback (with `Timeouted`).
    pub fn call_with_callback(
        &self,
        method: &str,
        request: &[u8],
        callback: impl FnOnce(&ServiceResponse),
        timeout: Option<Duration>,
    ) {
        let response = self.call_with_response(method, request, timeout);
        callback(&response);
    }

    /// Fire-and-forget variant; the callback runs on a pool worker.
    pub fn call_with_callback_async(
        &self,
        method: &str,
        request: &[u8],
        callback: impl FnOnce(&ServiceResponse) + Send + 'static,
    ) {
        let instance = self.clone();
        let method = method.to_string();
        let request = request.to_vec();
        self.runtime.service_pool().post(move || {
            let response = instance.call_with_response(&method, &request, None);
            callback(&response);
        });
    }
}

/// Handle to one service client.
pub struct ServiceClient {
    inner: Arc<ClientInner>,
}

impl ServiceClient {
    pub fn new(service_name: &str) -> Result<Self> {
        Self::with_methods(service_name, Vec::new())
    }

    /// Client declaring its method set (advertised via registration).
    pub fn with_methods(service_name: &str, methods: Vec<MethodInformation>) -> Result<Self> {
        let runtime = current_runtime()?;
        if service_name.is_empty() {
            return Err(Error::InvalidServiceName(service_name.to_string()));
        }

        let entity_id = EntityId::generate();
        let id = ServiceId {
            entity: EntityKey {
                entity_id,
                process_id: runtime.process_id(),
                host_name: runtime.host_name().to_string(),
            },
            service_name: service_name.to_string(),
        };

        let inner = Arc::new(ClientInner {
            runtime,
            id,
            methods,
            events: EventCallbacks::new(),
            conns: Mutex::new(HashMap::new()),
        });

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

    /// One handle per discovered server instance of this service.
    pub fn client_instances(&self) -> Vec<ClientInstance> {
        let servers = self
            .inner
            .runtime
            .descgate()
            .servers_for_service(&self.inner.id.service_name);

        let mut conns = self.inner.conns.lock();
        // Forget connections to vanished instances.
        conns.retain(|id, conn| {
            let alive = servers.iter().any(|s| s.id == *id);
            if !alive {
                conn.close();
            }
            alive
        });

        servers
            .into_iter()
            .map(|server| {
                let conn = conns
                    .entry(server.id.clone())
                    .or_insert_with(|| {
                        // Highest common protocol version: v1 when the
                        // server advertises a v1 port, else v0.
                        let (port, version) = if server.port_v1 != 0 {
                            (server.port_v1, PROTOCOL_V1)
                        } else {
                            (server.port_v0, PROTOCOL_V0)
                        };
                        Arc::new(InstanceConn {
                            server_id: server.id.clone(),
                            endpoint: (server.host.clone(), port),
                            version,
                            stream: Mutex::new(None),
                            pending: Mutex::new(HashMap::new()),
                            next_request_id: AtomicU32::new(1),
                            reader: Mutex::new(None),
                            client: Arc::downgrade(&self.inner),
                        })
                    })
                    .clone();
                ClientInstance {
                    server,
                    conn,
                    runtime: Arc::clone(&self.inner.runtime),
                }
            })
            .collect()
    }

    /// Whether any server instance is currently discovered.
    pub fn is_connected(&self) -> bool {
        !self
            .inner
            .runtime
            .descgate()
            .servers_for_service(&self.inner.id.service_name)
            .is_empty()
    }

    /// Fan a blocking call out to every instance and aggregate the
    /// responses. The instances are called in parallel, so the total
    /// blocking time is bounded by the slowest (or the timeout), not the
    /// sum.
    pub fn call_with_response(
        &self,
        method: &str,
        request: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Vec<ServiceResponse>> {
        let instances = self.client_instances();
        if instances.is_empty() {
            return Err(Error::ServiceUnavailable(
                self.inner.id.service_name.clone(),
            ));
        }

        let (tx, rx) = bounded(instances.len());
        let count = instances.len();
        for instance in instances {
            let tx = tx.clone();
            let method = method.to_string();
            let request = request.to_vec();
            self.inner.runtime.service_pool().post(move || {
                let _ = tx.send(instance.call_with_response(&method, &request, timeout));
            });
        }
        drop(tx);

        let mut responses = Vec::with_capacity(count);
        for _ in 0..count {
            match rx.recv() {
                Ok(response) => responses.push(response),
                Err(_) => break,
            }
        }
        Ok(responses)
    }

    /// Fan a call out to every instance, invoking `callback` once per
    /// instance; blocks until every callback has run or timed out.
    pub fn call_with_callback(
        &self,
        method: &str,
        request: &[u8],
        callback: impl Fn(&ServiceResponse) + Send + Sync,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let responses = self.call_with_response(method, request, timeout)?;
        for response in &responses {
            callback(response);
        }
        Ok(())
    }

    pub fn add_event_callback(
        &self,
        cb: Arc<dyn Fn(&ServiceEvent) + Send + Sync>,
    ) -> EventToken {
        self.inner.events.add(cb)
    }

    pub fn rem_event_callback(&self, token: EventToken) {
        self.inner.events.remove(token);
    }
}

impl Drop for ServiceClient {
    fn drop(&mut self) {
        for (_, conn) in self.inner.conns.lock().drain() {
            conn.close();
        }
        let sample = Sample {
            cmd: RegistrationCmd::Unregister,
            state: EntityState::Client(ClientEntry {
                id: self.inner.id.clone(),
                methods: self.inner.methods.clone(),
                protocol_version_max: PROTOCOL_V1,
            }),
        };
        self.inner
            .runtime
            .provider()
            .unregister_entity(self.inner.id.entity.entity_id, &sample);
    }
}
