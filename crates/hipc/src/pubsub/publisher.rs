// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hipc contributors

//! Publisher core.
//!
//! A publisher owns its transport writers and dispatches every payload to
//! the enabled layers in priority order: the local priority list serves
//! subscribers on this host, the remote list serves other hosts. Layer
//! selection only considers layers some connected subscriber can actually
//! receive on.

use crate::config::PublisherConfiguration;
use crate::core::process;
use crate::core::runtime::{current_runtime, Runtime};
use crate::core::types::{
    AdvertisedLayer, DataTypeInformation, EntityId, EntityKey, EntityState, PublisherEntry,
    RegistrationCmd, Sample, TopicCounters, TopicId, TransportLayer,
};
use crate::error::{Error, Result};
use crate::pubsub::counters::FrequencyCalculator;
use crate::pubsub::events::{EventCallbacks, EventToken};
use crate::pubsub::payload::{BufferPayloadWriter, PayloadWriter};
use crate::registration::{CallbackToken, LocalEntity, RegistrationEventType};
use crate::transport::shm::ShmWriter;
use crate::transport::tcp::TcpPayloadServer;
use crate::transport::udp::UdpSender;
use crate::transport::PayloadHeader;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Connection transitions reported to publisher event callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublisherEvent {
    /// A matching subscriber appeared.
    Connected(TopicId),
    /// A matching subscriber disappeared (unregister or timeout).
    Disconnected(TopicId),
    /// A connected subscriber reported message drops.
    Dropped(TopicId),
}

#[derive(Clone)]
struct ConnState {
    local: bool,
    shm: bool,
    udp: bool,
    tcp: bool,
    last_drops: u64,
}

struct PublisherInner {
    runtime: Arc<Runtime>,
    id: TopicId,
    datatype: DataTypeInformation,
    config: PublisherConfiguration,
    loopback: bool,

    data_clock: AtomicU64,
    bytes_sent: AtomicU64,
    frequency: Mutex<FrequencyCalculator>,

    shm: Option<Mutex<ShmWriter>>,
    udp: Option<UdpSender>,
    tcp: Option<TcpPayloadServer>,
    tcp_host: String,

    connections: RwLock<HashMap<TopicId, ConnState>>,
    events: EventCallbacks<PublisherEvent>,
    gate_token: Mutex<Option<CallbackToken>>,
}

/// Handle to one publisher. Dropping it emits the unregister sample and
/// tears the transports down deterministically.
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

/// Builder for [`Publisher`].
pub struct PublisherBuilder {
    topic_name: String,
    datatype: DataTypeInformation,
    config: Option<PublisherConfiguration>,
}

impl PublisherBuilder {
    pub fn datatype(mut self, datatype: DataTypeInformation) -> Self {
        self.datatype = datatype;
        self
    }

    pub fn config(mut self, config: PublisherConfiguration) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> Result<Publisher> {
        let runtime = current_runtime()?;
        if self.topic_name.is_empty() {
            return Err(Error::InvalidTopicName(self.topic_name));
        }
        let config = self
            .config
            .unwrap_or_else(|| runtime.config().publisher.clone());
        config.validate()?;

        let entity_id = EntityId::generate();
        let id = TopicId {
            entity: EntityKey {
                entity_id,
                process_id: runtime.process_id(),
                host_name: runtime.host_name().to_string(),
            },
            topic_name: self.topic_name,
        };

        // A layer that fails to initialize disables itself; construction
        // only fails when no enabled layer came up at all.
        let mut enabled_layers = 0usize;
        let mut last_error: Option<Error> = None;

        let shm = if config.layer.shm.enable {
            enabled_layers += 1;
            let domain = runtime.config().registration.shm_transport_domain.clone();
            match ShmWriter::new(&domain, entity_id.0, config.layer.shm.clone()) {
                Ok(writer) => Some(Mutex::new(writer)),
                Err(e) => {
                    log::warn!("[PUB] shm layer disabled for {:?}: {}", id.topic_name, e);
                    last_error = Some(e.into());
                    None
                }
            }
        } else {
            None
        };
        let udp = if config.layer.udp.enable {
            enabled_layers += 1;
            match UdpSender::new(&runtime.config().transport.udp, &id.topic_name, entity_id.0) {
                Ok(sender) => Some(sender),
                Err(e) => {
                    log::warn!("[PUB] udp layer disabled for {:?}: {}", id.topic_name, e);
                    last_error = Some(Error::BindFailed(e.to_string()));
                    None
                }
            }
        } else {
            None
        };
        let tcp = if config.layer.tcp.enable {
            enabled_layers += 1;
            match TcpPayloadServer::new(Arc::clone(runtime.writer_pool())) {
                Ok(server) => Some(server),
                Err(e) => {
                    log::warn!("[PUB] tcp layer disabled for {:?}: {}", id.topic_name, e);
                    last_error = Some(Error::BindFailed(e.to_string()));
                    None
                }
            }
        } else {
            None
        };

        if enabled_layers > 0 && shm.is_none() && udp.is_none() && tcp.is_none() {
            // Every enabled transport failed: the handle would be mute.
            return Err(last_error.unwrap_or(Error::SendFailed(
                "no transport layer available".to_string(),
            )));
        }

        let tcp_host = if runtime.config().registration.network_enabled {
            crate::transport::udp::primary_interface_ip().to_string()
        } else {
            "127.0.0.1".to_string()
        };

        let inner = Arc::new(PublisherInner {
            loopback: runtime.config().registration.loopback,
            runtime,
            id,
            datatype: self.datatype,
            config,
            data_clock: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            frequency: Mutex::new(FrequencyCalculator::default()),
            shm,
            udp,
            tcp,
            tcp_host,
            connections: RwLock::new(HashMap::new()),
            events: EventCallbacks::new(),
            gate_token: Mutex::new(None),
        });

        // Watch subscriber registrations for connection tracking.
        let weak = Arc::downgrade(&inner);
        let token = inner.runtime.descgate().add_subscriber_event_callback(Arc::new(
            move |id: &TopicId, _event: RegistrationEventType| {
                if let Some(inner) = weak.upgrade() {
                    if id.topic_name == inner.id.topic_name {
                        inner.update_connections();
                    }
                }
            },
        ));
        *inner.gate_token.lock() = Some(token);
        inner.update_connections();

        // Announce: applied locally and emitted immediately, refreshed on
        // every tick from then on.
        inner
            .runtime
            .provider()
            .register_entity(entity_id, Arc::clone(&inner) as Arc<dyn LocalEntity>);

        Ok(Publisher { inner })
    }
}

impl Publisher {
    /// Publisher with default configuration and a raw datatype.
    pub fn new(topic_name: &str) -> Result<Self> {
        Self::builder(topic_name).build()
    }

    pub fn builder(topic_name: &str) -> PublisherBuilder {
        PublisherBuilder {
            topic_name: topic_name.to_string(),
            datatype: DataTypeInformation::raw(""),
            config: None,
        }
    }

    pub fn id(&self) -> &TopicId {
        &self.inner.id
    }

    pub fn topic_name(&self) -> &str {
        &self.inner.id.topic_name
    }

    pub fn datatype(&self) -> &DataTypeInformation {
        &self.inner.datatype
    }

    /// Current data clock (frames sent so far).
    pub fn data_clock(&self) -> u64 {
        self.inner.data_clock.load(Ordering::Relaxed)
    }

    /// Whether any matching subscriber is connected.
    pub fn is_connected(&self) -> bool {
        !self.inner.connections.read().is_empty()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.read().len()
    }

    /// Send a payload with the runtime clock as timestamp.
    pub fn send(&self, data: &[u8]) -> Result<usize> {
        self.send_with_timestamp(data, -1)
    }

    /// Send a payload; `timestamp_us < 0` selects the runtime clock.
    pub fn send_with_timestamp(&self, data: &[u8], timestamp_us: i64) -> Result<usize> {
        let mut writer = BufferPayloadWriter::new(data);
        self.inner.send_payload(&mut writer, timestamp_us)
    }

    /// Send a payload produced in place by `writer` (zero-copy SHM path).
    pub fn send_payload(&self, writer: &mut dyn PayloadWriter) -> Result<usize> {
        self.inner.send_payload(writer, -1)
    }

    pub fn add_event_callback(
        &self,
        cb: Arc<dyn Fn(&PublisherEvent) + Send + Sync>,
    ) -> EventToken {
        self.inner.events.add(cb)
    }

    pub fn rem_event_callback(&self, token: EventToken) {
        self.inner.events.remove(token);
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        if let Some(token) = self.inner.gate_token.lock().take() {
            self.inner
                .runtime
                .descgate()
                .rem_subscriber_event_callback(token);
        }
        // The unregister sample leaves before drop returns.
        let sample = Sample {
            cmd: RegistrationCmd::Unregister,
            state: EntityState::Publisher(self.inner.entry_snapshot()),
        };
        self.inner
            .runtime
            .provider()
            .unregister_entity(self.inner.id.entity.entity_id, &sample);
    }
}

impl PublisherInner {
    fn entry_snapshot(&self) -> PublisherEntry {
        let mut layers = Vec::new();
        if let Some(shm) = &self.shm {
            layers.push(AdvertisedLayer::Shm {
                memfile_names: shm.lock().memfile_names(),
            });
        }
        if let Some(udp) = &self.udp {
            let dest = udp.destination();
            layers.push(AdvertisedLayer::Udp {
                group: dest.ip().to_string(),
                port: dest.port(),
            });
        }
        if let Some(tcp) = &self.tcp {
            layers.push(AdvertisedLayer::Tcp {
                host: self.tcp_host.clone(),
                port: tcp.port(),
            });
        }

        let mut datatype = self.datatype.clone();
        if !self.config.share_topic_type {
            datatype.name = String::new();
            datatype.encoding = String::new();
        }
        if !self.config.share_topic_description {
            datatype.descriptor = Vec::new();
        }

        PublisherEntry {
            id: self.id.clone(),
            datatype,
            layers,
            counters: TopicCounters {
                bytes: self.bytes_sent.load(Ordering::Relaxed),
                data_clock: self.data_clock.load(Ordering::Relaxed),
                data_frequency: self.frequency.lock().rate_mhz(Instant::now()),
                message_drops: 0,
            },
        }
    }

    /// Re-derive the connection set from the registry and fire events for
    /// the transitions.
    fn update_connections(&self) {
        let subs = self
            .runtime
            .descgate()
            .subscribers_for_topic(&self.id.topic_name);
        let own_host = self.runtime.host_name();
        let own_pid = self.runtime.process_id();

        let mut next: HashMap<TopicId, ConnState> = HashMap::new();
        for entry in subs {
            let process_local =
                entry.id.entity.process_id == own_pid && entry.id.entity.host_name == own_host;
            if process_local && !self.loopback {
                continue;
            }
            next.insert(
                entry.id.clone(),
                ConnState {
                    local: entry.id.entity.host_name == own_host,
                    shm: entry.layers.contains(&TransportLayer::Shm),
                    udp: entry.layers.contains(&TransportLayer::Udp),
                    tcp: entry.layers.contains(&TransportLayer::Tcp),
                    last_drops: entry.counters.message_drops,
                },
            );
        }

        let mut fired = Vec::new();
        {
            let mut connections = self.connections.write();
            for (id, state) in &next {
                match connections.get(id) {
                    None => fired.push(PublisherEvent::Connected(id.clone())),
                    Some(old) if state.last_drops > old.last_drops => {
                        fired.push(PublisherEvent::Dropped(id.clone()));
                    }
                    Some(_) => {}
                }
            }
            for id in connections.keys() {
                if !next.contains_key(id) {
                    fired.push(PublisherEvent::Disconnected(id.clone()));
                }
            }
            *connections = next;
        }
        for event in fired {
            log::debug!("[PUB] {:?} event {:?}", self.id.topic_name, event);
            self.events.notify(&event);
        }
    }

    /// Layers to use for this send: highest-priority local layer some
    /// local subscriber receives on, plus the remote counterpart.
    fn select_layers(&self) -> Vec<TransportLayer> {
        let connections = self.connections.read();
        let mut selected = Vec::new();

        let receivable = |layer: TransportLayer, local: bool| {
            connections.values().any(|c| {
                c.local == local
                    && match layer {
                        TransportLayer::Shm => c.shm,
                        TransportLayer::Udp => c.udp,
                        TransportLayer::Tcp => c.tcp,
                    }
            })
        };
        let enabled = |layer: TransportLayer| match layer {
            TransportLayer::Shm => self.shm.is_some(),
            TransportLayer::Udp => self.udp.is_some(),
            TransportLayer::Tcp => self.tcp.is_some(),
        };

        if connections.values().any(|c| c.local) {
            for layer in &self.config.layer_priority_local {
                if enabled(*layer) && receivable(*layer, true) {
                    selected.push(*layer);
                    break;
                }
            }
        }
        if connections.values().any(|c| !c.local) {
            for layer in &self.config.layer_priority_remote {
                if enabled(*layer) && receivable(*layer, false) && !selected.contains(layer) {
                    selected.push(*layer);
                    break;
                }
            }
        }
        selected
    }

    fn send_payload(&self, writer: &mut dyn PayloadWriter, timestamp_us: i64) -> Result<usize> {
        let size = writer.size();
        let timestamp_us = if timestamp_us >= 0 {
            timestamp_us
        } else {
            process::clock_micros()
        };
        let clock = self.data_clock.fetch_add(1, Ordering::Relaxed) + 1;
        let header = PayloadHeader {
            flags: 0,
            payload_size: size as u64,
            data_clock: clock,
            send_timestamp_us: timestamp_us,
            sender_entity_id: self.id.entity.entity_id.0,
        };

        let selected = self.select_layers();
        self.bytes_sent.fetch_add(size as u64, Ordering::Relaxed);
        self.frequency.lock().tick(Instant::now());

        if selected.is_empty() {
            // No connected subscriber: the payload is accepted and gone.
            return Ok(size);
        }

        // Non-SHM layers need the payload materialized once.
        let materialized = if selected.iter().any(|l| *l != TransportLayer::Shm) {
            let mut buf = vec![0u8; size];
            if !writer.write_full(&mut buf) {
                return Err(Error::SendFailed("payload writer failed".to_string()));
            }
            Some(buf)
        } else {
            None
        };

        let mut delivered = 0usize;
        let mut last_error = String::new();
        for layer in &selected {
            let ok = match layer {
                TransportLayer::Shm => self.send_shm(&header, writer, &mut last_error),
                TransportLayer::Udp => {
                    let data = materialized.as_deref().unwrap_or(&[]);
                    match self.udp.as_ref() {
                        Some(udp) => match udp.send(&header, data) {
                            Ok(()) => true,
                            Err(e) => {
                                last_error = e.to_string();
                                false
                            }
                        },
                        None => false,
                    }
                }
                TransportLayer::Tcp => {
                    let data = materialized.as_deref().unwrap_or(&[]);
                    match self.tcp.as_ref() {
                        Some(tcp) => {
                            tcp.send(&header, data);
                            true
                        }
                        None => false,
                    }
                }
            };
            if ok {
                delivered += 1;
            }
        }

        if delivered > 0 {
            Ok(size)
        } else {
            Err(Error::SendFailed(last_error))
        }
    }

    fn send_shm(
        &self,
        header: &PayloadHeader,
        writer: &mut dyn PayloadWriter,
        last_error: &mut String,
    ) -> bool {
        let Some(shm) = &self.shm else {
            return false;
        };
        let local_readers = {
            let connections = self.connections.read();
            connections.values().filter(|c| c.local && c.shm).count() as u32
        };

        let mut shm = shm.lock();
        match shm.ensure_capacity(header.payload_size as usize) {
            Ok(true) => {
                // Names changed: subscribers must re-attach before the
                // next frame reaches them.
                self.runtime.provider().trigger_refresh();
            }
            Ok(false) => {}
            Err(e) => {
                *last_error = e.to_string();
                return false;
            }
        }

        match shm.write(header, local_readers, |buf| writer.write_full(buf)) {
            Ok(()) => true,
            Err(e) => {
                *last_error = e.to_string();
                log::debug!("[SHM] write failed on {:?}: {}", self.id.topic_name, e);
                false
            }
        }
    }
}

impl LocalEntity for PublisherInner {
    fn registration_sample(&self) -> Sample {
        // Piggyback on the refresh tick to pick up entry updates that do
        // not fire new/deleted events (counters, layer parameter changes).
        self.update_connections();
        Sample {
            cmd: RegistrationCmd::Register,
            state: EntityState::Publisher(self.entry_snapshot()),
        }
    }
}
