// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hipc contributors

//! Core identity and registration entry types.
//!
//! Every publisher, subscriber, server and client is an *entity*. An
//! [`EntityId`] is unique within its owning process; together with the
//! process id and host name it forms the globally unique [`EntityKey`].
//! Registration entries ([`PublisherEntry`], [`SubscriberEntry`],
//! [`ServiceEntry`], [`ClientEntry`]) describe the current state of one
//! entity and travel inside [`Sample`] records on the registration bus.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Entity id, unique within a (host, process).
///
/// Drawn from a process-local counter seeded with startup entropy so ids
/// from short-lived processes restarted in place do not collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct EntityId(pub u64);

impl EntityId {
    /// Allocate the next entity id for this process.
    pub fn generate() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        static SEED: AtomicU64 = AtomicU64::new(0);

        if SEED.load(AtomicOrdering::Relaxed) == 0 {
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(1);
            // Keep the low 16 bits free for the counter
            let seed = (nanos | 1) << 16;
            let _ = SEED.compare_exchange(
                0,
                seed,
                AtomicOrdering::Relaxed,
                AtomicOrdering::Relaxed,
            );
        }

        let seed = SEED.load(AtomicOrdering::Relaxed);
        Self(seed.wrapping_add(NEXT.fetch_add(1, AtomicOrdering::Relaxed)))
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Globally unique entity identification triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct EntityKey {
    pub entity_id: EntityId,
    pub process_id: i32,
    pub host_name: String,
}

/// Topic-scoped entity id (publisher or subscriber).
///
/// Ordering is lexicographic on (entity_id, topic_name), with the rest of
/// the entity triple as tie breaker so the order stays total.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicId {
    pub entity: EntityKey,
    pub topic_name: String,
}

impl PartialOrd for TopicId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TopicId {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.entity.entity_id, &self.topic_name)
            .cmp(&(other.entity.entity_id, &other.topic_name))
            .then_with(|| self.entity.process_id.cmp(&other.entity.process_id))
            .then_with(|| self.entity.host_name.cmp(&other.entity.host_name))
    }
}

/// Service-scoped entity id (server or client).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceId {
    pub entity: EntityKey,
    pub service_name: String,
}

impl PartialOrd for ServiceId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ServiceId {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.entity.entity_id, &self.service_name)
            .cmp(&(other.entity.entity_id, &other.service_name))
            .then_with(|| self.entity.process_id.cmp(&other.entity.process_id))
            .then_with(|| self.entity.host_name.cmp(&other.entity.host_name))
    }
}

/// Datatype description attached to topics and service methods.
///
/// `encoding` is an opaque tag ("proto", "capnp", "raw", ...); `descriptor`
/// is an opaque blob whose interpretation is encoding specific.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct DataTypeInformation {
    pub name: String,
    pub encoding: String,
    pub descriptor: Vec<u8>,
}

impl DataTypeInformation {
    pub fn raw(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            encoding: "raw".to_string(),
            descriptor: Vec::new(),
        }
    }
}

/// Payload transport layers, in no particular order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportLayer {
    Shm,
    Udp,
    Tcp,
}

impl std::fmt::Display for TransportLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportLayer::Shm => write!(f, "shm"),
            TransportLayer::Udp => write!(f, "udp"),
            TransportLayer::Tcp => write!(f, "tcp"),
        }
    }
}

/// Per-layer connection parameters a publisher advertises.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvertisedLayer {
    /// Memfile names the subscriber attaches to (same host only).
    Shm { memfile_names: Vec<String> },
    /// Derived multicast group/port the payload is sent on.
    Udp { group: String, port: u16 },
    /// Host/port of the publisher's payload listener.
    Tcp { host: String, port: u16 },
}

impl AdvertisedLayer {
    pub fn layer(&self) -> TransportLayer {
        match self {
            AdvertisedLayer::Shm { .. } => TransportLayer::Shm,
            AdvertisedLayer::Udp { .. } => TransportLayer::Udp,
            AdvertisedLayer::Tcp { .. } => TransportLayer::Tcp,
        }
    }
}

/// Live counters refreshed with every registration tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TopicCounters {
    /// Total payload bytes sent/received.
    pub bytes: u64,
    /// Current data clock (per-publisher sequence number).
    pub data_clock: u64,
    /// Send/receive frequency in mHz.
    pub data_frequency: u32,
    /// Messages lost, derived from data clock gaps.
    pub message_drops: u64,
}

/// Registration state of one publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherEntry {
    pub id: TopicId,
    pub datatype: DataTypeInformation,
    pub layers: Vec<AdvertisedLayer>,
    pub counters: TopicCounters,
}

impl PublisherEntry {
    pub fn layer_params(&self, layer: TransportLayer) -> Option<&AdvertisedLayer> {
        self.layers.iter().find(|l| l.layer() == layer)
    }
}

/// Registration state of one subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberEntry {
    pub id: TopicId,
    pub datatype: DataTypeInformation,
    /// Layers this subscriber is able to receive on.
    pub layers: Vec<TransportLayer>,
    pub counters: TopicCounters,
}

/// Description of one service method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInformation {
    pub name: String,
    pub request_type: DataTypeInformation,
    pub response_type: DataTypeInformation,
    pub call_count: u64,
}

impl MethodInformation {
    pub fn untyped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            request_type: DataTypeInformation::default(),
            response_type: DataTypeInformation::default(),
            call_count: 0,
        }
    }
}

/// Registration state of one service server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEntry {
    pub id: ServiceId,
    pub methods: Vec<MethodInformation>,
    /// Address clients connect to.
    pub host: String,
    /// Listener port for protocol v0.
    pub port_v0: u16,
    /// Listener port for protocol v1.
    pub port_v1: u16,
}

/// Registration state of one service client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientEntry {
    pub id: ServiceId,
    pub methods: Vec<MethodInformation>,
    /// Highest service protocol version the client speaks.
    pub protocol_version_max: u8,
}

/// Registration command kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationCmd {
    Register,
    Unregister,
}

/// State of the entity a sample describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityState {
    Publisher(PublisherEntry),
    Subscriber(SubscriberEntry),
    Server(ServiceEntry),
    Client(ClientEntry),
}

impl EntityState {
    /// The entity identification triple of the carried entry.
    pub fn entity_key(&self) -> &EntityKey {
        match self {
            EntityState::Publisher(e) => &e.id.entity,
            EntityState::Subscriber(e) => &e.id.entity,
            EntityState::Server(e) => &e.id.entity,
            EntityState::Client(e) => &e.id.entity,
        }
    }
}

/// One registration record describing the current state of a single entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub cmd: RegistrationCmd,
    pub state: EntityState,
}
